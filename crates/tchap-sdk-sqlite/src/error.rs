// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use deadpool_sqlite::{CreatePoolError, PoolError};
use tchap_sdk_base::store::StoreError;
use thiserror::Error;
use tokio::io;

/// All the errors that can occur when opening a sqlite store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpenStoreError {
    /// Failed to create the DB's parent directory.
    #[error("Failed to create the database's parent directory")]
    CreateDir(#[source] io::Error),

    /// Failed to create the DB pool.
    #[error(transparent)]
    CreatePool(#[from] CreatePoolError),

    /// Failed to apply migrations.
    #[error("Failed to run migrations")]
    Migration(#[source] rusqlite::Error),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Failed to load the database's version.
    #[error("Failed to load database version")]
    LoadVersion(#[source] rusqlite::Error),

    /// The version of the database is missing.
    #[error("Missing database version")]
    MissingVersion,

    /// The version of the database is invalid.
    #[error("Invalid database version")]
    InvalidVersion,

    /// Any other store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<Error> for OpenStoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Sqlite(error) => Self::Migration(error),
            Error::Pool(error) => Self::Pool(error),
            other => Self::Store(other.into()),
        }
    }
}

/// The error type of [`SqliteStateStore`](crate::SqliteStateStore)'s
/// [`StateStore`](tchap_sdk_base::store::StateStore) implementation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A query failed.
    #[error(transparent)]
    Sqlite(rusqlite::Error),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(PoolError),

    /// The closure sent to the connection's thread panicked or was aborted.
    #[error("the database task failed: {0}")]
    Interact(String),

    /// Failed to serialize or deserialize a JSON column.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Failed to encode a value.
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a value.
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),

    /// A store invariant was violated.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<PoolError> for Error {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl From<Error> for StoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Store(error) => error,
            Error::Json(error) => StoreError::Json(error),
            error => StoreError::backend(error),
        }
    }
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
