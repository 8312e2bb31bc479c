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

use std::time::Duration;

use async_trait::async_trait;
use deadpool_sqlite::Object as SqliteAsyncConn;
use rusqlite::{OptionalExtension, Params, Row, Transaction, TransactionBehavior};

use crate::{
    error::{Error, Result},
    OpenStoreError,
};

/// How long a connection waits for another one to release the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub(crate) trait SqliteAsyncConnExt {
    async fn execute<P>(&self, sql: impl AsRef<str> + Send + 'static, params: P) -> Result<usize>
    where
        P: Params + Send + 'static;

    async fn execute_batch(&self, sql: impl AsRef<str> + Send + 'static) -> Result<()>;

    async fn query_row<T, P, F>(
        &self,
        sql: impl AsRef<str> + Send + 'static,
        params: P,
        f: F,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T> + Send + 'static;

    /// Run `f` in a transaction that holds the write lock from the start.
    ///
    /// The transaction is committed if `f` succeeds, and rolled back
    /// otherwise.
    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static;

    /// Run `f` in a read transaction, every query of `f` sees the same
    /// snapshot of the database.
    async fn with_read_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static;
}

#[async_trait]
impl SqliteAsyncConnExt for SqliteAsyncConn {
    async fn execute<P>(&self, sql: impl AsRef<str> + Send + 'static, params: P) -> Result<usize>
    where
        P: Params + Send + 'static,
    {
        self.interact(move |conn| conn.execute(sql.as_ref(), params))
            .await
            .map_err(|e| Error::Interact(format!("{e:?}")))?
            .map_err(Into::into)
    }

    async fn execute_batch(&self, sql: impl AsRef<str> + Send + 'static) -> Result<()> {
        self.interact(move |conn| conn.execute_batch(sql.as_ref()))
            .await
            .map_err(|e| Error::Interact(format!("{e:?}")))?
            .map_err(Into::into)
    }

    async fn query_row<T, P, F>(
        &self,
        sql: impl AsRef<str> + Send + 'static,
        params: P,
        f: F,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        self.interact(move |conn| conn.query_row(sql.as_ref(), params, f).optional())
            .await
            .map_err(|e| Error::Interact(format!("{e:?}")))?
            .map_err(Into::into)
    }

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.interact(move |conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = f(&txn)?;
            txn.commit()?;
            Ok(result)
        })
        .await
        .map_err(|e| Error::Interact(format!("{e:?}")))?
    }

    async fn with_read_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.interact(move |conn| {
            let txn = conn.transaction()?;
            let result = f(&txn)?;
            txn.commit()?;
            Ok(result)
        })
        .await
        .map_err(|e| Error::Interact(format!("{e:?}")))?
    }
}

pub(crate) trait SqliteKeyValueStoreConnExt {
    /// Store the given value for the given key.
    fn set_kv(&self, key: &str, value: &[u8]) -> rusqlite::Result<()>;

    /// Set the version of the database.
    fn set_db_version(&self, version: u8) -> rusqlite::Result<()> {
        self.set_kv("version", &[version])
    }
}

impl SqliteKeyValueStoreConnExt for rusqlite::Connection {
    fn set_kv(&self, key: &str, value: &[u8]) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO kv VALUES (?1, ?2) ON CONFLICT (key) DO UPDATE SET value = ?2",
            (key, value),
        )?;
        Ok(())
    }
}

/// Load the version of the database with the given connection.
pub(crate) async fn load_db_version(conn: &SqliteAsyncConn) -> Result<u8, OpenStoreError> {
    let kv_exists = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv'",
            (),
            |row| row.get::<_, u32>(0),
        )
        .await?
        .unwrap_or_default()
        > 0;

    if !kv_exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT value FROM kv WHERE key = 'version'", (), |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .await?;

    match version.as_deref() {
        Some([v]) => Ok(*v),
        Some(_) => Err(OpenStoreError::InvalidVersion),
        None => Err(OpenStoreError::MissingVersion),
    }
}
