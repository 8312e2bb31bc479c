// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use tchap_sdk_base::StoreError;
use thiserror::Error;

use crate::error::HttpError;

/// Errors specific to the timeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TimelineError {
    /// A backward pagination is already running on this timeline.
    #[error("a pagination is already in progress")]
    PaginationInProgress,

    /// The timeline was closed, it doesn't change anymore.
    #[error("the timeline is detached from the room")]
    Detached,

    /// The page fetched from the server doesn't connect to the cached
    /// timeline anymore, e.g. because a gap reset it while it was being
    /// fetched. Nothing was applied, paginating again is safe.
    #[error("the pagination token doesn't match the cached timeline anymore")]
    PaginationTokenMismatch,

    /// Fetching older events from the server failed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// An error occurred in the state store.
    #[error(transparent)]
    StateStore(StoreError),
}

impl From<StoreError> for TimelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::PaginationTokenMismatch { .. } => Self::PaginationTokenMismatch,
            error => Self::StateStore(error),
        }
    }
}
