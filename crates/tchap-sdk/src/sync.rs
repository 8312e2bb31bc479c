// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! The `/sync` long-polling loop.
//!
//! Every iteration sends one `/sync` request, retried until it succeeds or
//! fails permanently, then hands the response to the base client which applies
//! it to the store room by room and advances the sync token. The next request
//! is only sent once the previous response has been fully applied.

use std::{future::Future, time::Duration};

use tchap_sdk_base::sync::SyncResponse;
use tchap_sdk_common::retry::{self, RetryError, RetryInfo};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config::{SyncSettings, SyncToken},
    error::{Error, HttpError},
    requests::SyncRequest,
    Client, Result,
};

/// Where the sync loop is at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    /// The loop isn't running.
    #[default]
    Idle,

    /// A request is in flight, or a response is being applied.
    Running,

    /// The last request failed with a transient error, it is sent again after
    /// `delay`.
    Retrying {
        /// The number of the attempt that failed, starting at 1.
        attempt: u32,
        /// How long the loop waits before the next attempt.
        delay: Duration,
    },

    /// The loop stopped because of an error that retrying can't fix.
    Terminated {
        /// A textual representation of the error.
        error: String,
    },

    /// The server rejected the access token, the loop stopped. The session
    /// must be restored with new credentials before syncing again.
    SessionInvalid,
}

/// Enum controlling if a loop running callbacks should continue or abort.
///
/// This is mainly used in the [`sync_with_callback`] method, the return value
/// of the provided callback controls if the sync loop should be exited.
///
/// [`sync_with_callback`]: Client::sync_with_callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCtrl {
    /// Continue running the loop.
    Continue,
    /// Break out of the loop.
    Break,
}

impl Client {
    /// Synchronize the client's state with the latest state on the server,
    /// once.
    ///
    /// Transient errors are retried with the backoff of the settings, as long
    /// as it takes. The retries can be cancelled with
    /// [`logout_locally`](Self::logout_locally), in which case
    /// [`Error::Cancelled`] is returned.
    ///
    /// # Arguments
    ///
    /// * `sync_settings` - Settings for the sync call.
    #[instrument(skip(self))]
    pub async fn sync_once(&self, sync_settings: SyncSettings) -> Result<SyncResponse> {
        let since = self.resolve_sync_token(&sync_settings.token).await?;
        let result = self.sync_iteration(since, &sync_settings).await;

        if matches!(result, Ok(_) | Err(Error::Cancelled)) {
            self.inner.sync_state.set(SyncState::Idle);
        }

        result
    }

    /// Repeatedly synchronize the client state with the server.
    ///
    /// This method only returns when the session is closed, in which case it
    /// returns `Ok`, or on an error that retrying can't fix. Transient errors
    /// are only reported through [`sync_state`](Self::sync_state).
    ///
    /// # Arguments
    ///
    /// * `sync_settings` - Settings for the sync call. *Note* that the token
    ///   is only used for the first request, the following ones use the
    ///   `next_batch` of the previous response.
    pub async fn sync(&self, sync_settings: SyncSettings) -> Result<()> {
        self.sync_with_callback(sync_settings, |_| async { LoopCtrl::Continue }).await
    }

    /// Repeatedly call sync to synchronize the client state with the server.
    ///
    /// # Arguments
    ///
    /// * `sync_settings` - Settings for the sync call. *Note* that the token
    ///   is only used for the first request.
    ///
    /// * `callback` - A callback that will be called every time a successful
    ///   response has been fetched from the server and applied to the store.
    ///   The callback must return a [`LoopCtrl`] to tell the loop whether to
    ///   continue.
    #[instrument(skip_all)]
    pub async fn sync_with_callback<C>(
        &self,
        sync_settings: SyncSettings,
        callback: impl Fn(SyncResponse) -> C,
    ) -> Result<()>
    where
        C: Future<Output = LoopCtrl>,
    {
        let mut since = self.resolve_sync_token(&sync_settings.token).await?;
        info!(has_token = since.is_some(), "Starting the sync loop");

        loop {
            if !self.logged_in() {
                info!("The session was closed, stopping the sync loop");
                self.inner.sync_state.set(SyncState::Idle);
                return Ok(());
            }

            trace!("Syncing");
            let response = match self.sync_iteration(since.take(), &sync_settings).await {
                Ok(response) => response,
                Err(Error::Cancelled) => {
                    info!("The sync loop was cancelled");
                    self.inner.sync_state.set(SyncState::Idle);
                    return Ok(());
                }
                Err(error) => return Err(error),
            };

            since = Some(response.next_batch.clone());

            trace!("Running callback");
            if callback(response).await == LoopCtrl::Break {
                trace!("Callback told us to stop");
                self.inner.sync_state.set(SyncState::Idle);
                return Ok(());
            }
        }
    }

    async fn resolve_sync_token(&self, token: &SyncToken) -> Result<Option<String>> {
        Ok(match token {
            SyncToken::Specific(token) => Some(token.clone()),
            SyncToken::NoToken => None,
            SyncToken::ReusePrevious => self.sync_token().await?,
        })
    }

    /// Send one `/sync` request with its retries, and apply the response.
    async fn sync_iteration(
        &self,
        since: Option<String>,
        sync_settings: &SyncSettings,
    ) -> Result<SyncResponse> {
        if !self.logged_in() {
            return Err(Error::AuthenticationRequired);
        }

        let is_initial = since.is_none();
        let timeout = sync_settings.effective_timeout(is_initial);

        let request = SyncRequest {
            since,
            timeout,
            full_state: sync_settings.full_state,
            set_presence: sync_settings.set_presence.clone(),
        };

        // Retries are driven from here, so they show up in the sync state.
        let mut request_config = self.request_config().disable_retry();
        if let Some(timeout) = timeout {
            request_config.timeout += timeout;
        }

        self.inner.sync_state.set_if_not_eq(SyncState::Running);

        let sync_state = self.inner.sync_state.clone();
        let task = retry::execute_with_observer(
            || self.send(request.clone(), Some(request_config)),
            None,
            sync_settings.backoff,
            move |error: &HttpError, info: RetryInfo| {
                warn!(%error, attempt = info.attempt, delay = ?info.delay, "Sync request failed");
                sync_state.set(SyncState::Retrying { attempt: info.attempt, delay: info.delay });
            },
        );

        let abort_handle = task.abort_handle();
        self.set_current_sync(Some(abort_handle.clone()));

        // The session may have been closed before the handle was stored.
        if !self.logged_in() {
            abort_handle.abort();
        }

        let result = task.await;
        self.set_current_sync(None);

        let response = match result {
            Ok(response) => response,
            Err(RetryError::Cancelled) => return Err(Error::Cancelled),
            Err(RetryError::Permanent(HttpError::UnknownToken(error))) => {
                error!(%error, "The access token was rejected, stopping the sync");
                self.inner.sync_state.set(SyncState::SessionInvalid);
                return Err(Error::SessionInvalid);
            }
            Err(error) => {
                let error = error.into_inner().unwrap_or(HttpError::Cancelled);
                error!(%error, "Sync request failed permanently");
                self.inner.sync_state.set(SyncState::Terminated { error: error.to_string() });
                return Err(error.into());
            }
        };

        self.inner.sync_state.set_if_not_eq(SyncState::Running);

        match self.base_client().receive_sync_response(response, is_initial).await {
            Ok(response) => {
                debug!(
                    next_batch = %response.next_batch,
                    rooms = response.rooms.rooms.len(),
                    "Applied sync response"
                );
                Ok(response)
            }
            Err(error) => {
                let error = Error::from(error);
                error!(%error, "Couldn't apply the sync response");
                self.inner.sync_state.set(SyncState::Terminated { error: error.to_string() });
                Err(error)
            }
        }
    }
}
