// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::{fmt, time::Duration};

use ruma::presence::PresenceState;
use tchap_sdk_common::{debug::DebugStructExt, retry::BackoffPolicy};

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Token to be used in the next sync request.
#[derive(Clone, Default, Debug)]
pub enum SyncToken {
    /// Provide a specific token.
    Specific(String),
    /// Enforce no tokens at all.
    NoToken,
    /// Use a previous token if the client saw one in the past, and none
    /// otherwise.
    ///
    /// This is the default value.
    #[default]
    ReusePrevious,
}

impl<T> From<T> for SyncToken
where
    T: Into<String>,
{
    fn from(token: T) -> SyncToken {
        SyncToken::Specific(token.into())
    }
}

impl SyncToken {
    /// Convert a token that may exist into a [`SyncToken`]
    pub fn from_optional_token(maybe_token: Option<String>) -> SyncToken {
        match maybe_token {
            Some(token) => SyncToken::Specific(token),
            None => SyncToken::default(),
        }
    }
}

/// Settings for a sync call.
#[derive(Clone)]
pub struct SyncSettings {
    pub(crate) timeout: Option<Duration>,
    pub(crate) ignore_timeout_on_first_sync: bool,
    pub(crate) token: SyncToken,
    pub(crate) full_state: bool,
    pub(crate) set_presence: Option<PresenceState>,
    pub(crate) backoff: BackoffPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SyncSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { timeout, ignore_timeout_on_first_sync, token: _, full_state, set_presence, backoff } =
            self;
        f.debug_struct("SyncSettings")
            .maybe_field("timeout", timeout)
            .field("ignore_timeout_on_first_sync", ignore_timeout_on_first_sync)
            .field("full_state", full_state)
            .maybe_field("set_presence", set_presence)
            .field("backoff", backoff)
            .finish()
    }
}

impl SyncSettings {
    /// Create new default sync settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Some(DEFAULT_SYNC_TIMEOUT),
            ignore_timeout_on_first_sync: true,
            token: SyncToken::default(),
            full_state: false,
            set_presence: None,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Set the sync token.
    ///
    /// # Arguments
    ///
    /// * `token` - The sync token that should be used for the sync call.
    #[must_use]
    pub fn token(mut self, token: impl Into<SyncToken>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the maximum time the server can wait, in milliseconds, before
    /// responding to the sync request.
    ///
    /// # Arguments
    ///
    /// * `timeout` - The time the server is allowed to wait.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether to ignore the `timeout` when the `/sync` endpoint is called
    /// without a token.
    ///
    /// If there is no new data to show, the server will wait until the end of
    /// `timeout` before returning a response. An initial sync should return
    /// as soon as possible, so this is enabled by default.
    ///
    /// # Arguments
    ///
    /// * `ignore` - Whether to ignore the `timeout` of initial syncs.
    #[must_use]
    pub fn ignore_timeout_on_first_sync(mut self, ignore: bool) -> Self {
        self.ignore_timeout_on_first_sync = ignore;
        self
    }

    /// Should the server return the full state from the start of the timeline.
    ///
    /// This does nothing if no sync token is set.
    ///
    /// # Arguments
    /// * `full_state` - A boolean deciding if the server should return the full
    ///   state or not.
    #[must_use]
    pub fn full_state(mut self, full_state: bool) -> Self {
        self.full_state = full_state;
        self
    }

    /// Set the presence state
    ///
    /// `PresenceState::Online` - The client is marked as being online.
    ///
    /// `PresenceState::Offline` - The client is not marked as being online.
    ///
    /// `PresenceState::Unavailable` - The client is marked as being idle.
    ///
    /// If unset, the parameter isn't sent and the server keeps the current
    /// presence.
    ///
    /// # Arguments
    /// * `set_presence` - The `PresenceState` that the server should set for
    ///   the client.
    #[must_use]
    pub fn set_presence(mut self, presence: PresenceState) -> Self {
        self.set_presence = Some(presence);
        self
    }

    /// Set the backoff between two attempts of a failed sync request.
    ///
    /// Sync requests are retried until they succeed or fail permanently, this
    /// only changes how long the loop waits in between.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The long-poll timeout to send, for a request with or without a `since`
    /// token.
    pub(crate) fn effective_timeout(&self, is_initial: bool) -> Option<Duration> {
        if is_initial && self.ignore_timeout_on_first_sync {
            Some(Duration::ZERO)
        } else {
            self.timeout
        }
    }
}
