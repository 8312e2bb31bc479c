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

use tchap_sdk_common::retry::BackoffPolicy;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How the send queue retries events that failed to be sent.
#[derive(Clone, Copy, Debug)]
pub struct SendQueueConfig {
    pub(crate) max_attempts: u32,
    pub(crate) backoff: BackoffPolicy,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, backoff: BackoffPolicy::default() }
    }
}

impl SendQueueConfig {
    /// Create a new default `SendQueueConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// How many times an event is sent before it's marked as failed. At least
    /// one attempt is always made.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff between two attempts.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}
