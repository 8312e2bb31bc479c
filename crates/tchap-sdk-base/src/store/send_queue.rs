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

//! All data types related to the send queue.

use std::fmt;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedTransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tchap_sdk_common::debug::{DebugJsonContent, DebugStructExt};

/// The send state of a local echo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SendState {
    /// The event is being sent, or waiting to be sent.
    Sending,

    /// The server acknowledged the event, but it hasn't come down sync yet.
    Sent {
        /// The event ID the server assigned.
        event_id: OwnedEventId,
    },

    /// Sending the event failed.
    Failed {
        /// A textual representation of the error.
        error: String,

        /// Whether the failure is worth retrying as is (network trouble, a
        /// restart while sending), or not (the server rejected the event).
        is_recoverable: bool,
    },

    /// The event came down sync and replaced the local echo.
    Synced,
}

impl SendState {
    /// Is the event still on its way to the server?
    pub fn is_sending(&self) -> bool {
        matches!(self, Self::Sending)
    }

    /// Did sending the event fail?
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A locally authored event that hasn't been confirmed by sync yet.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEcho {
    /// The transaction ID used to send the event. It identifies the echo.
    pub transaction_id: OwnedTransactionId,

    /// The type of the event.
    pub event_type: String,

    /// The content of the event.
    pub content: JsonValue,

    /// Where the event is in its journey to the server.
    pub send_state: SendState,

    /// When the echo was created.
    pub created_at: MilliSecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for LocalEcho {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEcho")
            .field("transaction_id", &self.transaction_id)
            .field("event_type", &self.event_type)
            .field("content", &DebugJsonContent(&self.content))
            .field("send_state", &self.send_state)
            .maybe_field("event_id", &self.event_id())
            .finish()
    }
}

impl LocalEcho {
    /// Create a new echo in the [`SendState::Sending`] state.
    pub fn new(transaction_id: OwnedTransactionId, event_type: String, content: JsonValue) -> Self {
        Self {
            transaction_id,
            event_type,
            content,
            send_state: SendState::Sending,
            created_at: MilliSecondsSinceUnixEpoch::now(),
        }
    }

    /// The event ID the server assigned to this echo, if it has been sent.
    pub fn event_id(&self) -> Option<OwnedEventId> {
        match &self.send_state {
            SendState::Sent { event_id } => Some(event_id.clone()),
            _ => None,
        }
    }
}
