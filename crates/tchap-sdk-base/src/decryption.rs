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

//! The boundary to the end-to-end encryption subsystem.
//!
//! The SDK never looks inside `m.room.encrypted` payloads. It stores them as
//! received and asks a [`Decryptor`] for their plaintext when building
//! timelines. Events that can't be decrypted are kept, and can be retried
//! later, e.g. once the room key arrived.

use std::fmt;

use async_trait::async_trait;
use ruma::RoomId;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tchap_sdk_common::{debug::DebugJsonContent, AsyncTraitDeps};

use crate::deserialized_responses::SyncTimelineEvent;

/// The plaintext of an encrypted event.
#[derive(Clone, PartialEq)]
pub struct DecryptedEvent {
    /// The type of the decrypted event, e.g. `m.room.message`.
    pub event_type: String,

    /// The content of the decrypted event.
    pub content: JsonValue,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DecryptedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedEvent")
            .field("event_type", &self.event_type)
            .field("content", &DebugJsonContent(&self.content))
            .finish()
    }
}

/// Why an event couldn't be decrypted.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecryptionError {
    /// The room key needed to decrypt the event isn't known (yet).
    #[error("the room key for the session {session_id:?} is missing")]
    MissingRoomKey {
        /// The ID of the Megolm session the event was encrypted with.
        session_id: Option<String>,
    },

    /// The event is malformed or its payload is invalid.
    #[error("the encrypted event is invalid: {0}")]
    Invalid(String),

    /// No decryptor is configured.
    #[error("no decryptor is configured")]
    NoDecryptor,
}

/// Something that can decrypt `m.room.encrypted` events.
#[async_trait]
pub trait Decryptor: AsyncTraitDeps {
    /// Decrypt the given event of the given room.
    async fn decrypt(
        &self,
        room_id: &RoomId,
        event: &SyncTimelineEvent,
    ) -> Result<DecryptedEvent, DecryptionError>;
}

#[derive(Deserialize)]
struct EncryptedEventContent {
    #[serde(default)]
    session_id: Option<String>,
}

/// The Megolm session ID of an encrypted event, if it has one.
pub fn session_id_of(event: &SyncTimelineEvent) -> Option<String> {
    event.content_as::<EncryptedEventContent>().ok().and_then(|content| content.session_id)
}

/// A [`Decryptor`] that can't decrypt anything.
///
/// This is the default when no encryption subsystem is plugged in, every
/// encrypted event shows as unable to decrypt.
#[derive(Clone, Debug, Default)]
pub struct NoDecryptor;

#[async_trait]
impl Decryptor for NoDecryptor {
    async fn decrypt(
        &self,
        _room_id: &RoomId,
        _event: &SyncTimelineEvent,
    ) -> Result<DecryptedEvent, DecryptionError> {
        Err(DecryptionError::NoDecryptor)
    }
}
