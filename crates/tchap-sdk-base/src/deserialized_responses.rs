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

//! Event types as they are received from the homeserver.
//!
//! Event contents are kept as opaque JSON. [`SyncTimelineEvent::kind`]
//! classifies an event by its type without touching the content, and
//! [`SyncTimelineEvent::content_as`] decodes the content lazily for the
//! consumers that know which shape they expect.

use std::fmt;

use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedTransactionId, OwnedUserId, TransactionId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tchap_sdk_common::debug::{DebugJsonContent, DebugStructExt};

/// The event type of a room name.
pub const ROOM_NAME: &str = "m.room.name";
/// The event type of a room canonical alias.
pub const ROOM_CANONICAL_ALIAS: &str = "m.room.canonical_alias";
/// The event type of a room avatar.
pub const ROOM_AVATAR: &str = "m.room.avatar";
/// The event type of a room membership.
pub const ROOM_MEMBER: &str = "m.room.member";
/// The event type of a message.
pub const ROOM_MESSAGE: &str = "m.room.message";
/// The event type of an encrypted event.
pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";

/// The unsigned data of an event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Unsigned {
    /// The transaction ID the sender used when sending this event.
    ///
    /// Only present for the device that sent the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<OwnedTransactionId>,

    /// Every other unsigned field, kept verbatim.
    #[serde(flatten)]
    pub other: JsonMap<String, JsonValue>,
}

impl Unsigned {
    fn is_empty(&self) -> bool {
        self.transaction_id.is_none() && self.other.is_empty()
    }
}

/// A confirmed room event, as received in a `/sync` timeline, a `state`
/// block or a `/messages` chunk.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTimelineEvent {
    /// The globally unique identifier of the event, assigned by the server.
    pub event_id: OwnedEventId,

    /// The sender of the event.
    pub sender: OwnedUserId,

    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the event, opaque until decoded with
    /// [`content_as`][Self::content_as].
    #[serde(default)]
    pub content: JsonValue,

    /// Timestamp on the originating server.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,

    /// Present if, and only if, this is a state event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Unsigned data of the event.
    #[serde(default, skip_serializing_if = "Unsigned::is_empty")]
    pub unsigned: Unsigned,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SyncTimelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTimelineEvent")
            .field("event_id", &self.event_id)
            .field("sender", &self.sender)
            .field("event_type", &self.event_type)
            .field("content", &DebugJsonContent(&self.content))
            .maybe_field("state_key", &self.state_key)
            .maybe_field("transaction_id", &self.unsigned.transaction_id)
            .finish_non_exhaustive()
    }
}

impl SyncTimelineEvent {
    /// Classify this event by its type.
    pub fn kind(&self) -> EventKind {
        EventKind::new(&self.event_type, self.state_key.is_some())
    }

    /// Is this a state event?
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Decode the content of this event into the given type.
    pub fn content_as<C: DeserializeOwned>(&self) -> serde_json::Result<C> {
        C::deserialize(&self.content)
    }

    /// The transaction ID the local user sent this event with, if this event
    /// is the remote echo of a local one.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.unsigned.transaction_id.as_deref()
    }
}

/// A stripped state event, as received for rooms the user is invited to.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StrippedStateEvent {
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The state key of the event.
    pub state_key: String,

    /// The sender of the event.
    pub sender: OwnedUserId,

    /// The content of the event.
    #[serde(default)]
    pub content: JsonValue,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for StrippedStateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrippedStateEvent")
            .field("event_type", &self.event_type)
            .field("state_key", &self.state_key)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl StrippedStateEvent {
    /// Decode the content of this event into the given type.
    pub fn content_as<C: DeserializeOwned>(&self) -> serde_json::Result<C> {
        C::deserialize(&self.content)
    }
}

/// An ephemeral room event (typing notifications, receipts).
///
/// These are never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EphemeralEvent {
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The content of the event.
    #[serde(default)]
    pub content: JsonValue,
}

/// The kinds of events the SDK knows about.
///
/// Anything else is [`EventKind::Unknown`], and is still kept and passed
/// through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// An `m.room.message` event.
    Message,
    /// An `m.sticker` event.
    Sticker,
    /// An `m.room.encrypted` event, whose payload is opaque to the SDK.
    Encrypted,
    /// An `m.room.redaction` event.
    Redaction,
    /// An `m.reaction` event.
    Reaction,
    /// An `m.room.name` state event.
    RoomName,
    /// An `m.room.canonical_alias` state event.
    CanonicalAlias,
    /// An `m.room.avatar` state event.
    RoomAvatar,
    /// An `m.room.member` state event.
    RoomMember,
    /// Any other state event.
    OtherState,
    /// Any other message-like event.
    Unknown,
}

impl EventKind {
    fn new(event_type: &str, is_state: bool) -> Self {
        match (event_type, is_state) {
            (ROOM_NAME, true) => Self::RoomName,
            (ROOM_CANONICAL_ALIAS, true) => Self::CanonicalAlias,
            (ROOM_AVATAR, true) => Self::RoomAvatar,
            (ROOM_MEMBER, true) => Self::RoomMember,
            (_, true) => Self::OtherState,
            (ROOM_MESSAGE, false) => Self::Message,
            ("m.sticker", false) => Self::Sticker,
            (ROOM_ENCRYPTED, false) => Self::Encrypted,
            ("m.room.redaction", false) => Self::Redaction,
            ("m.reaction", false) => Self::Reaction,
            (_, false) => Self::Unknown,
        }
    }

    /// Whether an event of this kind can be shown as the latest event of a
    /// room.
    pub fn is_suitable_as_latest_event(self) -> bool {
        matches!(self, Self::Message | Self::Sticker | Self::Encrypted)
    }
}

/// The content of an `m.room.name` event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomNameEventContent {
    /// The name of the room.
    #[serde(default)]
    pub name: Option<String>,
}

/// The content of an `m.room.canonical_alias` event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CanonicalAliasEventContent {
    /// The canonical alias of the room.
    #[serde(default)]
    pub alias: Option<String>,
}

/// The content of an `m.room.avatar` event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomAvatarEventContent {
    /// The URL of the avatar.
    #[serde(default)]
    pub url: Option<String>,
}

/// The content of an `m.room.member` event.
#[derive(Clone, Debug, Deserialize)]
pub struct RoomMemberEventContent {
    /// The membership state.
    pub membership: String,
    /// The display name of the member, if set.
    #[serde(default)]
    pub displayname: Option<String>,
}

/// The content of an `m.room.message` event.
#[derive(Clone, Deserialize)]
pub struct RoomMessageEventContent {
    /// The type of the message.
    pub msgtype: String,
    /// The textual body of the message.
    #[serde(default)]
    pub body: String,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomMessageEventContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomMessageEventContent")
            .field("msgtype", &self.msgtype)
            .finish_non_exhaustive()
    }
}

/// The direction of a pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Towards the past.
    #[serde(rename = "b")]
    Backward,
    /// Towards the present.
    #[serde(rename = "f")]
    Forward,
}

impl Direction {
    /// The value of the `dir` query parameter for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// A token-delimited, ordered run of events of a room.
///
/// `/sync` timelines, `/messages` responses and slices of the local store all
/// share this shape. Events are always in chronological order.
///
/// Chunks are stitchable: the `next_token` of a chunk is the `prev_token` of
/// the chunk immediately following it in server order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimelineChunk {
    /// The token to paginate backward from the start of this chunk, `None`
    /// if the start of the room has been reached.
    pub prev_token: Option<String>,

    /// The token to paginate forward from the end of this chunk.
    pub next_token: Option<String>,

    /// The events of the chunk, oldest first.
    pub events: Vec<SyncTimelineEvent>,
}

impl TimelineChunk {
    /// Is this chunk empty?
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
