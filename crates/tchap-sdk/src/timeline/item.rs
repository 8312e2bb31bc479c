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

use as_variant::as_variant;
use ruma::{EventId, MilliSecondsSinceUnixEpoch, OwnedUserId, TransactionId, UserId};
use serde_json::Value as JsonValue;
use tchap_sdk_base::{
    decryption::{session_id_of, DecryptedEvent},
    deserialized_responses::{
        EventKind, RoomMessageEventContent, SyncTimelineEvent, ROOM_MESSAGE,
    },
    store::send_queue::{LocalEcho, SendState},
};

/// An item in the timeline: a confirmed event, or the local echo of an event
/// being sent.
#[derive(Clone, Debug)]
pub struct TimelineItem {
    kind: TimelineItemKind,
    sender: OwnedUserId,
    is_own: bool,
    timestamp: MilliSecondsSinceUnixEpoch,
    event_type: String,
    content: TimelineItemContent,
}

/// Where a [`TimelineItem`] comes from.
#[derive(Clone, Debug)]
pub enum TimelineItemKind {
    /// An event confirmed by the server.
    Remote {
        /// The event as stored, still encrypted if it was.
        event: SyncTimelineEvent,
    },

    /// A local echo, not confirmed by sync yet.
    Local {
        /// The transaction ID of the echo.
        transaction_id: ruma::OwnedTransactionId,
        /// Where the event is in its journey to the server.
        send_state: SendState,
    },
}

/// The content of a [`TimelineItem`].
#[derive(Clone, Debug)]
pub enum TimelineItemContent {
    /// An `m.room.message`.
    Message(RoomMessageEventContent),

    /// An encrypted event that couldn't be decrypted (yet).
    UnableToDecrypt {
        /// The Megolm session the event was encrypted with, if known.
        session_id: Option<String>,
    },

    /// A state event.
    State {
        /// The state key of the event.
        state_key: String,
        /// The content of the event.
        content: JsonValue,
    },

    /// Any other event, its content passed through untouched.
    Other(JsonValue),
}

impl TimelineItemContent {
    fn from_parts(event_type: &str, state_key: Option<&str>, content: &JsonValue) -> Self {
        if let Some(state_key) = state_key {
            return Self::State { state_key: state_key.to_owned(), content: content.clone() };
        }

        if event_type == ROOM_MESSAGE {
            if let Ok(message) = serde_json::from_value(content.clone()) {
                return Self::Message(message);
            }
        }

        Self::Other(content.clone())
    }

    /// The message, if this is an `m.room.message`.
    pub fn as_message(&self) -> Option<&RoomMessageEventContent> {
        as_variant!(self, Self::Message)
    }

    /// Whether this is an event that couldn't be decrypted.
    pub fn is_unable_to_decrypt(&self) -> bool {
        matches!(self, Self::UnableToDecrypt { .. })
    }
}

impl TimelineItem {
    /// Build the item of a confirmed event.
    ///
    /// `decrypted` is the plaintext of the event if it's encrypted and could
    /// be decrypted.
    pub(super) fn remote(
        event: SyncTimelineEvent,
        decrypted: Option<DecryptedEvent>,
        own_user_id: &UserId,
    ) -> Self {
        let (event_type, content) = match decrypted {
            Some(decrypted) => {
                let content =
                    TimelineItemContent::from_parts(&decrypted.event_type, None, &decrypted.content);
                (decrypted.event_type, content)
            }
            None if event.kind() == EventKind::Encrypted => (
                event.event_type.clone(),
                TimelineItemContent::UnableToDecrypt { session_id: session_id_of(&event) },
            ),
            None => (
                event.event_type.clone(),
                TimelineItemContent::from_parts(
                    &event.event_type,
                    event.state_key.as_deref(),
                    &event.content,
                ),
            ),
        };

        Self {
            sender: event.sender.clone(),
            is_own: event.sender == own_user_id,
            timestamp: event.origin_server_ts,
            event_type,
            content,
            kind: TimelineItemKind::Remote { event },
        }
    }

    /// Build the item of a local echo.
    pub(super) fn local(echo: LocalEcho, own_user_id: &UserId) -> Self {
        let content = TimelineItemContent::from_parts(&echo.event_type, None, &echo.content);

        Self {
            sender: own_user_id.to_owned(),
            is_own: true,
            timestamp: echo.created_at,
            event_type: echo.event_type,
            content,
            kind: TimelineItemKind::Local {
                transaction_id: echo.transaction_id,
                send_state: echo.send_state,
            },
        }
    }

    /// Where this item comes from.
    pub fn kind(&self) -> &TimelineItemKind {
        &self.kind
    }

    /// Whether this item is a local echo.
    pub fn is_local_echo(&self) -> bool {
        matches!(self.kind, TimelineItemKind::Local { .. })
    }

    /// The ID of the event, if it's confirmed.
    pub fn event_id(&self) -> Option<&EventId> {
        match &self.kind {
            TimelineItemKind::Remote { event } => Some(&event.event_id),
            TimelineItemKind::Local { .. } => None,
        }
    }

    /// The transaction ID the event was sent with, if it was sent by this
    /// device.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match &self.kind {
            TimelineItemKind::Remote { event } => event.transaction_id(),
            TimelineItemKind::Local { transaction_id, .. } => Some(transaction_id),
        }
    }

    /// The send state of the event, if it was sent by this device.
    ///
    /// Confirmed events sent by this device are [`SendState::Synced`].
    pub fn send_state(&self) -> Option<SendState> {
        match &self.kind {
            TimelineItemKind::Remote { event } => {
                event.transaction_id().map(|_| SendState::Synced)
            }
            TimelineItemKind::Local { send_state, .. } => Some(send_state.clone()),
        }
    }

    /// The sender of the event.
    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    /// Whether the event was sent by the logged-in user.
    pub fn is_own(&self) -> bool {
        self.is_own
    }

    /// When the event was sent: the origin server timestamp for confirmed
    /// events, the creation time for local echoes.
    pub fn timestamp(&self) -> MilliSecondsSinceUnixEpoch {
        self.timestamp
    }

    /// The type of the event, the decrypted one for encrypted events that
    /// could be decrypted.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The content of the event.
    pub fn content(&self) -> &TimelineItemContent {
        &self.content
    }

    /// The stored event, if this item is confirmed.
    pub fn original_event(&self) -> Option<&SyncTimelineEvent> {
        as_variant!(&self.kind, TimelineItemKind::Remote { event } => event)
    }

    /// Whether this local echo stands for the given confirmed event, by its
    /// transaction ID or by the event ID the server assigned.
    pub(super) fn is_echo_of(&self, event: &SyncTimelineEvent) -> bool {
        let TimelineItemKind::Local { transaction_id, send_state } = &self.kind else {
            return false;
        };

        event.transaction_id() == Some(&**transaction_id)
            || matches!(send_state, SendState::Sent { event_id } if *event_id == event.event_id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use ruma::{user_id, TransactionId};
    use serde_json::json;
    use tchap_sdk_base::{
        decryption::DecryptedEvent,
        deserialized_responses::SyncTimelineEvent,
        store::send_queue::{LocalEcho, SendState},
    };
    use tchap_sdk_test::{sync_state_event, sync_timeline_event};

    use super::{TimelineItem, TimelineItemContent};

    fn event(json: serde_json::Value) -> SyncTimelineEvent {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_remote_message() {
        let own = user_id!("@alice:example.org");
        let item = TimelineItem::remote(
            event(sync_timeline_event!("$e1", "@bob:example.org", "hello")),
            None,
            own,
        );

        assert!(!item.is_own());
        assert!(!item.is_local_echo());
        assert_eq!(item.event_id().unwrap(), "$e1");
        assert!(item.send_state().is_none());
        assert_eq!(item.content().as_message().unwrap().body, "hello");
    }

    #[test]
    fn test_state_and_unknown_events() {
        let own = user_id!("@alice:example.org");

        let item = TimelineItem::remote(
            event(sync_state_event!("$n", "m.room.name", "", { "name": "A" })),
            None,
            own,
        );
        assert!(item.is_own());
        assert_let!(TimelineItemContent::State { state_key, content } = item.content());
        assert_eq!(state_key, "");
        assert_eq!(content["name"], "A");

        let item = TimelineItem::remote(
            event(sync_timeline_event!({
                "event_id": "$x",
                "sender": "@bob:example.org",
                "type": "org.example.custom",
                "content": { "foo": "bar" },
                "origin_server_ts": 1,
            })),
            None,
            own,
        );
        assert_eq!(item.event_type(), "org.example.custom");
        assert_let!(TimelineItemContent::Other(content) = item.content());
        assert_eq!(content["foo"], "bar");
    }

    #[test]
    fn test_encrypted_event() {
        let own = user_id!("@alice:example.org");
        let encrypted = event(sync_timeline_event!({
            "event_id": "$enc",
            "sender": "@bob:example.org",
            "type": "m.room.encrypted",
            "content": { "algorithm": "m.megolm.v1.aes-sha2", "session_id": "S1" },
            "origin_server_ts": 1,
        }));

        let item = TimelineItem::remote(encrypted.clone(), None, own);
        assert_let!(TimelineItemContent::UnableToDecrypt { session_id } = item.content());
        assert_eq!(session_id.as_deref(), Some("S1"));

        let decrypted = DecryptedEvent {
            event_type: "m.room.message".to_owned(),
            content: json!({ "msgtype": "m.text", "body": "secret" }),
        };
        let item = TimelineItem::remote(encrypted, Some(decrypted), own);
        assert_eq!(item.event_type(), "m.room.message");
        assert_eq!(item.content().as_message().unwrap().body, "secret");
        assert_eq!(item.original_event().unwrap().event_type, "m.room.encrypted");
    }

    #[test]
    fn test_local_echo_and_its_remote_counterpart() {
        let own = user_id!("@alice:example.org");
        let mut echo = LocalEcho::new(
            <&TransactionId>::from("tx1").to_owned(),
            "m.room.message".to_owned(),
            json!({ "msgtype": "m.text", "body": "hi" }),
        );
        echo.send_state = SendState::Sent { event_id: ruma::event_id!("$e3").to_owned() };

        let local = TimelineItem::local(echo, own);
        assert!(local.is_local_echo());
        assert_eq!(local.transaction_id().unwrap(), "tx1");
        assert_eq!(local.content().as_message().unwrap().body, "hi");

        // Matched by the event ID the server assigned.
        let remote = event(sync_timeline_event!("$e3", "@alice:example.org", "hi"));
        assert!(local.is_echo_of(&remote));

        // Matched by the transaction ID.
        let remote = event(sync_timeline_event!({
            "event_id": "$other",
            "sender": "@alice:example.org",
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" },
            "origin_server_ts": 1,
            "unsigned": { "transaction_id": "tx1" },
        }));
        assert!(local.is_echo_of(&remote));

        let item = TimelineItem::remote(remote, None, own);
        assert_eq!(item.send_state(), Some(SendState::Synced));
    }
}
