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

//! Session-scoped trackers for the ephemeral events of rooms.
//!
//! Typing notifications and read receipts are never persisted. They live in
//! these trackers, owned by the [`BaseClient`][crate::BaseClient] of a
//! session and cleared with it.

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use eyeball::{SharedObservable, Subscriber};
use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::trace;

/// The event type of typing notifications.
pub const TYPING: &str = "m.typing";
/// The event type of receipts.
pub const RECEIPT: &str = "m.receipt";

#[derive(Deserialize)]
struct TypingEventContent {
    #[serde(default)]
    user_ids: Vec<OwnedUserId>,
}

/// Keeps track of who is typing in which room.
#[derive(Clone, Debug, Default)]
pub struct TypingTracker {
    rooms: Arc<DashMap<OwnedRoomId, SharedObservable<Vec<OwnedUserId>>>>,
}

impl TypingTracker {
    fn observable(&self, room_id: &RoomId) -> SharedObservable<Vec<OwnedUserId>> {
        self.rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| SharedObservable::new(Vec::new()))
            .clone()
    }

    /// Handle the content of an `m.typing` event.
    ///
    /// The local user is never reported as typing.
    pub fn handle_typing_event(
        &self,
        room_id: &RoomId,
        own_user_id: Option<&UserId>,
        content: &JsonValue,
    ) {
        let Ok(content) = TypingEventContent::deserialize(content) else {
            trace!(%room_id, "Ignoring malformed typing notification");
            return;
        };

        let user_ids: Vec<_> = content
            .user_ids
            .into_iter()
            .filter(|user_id| Some(&**user_id) != own_user_id)
            .collect();

        self.observable(room_id).set_if_not_eq(user_ids);
    }

    /// The users currently typing in the given room.
    pub fn typing_users(&self, room_id: &RoomId) -> Vec<OwnedUserId> {
        self.rooms.get(room_id).map(|users| users.get()).unwrap_or_default()
    }

    /// Subscribe to the users typing in the given room.
    pub fn subscribe(&self, room_id: &RoomId) -> Subscriber<Vec<OwnedUserId>> {
        self.observable(room_id).subscribe()
    }

    /// Forget everything, telling subscribers that nobody is typing anymore.
    pub fn clear(&self) {
        for users in self.rooms.iter() {
            users.set_if_not_eq(Vec::new());
        }

        self.rooms.clear();
    }
}

/// A read receipt of a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// The event the user has read up to.
    pub event_id: OwnedEventId,
    /// When the receipt was sent, if the server told us.
    pub ts: Option<MilliSecondsSinceUnixEpoch>,
}

#[derive(Deserialize)]
struct ReceiptData {
    #[serde(default)]
    ts: Option<MilliSecondsSinceUnixEpoch>,
}

/// `{ event_id: { receipt_type: { user_id: { ts } } } }`
type ReceiptEventContent =
    BTreeMap<OwnedEventId, BTreeMap<String, BTreeMap<OwnedUserId, ReceiptData>>>;

/// Keeps track of the latest public read receipt of every user in every room.
#[derive(Clone, Debug, Default)]
pub struct ReceiptTracker {
    rooms: Arc<DashMap<OwnedRoomId, BTreeMap<OwnedUserId, Receipt>>>,
}

impl ReceiptTracker {
    /// Handle the content of an `m.receipt` event.
    ///
    /// Receipts arrive in order, so a newer receipt of a user always replaces
    /// the older one.
    pub fn handle_receipt_event(&self, room_id: &RoomId, content: &JsonValue) {
        let Ok(content) = ReceiptEventContent::deserialize(content) else {
            trace!(%room_id, "Ignoring malformed receipt event");
            return;
        };

        let mut receipts = self.rooms.entry(room_id.to_owned()).or_default();

        for (event_id, by_type) in content {
            let Some(users) = by_type.get("m.read") else { continue };

            for (user_id, data) in users {
                receipts
                    .insert(user_id.clone(), Receipt { event_id: event_id.clone(), ts: data.ts });
            }
        }
    }

    /// The latest read receipt of the given user in the given room.
    pub fn read_receipt(&self, room_id: &RoomId, user_id: &UserId) -> Option<Receipt> {
        self.rooms.get(room_id).and_then(|receipts| receipts.get(user_id).cloned())
    }

    /// Forget every receipt.
    pub fn clear(&self) {
        self.rooms.clear();
    }
}
