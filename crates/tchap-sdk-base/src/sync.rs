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

//! The types related to the `/sync` endpoint.
//!
//! [`SyncEventsResponse`] is the body of a `/sync` response as sent by the
//! server, [`SyncResponse`] is what the SDK made of it.

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{
    deserialized_responses::{EphemeralEvent, StrippedStateEvent, SyncTimelineEvent},
    rooms::UnreadNotificationsCount,
    store::RoomUpdates,
};

/// Deserialize a list of events, dropping the ones that are malformed instead
/// of failing the whole response.
///
/// Meant for `#[serde(deserialize_with)]`.
pub fn deserialize_events_lossy<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Vec::<JsonValue>::deserialize(deserializer)?;

    Ok(values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(error) => {
                warn!(%error, "Dropping a malformed event from the response");
                None
            }
        })
        .collect())
}

/// A list of events.
#[derive(Clone, Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Events<T> {
    /// The events, in the order the server sent them.
    #[serde(default, deserialize_with = "deserialize_events_lossy")]
    pub events: Vec<T>,
}

impl<T> Default for Events<T> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

/// The timeline of a room in a `/sync` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Timeline {
    /// The new events, oldest first.
    #[serde(default, deserialize_with = "deserialize_events_lossy")]
    pub events: Vec<SyncTimelineEvent>,

    /// Whether the server left out events between the previous sync and
    /// `events`.
    #[serde(default)]
    pub limited: bool,

    /// The token to paginate backward from the start of `events`.
    #[serde(default)]
    pub prev_batch: Option<String>,
}

/// The `summary` block of a joined room.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomSummaryBlock {
    /// The members to use to compute the display name of the room.
    #[serde(rename = "m.heroes", default)]
    pub heroes: Option<Vec<OwnedUserId>>,

    /// The number of joined members.
    #[serde(rename = "m.joined_member_count", default)]
    pub joined_member_count: Option<u64>,

    /// The number of invited members.
    #[serde(rename = "m.invited_member_count", default)]
    pub invited_member_count: Option<u64>,
}

/// A room the user is joined to.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JoinedRoom {
    /// Updates to the summary of the room.
    #[serde(default)]
    pub summary: RoomSummaryBlock,

    /// State events that happened before the start of the timeline.
    #[serde(default)]
    pub state: Events<SyncTimelineEvent>,

    /// The new timeline events.
    #[serde(default)]
    pub timeline: Timeline,

    /// Typing notifications and receipts.
    #[serde(default)]
    pub ephemeral: Events<EphemeralEvent>,

    /// The unread counts, if they changed.
    #[serde(default)]
    pub unread_notifications: Option<UnreadNotificationsCount>,
}

/// A room the user is invited to.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvitedRoom {
    /// The stripped state of the room.
    #[serde(default)]
    pub invite_state: Events<StrippedStateEvent>,
}

/// A room the user left.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LeftRoom {
    /// State events that happened before the start of the timeline.
    #[serde(default)]
    pub state: Events<SyncTimelineEvent>,

    /// The timeline up to the leave.
    #[serde(default)]
    pub timeline: Timeline,
}

/// The rooms of a `/sync` response, by membership.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Rooms {
    /// The rooms the user is joined to.
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,

    /// The rooms the user is invited to.
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,

    /// The rooms the user left.
    #[serde(default)]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,
}

impl Rooms {
    /// The IDs of all the rooms of the response.
    pub fn room_ids(&self) -> impl Iterator<Item = &OwnedRoomId> {
        self.join.keys().chain(self.invite.keys()).chain(self.leave.keys())
    }
}

/// The body of a `/sync` response.
#[derive(Clone, Debug, Deserialize)]
pub struct SyncEventsResponse {
    /// The token to pass as `since` to the next `/sync` request.
    pub next_batch: String,

    /// Updates to rooms.
    #[serde(default)]
    pub rooms: Rooms,
}

/// The result of processing a `/sync` response.
#[derive(Clone, Debug, Default)]
pub struct SyncResponse {
    /// The token to pass as `since` to the next `/sync` request.
    pub next_batch: String,

    /// The rooms that changed.
    pub rooms: RoomUpdates,

    /// The rooms that were removed from the store because an initial sync
    /// didn't mention them anymore.
    pub removed_rooms: Vec<OwnedRoomId>,
}
