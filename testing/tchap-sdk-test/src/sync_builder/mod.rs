use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde_json::{json, Value as JsonValue};

mod invited_room;
mod joined_room;
mod left_room;

pub use invited_room::InvitedRoomBuilder;
pub use joined_room::JoinedRoomBuilder;
pub use left_room::LeftRoomBuilder;

/// The `SyncResponseBuilder` struct can be used to easily generate valid sync
/// responses for testing, as JSON. These can be then served by a mock server
/// or deserialized and fed directly into a client.
#[derive(Default)]
pub struct SyncResponseBuilder {
    /// Updates to joined rooms.
    joined_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Updates to invited rooms.
    invited_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Updates to left rooms.
    left_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Internal counter to enable the `next_batch` of each sync response to
    /// vary.
    batch_counter: i64,
}

impl SyncResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joined room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_joined_room(&mut self, room: JoinedRoomBuilder) -> &mut Self {
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.joined_rooms.insert(room.room_id.clone(), room.into_json());
        self
    }

    /// Add an invited room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_invited_room(&mut self, room: InvitedRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.invited_rooms.insert(room.room_id.clone(), room.into_json());
        self
    }

    /// Add a left room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_left_room(&mut self, room: LeftRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.insert(room.room_id.clone(), room.into_json());
        self
    }

    /// Builds a sync response as a JSON Value containing the rooms we queued
    /// so far, with a generated `next_batch`.
    ///
    /// The next response returned by `build_json_sync_response` will then be
    /// empty if no further rooms were queued.
    pub fn build_json_sync_response(&mut self) -> JsonValue {
        self.batch_counter += 1;
        let next_batch = self.generate_sync_token();
        self.build_json_sync_response_with_token(&next_batch)
    }

    /// Same as [`Self::build_json_sync_response`] with the given `next_batch`.
    pub fn build_json_sync_response_with_token(&mut self, next_batch: &str) -> JsonValue {
        let body = json!({
            "next_batch": next_batch,
            "rooms": {
                "invite": self.invited_rooms,
                "join": self.joined_rooms,
                "leave": self.left_rooms,
            },
        });

        self.clear();

        body
    }

    fn generate_sync_token(&self) -> String {
        format!("t392-516_47314_0_7_1_1_1_11444_{}", self.batch_counter)
    }

    /// Forget the rooms queued so far.
    pub fn clear(&mut self) {
        self.joined_rooms.clear();
        self.invited_rooms.clear();
        self.left_rooms.clear();
    }
}
