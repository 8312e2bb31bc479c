use ruma::{OwnedRoomId, RoomId};
use serde_json::{json, Value as JsonValue};

use crate::DEFAULT_TEST_ROOM_ID;

pub struct InvitedRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    invite_state: Vec<JsonValue>,
}

impl InvitedRoomBuilder {
    /// Create a new `InvitedRoomBuilder` for the given room ID.
    ///
    /// If the room ID is [`DEFAULT_TEST_ROOM_ID`],
    /// [`InvitedRoomBuilder::default()`] can be used instead.
    pub fn new(room_id: &RoomId) -> Self {
        Self { room_id: room_id.to_owned(), invite_state: Vec::new() }
    }

    /// Add a stripped state event to the invite state.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.invite_state.push(event);
        self
    }

    pub(super) fn into_json(self) -> JsonValue {
        json!({ "invite_state": { "events": self.invite_state } })
    }
}

impl Default for InvitedRoomBuilder {
    fn default() -> Self {
        Self::new(&DEFAULT_TEST_ROOM_ID)
    }
}
