use ruma::{OwnedRoomId, RoomId};
use serde_json::{json, Value as JsonValue};

use crate::DEFAULT_TEST_ROOM_ID;

pub struct LeftRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    timeline: Vec<JsonValue>,
    state: Vec<JsonValue>,
}

impl LeftRoomBuilder {
    /// Create a new `LeftRoomBuilder` for the given room ID.
    ///
    /// If the room ID is [`DEFAULT_TEST_ROOM_ID`],
    /// [`LeftRoomBuilder::default()`] can be used instead.
    pub fn new(room_id: &RoomId) -> Self {
        Self { room_id: room_id.to_owned(), timeline: Vec::new(), state: Vec::new() }
    }

    /// Add an event to the timeline, usually the leave event.
    pub fn add_timeline_event(mut self, event: JsonValue) -> Self {
        self.timeline.push(event);
        self
    }

    /// Add an event to the state.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.state.push(event);
        self
    }

    pub(super) fn into_json(self) -> JsonValue {
        json!({
            "timeline": { "events": self.timeline, "limited": false },
            "state": { "events": self.state },
        })
    }
}

impl Default for LeftRoomBuilder {
    fn default() -> Self {
        Self::new(&DEFAULT_TEST_ROOM_ID)
    }
}
