use ruma::{OwnedRoomId, RoomId};
use serde_json::{json, Value as JsonValue};

use crate::DEFAULT_TEST_ROOM_ID;

pub struct JoinedRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    timeline: Vec<JsonValue>,
    limited: bool,
    prev_batch: Option<String>,
    state: Vec<JsonValue>,
    ephemeral: Vec<JsonValue>,
    summary: Option<JsonValue>,
    unread_notifications: Option<JsonValue>,
}

impl JoinedRoomBuilder {
    /// Create a new `JoinedRoomBuilder` for the given room ID.
    ///
    /// If the room ID is [`DEFAULT_TEST_ROOM_ID`],
    /// [`JoinedRoomBuilder::default()`] can be used instead.
    pub fn new(room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.to_owned(),
            timeline: Vec::new(),
            limited: false,
            prev_batch: None,
            state: Vec::new(),
            ephemeral: Vec::new(),
            summary: None,
            unread_notifications: None,
        }
    }

    /// Add an event to the timeline.
    ///
    /// The event can be created with the
    /// [`sync_timeline_event`](crate::sync_timeline_event) macro.
    pub fn add_timeline_event(mut self, event: JsonValue) -> Self {
        self.timeline.push(event);
        self
    }

    /// Add events in bulk to the timeline.
    pub fn add_timeline_bulk<I>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = JsonValue>,
    {
        self.timeline.extend(events);
        self
    }

    /// Set the timeline as limited.
    pub fn set_timeline_limited(mut self) -> Self {
        self.limited = true;
        self
    }

    /// Set the `prev_batch` of the timeline.
    pub fn set_timeline_prev_batch(mut self, prev_batch: impl Into<String>) -> Self {
        self.prev_batch = Some(prev_batch.into());
        self
    }

    /// Add an event to the state.
    ///
    /// The event can be created with the
    /// [`sync_state_event`](crate::sync_state_event) macro.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.state.push(event);
        self
    }

    /// Add an ephemeral event, e.g. `m.typing`.
    pub fn add_ephemeral_event(mut self, event: JsonValue) -> Self {
        self.ephemeral.push(event);
        self
    }

    /// Set the room summary, e.g. `{ "m.heroes": [...] }`.
    pub fn set_summary(mut self, summary: JsonValue) -> Self {
        self.summary = Some(summary);
        self
    }

    /// Set the unread notification counts.
    pub fn set_unread_notifications(mut self, notification_count: u64, highlight_count: u64) -> Self {
        self.unread_notifications = Some(json!({
            "notification_count": notification_count,
            "highlight_count": highlight_count,
        }));
        self
    }

    pub(super) fn into_json(self) -> JsonValue {
        let mut timeline = json!({ "events": self.timeline, "limited": self.limited });
        if let Some(prev_batch) = self.prev_batch {
            timeline["prev_batch"] = prev_batch.into();
        }

        let mut room = json!({
            "timeline": timeline,
            "state": { "events": self.state },
            "ephemeral": { "events": self.ephemeral },
        });

        if let Some(summary) = self.summary {
            room["summary"] = summary;
        }
        if let Some(unread_notifications) = self.unread_notifications {
            room["unread_notifications"] = unread_notifications;
        }

        room
    }
}

impl Default for JoinedRoomBuilder {
    fn default() -> Self {
        Self::new(&DEFAULT_TEST_ROOM_ID)
    }
}
