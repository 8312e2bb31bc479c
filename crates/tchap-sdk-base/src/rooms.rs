// Copyright 2020 Damir Jelić
// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! Per-room metadata derived from state events.

use std::fmt;

use ruma::{OwnedRoomId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};

use crate::deserialized_responses::{
    CanonicalAliasEventContent, EventKind, RoomAvatarEventContent, RoomNameEventContent,
    StrippedStateEvent, SyncTimelineEvent,
};

/// The membership state of the local user in a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomState {
    /// The user has joined the room.
    Joined,
    /// The user has been invited to the room.
    Invited,
    /// The user has left the room, or has been kicked or banned from it.
    Left,
}

/// A member of a room used to compute the room display name when the room has
/// no name and no alias.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomHero {
    /// The user ID of the hero.
    pub user_id: OwnedUserId,
    /// The display name of the hero, if known.
    pub display_name: Option<String>,
}

impl RoomHero {
    fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or_else(|| self.user_id.as_str())
    }
}

/// Unread notification counts, as reported by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotificationsCount {
    /// The number of unread notifications.
    #[serde(default)]
    pub notification_count: u64,
    /// The number of unread highlights.
    #[serde(default)]
    pub highlight_count: u64,
}

/// The persisted metadata of a room.
///
/// It is derived from the room state and summary received through sync, and
/// written to the store in the same transaction as the events it was derived
/// from.
#[derive(Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    /// The ID of the room.
    pub room_id: OwnedRoomId,

    /// The membership state of the local user.
    pub room_state: RoomState,

    /// The `name` of the `m.room.name` state event, if any.
    #[serde(default)]
    pub name: Option<String>,

    /// The `alias` of the `m.room.canonical_alias` state event, if any.
    #[serde(default)]
    pub canonical_alias: Option<String>,

    /// The `url` of the `m.room.avatar` state event, if any.
    #[serde(default)]
    pub avatar_url: Option<String>,

    /// The members used to compute the display name.
    #[serde(default)]
    pub heroes: Vec<RoomHero>,

    /// The number of joined members, if the server told us.
    #[serde(default)]
    pub joined_member_count: u64,

    /// The number of invited members, if the server told us.
    #[serde(default)]
    pub invited_member_count: u64,

    /// The unread counts.
    #[serde(default)]
    pub unread_notifications: UnreadNotificationsCount,

    /// The latest event of the room that is suitable to be shown in a room
    /// list.
    #[serde(default)]
    pub latest_event: Option<SyncTimelineEvent>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomInfo")
            .field("room_id", &self.room_id)
            .field("room_state", &self.room_state)
            .field("joined_member_count", &self.joined_member_count)
            .field("invited_member_count", &self.invited_member_count)
            .field("unread_notifications", &self.unread_notifications)
            .finish_non_exhaustive()
    }
}

impl RoomInfo {
    /// Create an empty `RoomInfo` for the given room.
    pub fn new(room_id: &RoomId, room_state: RoomState) -> Self {
        Self {
            room_id: room_id.to_owned(),
            room_state,
            name: None,
            canonical_alias: None,
            avatar_url: None,
            heroes: Vec::new(),
            joined_member_count: 0,
            invited_member_count: 0,
            unread_notifications: UnreadNotificationsCount::default(),
            latest_event: None,
        }
    }

    /// Update the info from a room state event.
    ///
    /// Returns `true` if the info changed. Events that don't affect the
    /// info, or whose content doesn't decode, are ignored.
    pub fn handle_state_event(&mut self, event: &SyncTimelineEvent) -> bool {
        if event.state_key.as_deref() != Some("") {
            return false;
        }

        match event.kind() {
            EventKind::RoomName => {
                let name = event.content_as::<RoomNameEventContent>().ok().and_then(|c| c.name);
                replace_if_changed(&mut self.name, name.filter(|n| !n.is_empty()))
            }
            EventKind::CanonicalAlias => {
                let alias =
                    event.content_as::<CanonicalAliasEventContent>().ok().and_then(|c| c.alias);
                replace_if_changed(&mut self.canonical_alias, alias)
            }
            EventKind::RoomAvatar => {
                let url = event.content_as::<RoomAvatarEventContent>().ok().and_then(|c| c.url);
                replace_if_changed(&mut self.avatar_url, url)
            }
            _ => false,
        }
    }

    /// Update the info from a stripped state event of an invite.
    pub fn handle_stripped_state_event(&mut self, event: &StrippedStateEvent) -> bool {
        if !event.state_key.is_empty() {
            return false;
        }

        match event.event_type.as_str() {
            crate::deserialized_responses::ROOM_NAME => {
                let name = event.content_as::<RoomNameEventContent>().ok().and_then(|c| c.name);
                replace_if_changed(&mut self.name, name.filter(|n| !n.is_empty()))
            }
            crate::deserialized_responses::ROOM_CANONICAL_ALIAS => {
                let alias =
                    event.content_as::<CanonicalAliasEventContent>().ok().and_then(|c| c.alias);
                replace_if_changed(&mut self.canonical_alias, alias)
            }
            crate::deserialized_responses::ROOM_AVATAR => {
                let url = event.content_as::<RoomAvatarEventContent>().ok().and_then(|c| c.url);
                replace_if_changed(&mut self.avatar_url, url)
            }
            _ => false,
        }
    }

    /// Compute the display name of the room.
    ///
    /// In order: the room name, the canonical alias, a name built from the
    /// heroes, and finally `"Empty Room"`.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        if let Some(alias) = &self.canonical_alias {
            return alias.clone();
        }

        let names: Vec<&str> = self.heroes.iter().map(RoomHero::display_name).collect();
        let total = (self.joined_member_count + self.invited_member_count) as usize;
        // The heroes never include the local user, the total does.
        let others = total.saturating_sub(names.len() + 1);

        match names.as_slice() {
            [] => "Empty Room".to_owned(),
            [one] if others == 0 => (*one).to_owned(),
            [first, second] if others == 0 => format!("{first} and {second}"),
            [rest @ .., last] if others == 0 => format!("{} and {last}", rest.join(", ")),
            _ => format!("{} and {others} others", names.join(", ")),
        }
    }

    /// Build the summary of this room, as shown in a room list.
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            room_state: self.room_state,
            display_name: self.display_name(),
            avatar_url: self.avatar_url.clone(),
            unread_notifications: self.unread_notifications,
            latest_event: self.latest_event.clone(),
        }
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// A room as shown in a room list.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomSummary {
    /// The ID of the room.
    pub room_id: OwnedRoomId,
    /// The membership state of the local user.
    pub room_state: RoomState,
    /// The computed display name.
    pub display_name: String,
    /// The avatar of the room.
    pub avatar_url: Option<String>,
    /// The unread counts.
    pub unread_notifications: UnreadNotificationsCount,
    /// The latest displayable event.
    pub latest_event: Option<SyncTimelineEvent>,
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};
    use serde_json::json;

    use super::*;

    fn state_event(event_type: &str, content: serde_json::Value) -> SyncTimelineEvent {
        serde_json::from_value(json!({
            "event_id": "$state",
            "sender": "@alice:example.org",
            "type": event_type,
            "state_key": "",
            "content": content,
            "origin_server_ts": 1,
        }))
        .unwrap()
    }

    fn hero(user_id: &str, name: &str) -> RoomHero {
        RoomHero { user_id: user_id.try_into().unwrap(), display_name: Some(name.to_owned()) }
    }

    #[test]
    fn test_name_takes_precedence() {
        let mut info = RoomInfo::new(room_id!("!r:example.org"), RoomState::Joined);
        assert!(info.handle_state_event(&state_event(
            "m.room.canonical_alias",
            json!({ "alias": "#a:example.org" })
        )));
        assert_eq!(info.display_name(), "#a:example.org");

        assert!(info.handle_state_event(&state_event("m.room.name", json!({ "name": "A" }))));
        assert_eq!(info.display_name(), "A");

        // Same name again, nothing changes.
        assert!(!info.handle_state_event(&state_event("m.room.name", json!({ "name": "A" }))));

        // An empty name removes the name.
        assert!(info.handle_state_event(&state_event("m.room.name", json!({ "name": "" }))));
        assert_eq!(info.display_name(), "#a:example.org");
    }

    #[test]
    fn test_display_name_from_heroes() {
        let mut info = RoomInfo::new(room_id!("!r:example.org"), RoomState::Joined);
        assert_eq!(info.display_name(), "Empty Room");

        info.heroes = vec![hero("@bob:example.org", "Bob")];
        info.joined_member_count = 2;
        assert_eq!(info.display_name(), "Bob");

        info.heroes.push(hero("@carol:example.org", "Carol"));
        info.joined_member_count = 3;
        assert_eq!(info.display_name(), "Bob and Carol");

        info.heroes.push(hero("@dan:example.org", "Dan"));
        info.joined_member_count = 4;
        assert_eq!(info.display_name(), "Bob, Carol and Dan");

        info.joined_member_count = 10;
        assert_eq!(info.display_name(), "Bob, Carol, Dan and 6 others");
    }

    #[test]
    fn test_hero_without_display_name_uses_user_id() {
        let mut info = RoomInfo::new(room_id!("!r:example.org"), RoomState::Joined);
        info.heroes =
            vec![RoomHero { user_id: user_id!("@bob:example.org").to_owned(), display_name: None }];

        assert_eq!(info.display_name(), "@bob:example.org");
    }

    #[test]
    fn test_non_empty_state_key_is_ignored() {
        let mut info = RoomInfo::new(room_id!("!r:example.org"), RoomState::Joined);
        let mut event = state_event("m.room.name", json!({ "name": "A" }));
        event.state_key = Some("not-empty".to_owned());

        assert!(!info.handle_state_event(&event));
        assert_eq!(info.name, None);
    }
}
