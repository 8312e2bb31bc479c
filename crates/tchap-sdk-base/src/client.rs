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

use std::{collections::BTreeSet, fmt, sync::Arc};

use eyeball::{SharedObservable, Subscriber};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tchap_sdk_common::timer;
use tracing::{debug, info, instrument, trace};

use crate::{
    deserialized_responses::{
        RoomMemberEventContent, SyncTimelineEvent, TimelineChunk, ROOM_MEMBER,
    },
    error::Result,
    rooms::{RoomHero, RoomInfo, RoomState, RoomSummary},
    store::{
        DynStateStore, IntoStateStore, MemoryStore, RoomBatch, RoomUpdate, RoomUpdates,
        StateStoreDataKey, StateStoreDataValue, Store,
    },
    sync::{InvitedRoom, JoinedRoom, LeftRoom, RoomSummaryBlock, SyncEventsResponse, SyncResponse},
    trackers::{ReceiptTracker, TypingTracker, RECEIPT, TYPING},
    MatrixSession,
};

/// A no (network) IO client implementation.
///
/// This client is a state machine that receives responses and events and
/// accordingly updates its state.
#[derive(Clone)]
pub struct BaseClient {
    /// Database
    store: Store,
    /// The session of the logged-in user, if any.
    session: SharedObservable<Option<MatrixSession>>,
    /// Who is typing where, for this session only.
    typing: TypingTracker,
    /// Who read what, for this session only.
    receipts: ReceiptTracker,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseClient")
            .field("session", &self.session.get())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Default for BaseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseClient {
    /// Create a new default client, backed by a [`MemoryStore`].
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new().into_state_store())
    }

    /// Create a new client backed by the given store.
    pub fn with_store(store: Arc<DynStateStore>) -> Self {
        Self {
            store: Store::new(store),
            session: SharedObservable::new(None),
            typing: TypingTracker::default(),
            receipts: ReceiptTracker::default(),
        }
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The current session, if the client is logged in.
    pub fn session(&self) -> Option<MatrixSession> {
        self.session.get()
    }

    /// Subscribe to the changes of the session.
    pub fn subscribe_to_session(&self) -> Subscriber<Option<MatrixSession>> {
        self.session.subscribe()
    }

    /// The ID of the logged-in user, if any.
    pub fn user_id(&self) -> Option<OwnedUserId> {
        self.session.read().as_ref().map(|session| session.user_id.clone())
    }

    /// Is the client logged in.
    pub fn logged_in(&self) -> bool {
        self.session.read().is_some()
    }

    /// The typing notifications of this session.
    pub fn typing_tracker(&self) -> &TypingTracker {
        &self.typing
    }

    /// The read receipts of this session.
    pub fn receipt_tracker(&self) -> &ReceiptTracker {
        &self.receipts
    }

    /// Set the session of the client and persist it.
    ///
    /// # Arguments
    ///
    /// * `session` - The session that the client should use.
    pub async fn activate(&self, session: MatrixSession) -> Result<()> {
        self.store
            .set_kv_data(StateStoreDataKey::Session, StateStoreDataValue::Session(session.clone()))
            .await?;
        info!(user_id = %session.user_id, device_id = %session.device_id, "Session activated");
        self.session.set(Some(session));

        Ok(())
    }

    /// Restore the session persisted in the store, if any.
    pub async fn restore_session(&self) -> Result<Option<MatrixSession>> {
        let session = self.store.session().await?;

        if let Some(session) = &session {
            info!(user_id = %session.user_id, "Restored session from the store");
            self.session.set(Some(session.clone()));
        }

        Ok(session)
    }

    /// Forget the session and everything scoped to it, without telling the
    /// server.
    ///
    /// The rooms and the sync token stay in the store.
    pub async fn logout_locally(&self) -> Result<()> {
        self.store.remove_kv_data(StateStoreDataKey::Session).await?;
        self.session.set(None);
        self.typing.clear();
        self.receipts.clear();

        Ok(())
    }

    /// The token of the last sync response that was fully applied.
    pub async fn sync_token(&self) -> Result<Option<String>> {
        Ok(self.store.sync_token().await?)
    }

    /// Forget the sync token, so the next sync is an initial one.
    pub async fn clear_sync_token(&self) -> Result<()> {
        self.store.remove_kv_data(StateStoreDataKey::SyncToken).await?;
        Ok(())
    }

    /// The summaries of all the rooms the store knows about.
    pub async fn room_summaries(&self) -> Result<Vec<RoomSummary>> {
        Ok(self.store.get_room_infos().await?.iter().map(RoomInfo::summary).collect())
    }

    /// Receive a response from a sync call.
    ///
    /// Every room is applied in its own store transaction, then the sync
    /// token is advanced, then the subscribers are told which rooms changed.
    /// If anything fails the token isn't advanced, so the same batch is
    /// requested again.
    ///
    /// # Arguments
    ///
    /// * `response` - The response that we received after a successful sync.
    ///
    /// * `is_initial` - Whether the request was sent without a `since` token.
    #[instrument(skip_all, fields(next_batch = %response.next_batch))]
    pub async fn receive_sync_response(
        &self,
        response: SyncEventsResponse,
        is_initial: bool,
    ) -> Result<SyncResponse> {
        // The server returns the same response multiple times in some cases,
        // e.g. when the long-poll times out without anything new.
        if !is_initial && self.store.sync_token().await?.as_deref() == Some(&response.next_batch) {
            info!("Got the same sync response twice");
            return Ok(SyncResponse { next_batch: response.next_batch, ..Default::default() });
        }

        let _timer = timer!("receive_sync_response");

        let SyncEventsResponse { next_batch, rooms } = response;
        let own_user_id = self.user_id();
        let seen: BTreeSet<OwnedRoomId> = rooms.room_ids().cloned().collect();
        let mut updates = RoomUpdates::default();

        for (room_id, room) in rooms.join {
            let update =
                self.handle_joined_room(&room_id, room, &next_batch, own_user_id.as_deref()).await?;
            updates.insert(&room_id, update);
        }

        for (room_id, room) in rooms.invite {
            self.handle_invited_room(&room_id, room).await?;
            updates.insert(&room_id, RoomUpdate::default());
        }

        for (room_id, room) in rooms.leave {
            self.handle_left_room(&room_id, room).await?;
            updates.insert(&room_id, RoomUpdate { timeline_reset: true });
        }

        let mut removed_rooms = Vec::new();
        if is_initial {
            for info in self.store.get_room_infos().await? {
                if seen.contains(&info.room_id) {
                    continue;
                }

                let _guard = self.store.lock_room(&info.room_id).await;
                debug!(room_id = %info.room_id, "Removing room absent from the initial sync");
                self.store.remove_room(&info.room_id).await?;
                updates.insert(&info.room_id, RoomUpdate { timeline_reset: true });
                removed_rooms.push(info.room_id);
            }
        }

        self.store
            .set_kv_data(StateStoreDataKey::SyncToken, StateStoreDataValue::SyncToken(next_batch.clone()))
            .await?;

        self.store.notify_room_updates(updates.clone());

        Ok(SyncResponse { next_batch, rooms: updates, removed_rooms })
    }

    async fn handle_joined_room(
        &self,
        room_id: &RoomId,
        room: JoinedRoom,
        next_batch: &str,
        own_user_id: Option<&UserId>,
    ) -> Result<RoomUpdate> {
        let _guard = self.store.lock_room(room_id).await;

        let mut info = self
            .store
            .get_room_info(room_id)
            .await?
            .unwrap_or_else(|| RoomInfo::new(room_id, RoomState::Joined));
        info.room_state = RoomState::Joined;

        let JoinedRoom { summary, state, timeline, ephemeral, unread_notifications } = room;

        let mut state_events = state.events;
        state_events.extend(timeline.events.iter().filter(|event| event.is_state()).cloned());

        self.update_summary(&mut info, &summary, &state_events).await?;

        if let Some(unread_notifications) = unread_notifications {
            info.unread_notifications = unread_notifications;
        }

        if let Some(latest) =
            timeline.events.iter().rev().find(|event| event.kind().is_suitable_as_latest_event())
        {
            // A replayed batch must not move the preview back to an older event.
            let is_newer = info
                .latest_event
                .as_ref()
                .map_or(true, |current| latest.origin_server_ts >= current.origin_server_ts);

            if is_newer {
                info.latest_event = Some(latest.clone());
            } else {
                trace!(%room_id, event_id = %latest.event_id, "Keeping the newer latest event");
            }
        }

        trace!(
            %room_id,
            state_events = state_events.len(),
            timeline_events = timeline.events.len(),
            limited = timeline.limited,
            "Applying joined room"
        );

        let limited = timeline.limited;
        let batch = RoomBatch {
            room_info: info,
            state_events,
            timeline: TimelineChunk {
                prev_token: timeline.prev_batch,
                next_token: Some(next_batch.to_owned()),
                events: timeline.events,
            },
            limited,
            clear_timeline: false,
        };
        self.store.apply_room_batch(&batch).await?;

        for event in ephemeral.events {
            match event.event_type.as_str() {
                TYPING => self.typing.handle_typing_event(room_id, own_user_id, &event.content),
                RECEIPT => self.receipts.handle_receipt_event(room_id, &event.content),
                _ => {}
            }
        }

        Ok(RoomUpdate { timeline_reset: limited })
    }

    async fn handle_invited_room(&self, room_id: &RoomId, room: InvitedRoom) -> Result<()> {
        let _guard = self.store.lock_room(room_id).await;

        let mut info = self
            .store
            .get_room_info(room_id)
            .await?
            .unwrap_or_else(|| RoomInfo::new(room_id, RoomState::Invited));
        info.room_state = RoomState::Invited;

        for event in &room.invite_state.events {
            info.handle_stripped_state_event(event);
        }

        self.store.apply_room_batch(&RoomBatch::new(info)).await?;

        Ok(())
    }

    async fn handle_left_room(&self, room_id: &RoomId, room: LeftRoom) -> Result<()> {
        let _guard = self.store.lock_room(room_id).await;

        let mut info = self
            .store
            .get_room_info(room_id)
            .await?
            .unwrap_or_else(|| RoomInfo::new(room_id, RoomState::Left));
        info.room_state = RoomState::Left;

        let mut batch = RoomBatch::new(info);
        batch.state_events = room.state.events;
        batch
            .state_events
            .extend(room.timeline.events.into_iter().filter(SyncTimelineEvent::is_state));
        batch.clear_timeline = true;

        self.store.apply_room_batch(&batch).await?;
        debug!(%room_id, "Left room");

        Ok(())
    }

    /// Update the heroes and member counts of a room from the `summary` block
    /// of a sync response.
    async fn update_summary(
        &self,
        info: &mut RoomInfo,
        summary: &RoomSummaryBlock,
        state_events: &[SyncTimelineEvent],
    ) -> Result<()> {
        if let Some(count) = summary.joined_member_count {
            info.joined_member_count = count;
        }

        if let Some(count) = summary.invited_member_count {
            info.invited_member_count = count;
        }

        let Some(heroes) = &summary.heroes else {
            return Ok(());
        };

        let mut resolved = Vec::with_capacity(heroes.len());
        for user_id in heroes {
            // Prefer the member event of this batch, it's newer than the
            // stored one.
            let member_event = match state_events.iter().rev().find(|event| {
                event.event_type == ROOM_MEMBER && event.state_key.as_deref() == Some(user_id.as_str())
            }) {
                Some(event) => Some(event.clone()),
                None => {
                    self.store.get_state_event(&info.room_id, ROOM_MEMBER, user_id.as_str()).await?
                }
            };

            let display_name = member_event
                .and_then(|event| event.content_as::<RoomMemberEventContent>().ok())
                .and_then(|content| content.displayname);

            resolved.push(RoomHero { user_id: user_id.clone(), display_name });
        }

        info.heroes = resolved;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use ruma::{device_id, room_id, user_id};
    use serde_json::{json, Value as JsonValue};
    use tchap_sdk_test::{
        sync_state_event, sync_timeline_event, InvitedRoomBuilder, JoinedRoomBuilder,
        LeftRoomBuilder, SyncResponseBuilder,
    };

    use super::*;
    use crate::deserialized_responses::Direction;

    fn parse(json: JsonValue) -> SyncEventsResponse {
        serde_json::from_value(json).expect("the sync response should be valid")
    }

    async fn logged_in_client() -> BaseClient {
        let client = BaseClient::new();
        client
            .activate(MatrixSession {
                user_id: user_id!("@me:example.org").to_owned(),
                device_id: device_id!("DEVICE").to_owned(),
                access_token: "token".to_owned(),
            })
            .await
            .unwrap();
        client
    }

    async fn timeline_ids(client: &BaseClient, room_id: &RoomId) -> Vec<String> {
        client
            .store()
            .query_timeline_slice(room_id, None, Direction::Backward, 100)
            .await
            .unwrap()
            .unwrap()
            .chunk
            .events
            .into_iter()
            .map(|event| event.event_id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_sync_token_advances_after_apply() {
        let client = logged_in_client().await;
        let room_id = room_id!("!r1:example.org");
        let mut updates = client.store().subscribe_to_room_updates();

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(
            JoinedRoomBuilder::new(room_id)
                .add_timeline_event(sync_timeline_event!("$e1", "@alice:example.org", "one"))
                .add_timeline_event(sync_timeline_event!("$e2", "@alice:example.org", "two")),
        );
        let response = builder.build_json_sync_response_with_token("t1");

        let output = client.receive_sync_response(parse(response), true).await.unwrap();

        assert_eq!(output.next_batch, "t1");
        assert!(output.rooms.contains(room_id));
        assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t1"));
        assert_eq!(timeline_ids(&client, room_id).await, ["$e1", "$e2"]);

        let notified = updates.recv().await.unwrap();
        assert!(notified.contains(room_id));

        // The same response again doesn't do anything.
        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(
            sync_timeline_event!("$e3", "@alice:example.org", "three"),
        ));
        let output = client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t1")), false)
            .await
            .unwrap();
        assert!(output.rooms.is_empty());
        assert_eq!(timeline_ids(&client, room_id).await, ["$e1", "$e2"]);
    }

    #[tokio::test]
    async fn test_room_name_last_write_wins() {
        let client = logged_in_client().await;
        let room_id = room_id!("!r1:example.org");

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_state_event(
            sync_state_event!("$name_a", "m.room.name", "", { "name": "A" }),
        ));
        let first = builder.build_json_sync_response_with_token("t1");
        client.receive_sync_response(parse(first.clone()), true).await.unwrap();

        builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(
            sync_state_event!("$name_b", "m.room.name", "", { "name": "B" }),
        ));
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t2")), false)
            .await
            .unwrap();

        let name = client.store().get_state_event(room_id, "m.room.name", "").await.unwrap();
        assert_let!(Some(name) = name);
        assert_eq!(name.content, json!({ "name": "B" }));

        // A replay of the first batch doesn't revert anything.
        client.receive_sync_response(parse(first), false).await.unwrap();
        let summaries = client.room_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].display_name, "B");
    }

    #[tokio::test]
    async fn test_summary_from_heroes_and_unread_counts() {
        let client = logged_in_client().await;
        let room_id = room_id!("!r1:example.org");

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(
            JoinedRoomBuilder::new(room_id)
                .set_summary(json!({
                    "m.heroes": ["@bob:example.org", "@carol:example.org"],
                    "m.joined_member_count": 3,
                }))
                .set_unread_notifications(4, 1)
                .add_state_event(sync_state_event!(
                    "$bob",
                    "m.room.member",
                    "@bob:example.org",
                    { "membership": "join", "displayname": "Bob" }
                ))
                .add_timeline_event(sync_timeline_event!("$e1", "@bob:example.org", "hello")),
        );
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t1")), true)
            .await
            .unwrap();

        let summary = client.store().get_room_info(room_id).await.unwrap().unwrap().summary();
        assert_eq!(summary.display_name, "Bob and @carol:example.org");
        assert_eq!(summary.unread_notifications.notification_count, 4);
        assert_eq!(summary.unread_notifications.highlight_count, 1);
        assert_let!(Some(latest) = summary.latest_event);
        assert_eq!(latest.event_id, "$e1");
    }

    #[tokio::test]
    async fn test_replayed_batch_keeps_the_latest_event() {
        let client = logged_in_client().await;
        let room_id = room_id!("!r1:example.org");

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(
            sync_timeline_event!({
                "event_id": "$old",
                "sender": "@bob:example.org",
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": "old" },
                "origin_server_ts": 1,
            }),
        ));
        let first = builder.build_json_sync_response_with_token("t1");
        client.receive_sync_response(parse(first.clone()), true).await.unwrap();

        builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(
            sync_timeline_event!({
                "event_id": "$new",
                "sender": "@bob:example.org",
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": "new" },
                "origin_server_ts": 2,
            }),
        ));
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t2")), false)
            .await
            .unwrap();

        client.receive_sync_response(parse(first), false).await.unwrap();

        let info = client.store().get_room_info(room_id).await.unwrap().unwrap();
        assert_let!(Some(latest) = info.latest_event);
        assert_eq!(latest.event_id, "$new");
        assert_eq!(timeline_ids(&client, room_id).await, ["$old", "$new"]);
    }

    #[tokio::test]
    async fn test_invited_and_left_rooms() {
        let client = logged_in_client().await;
        let invited = room_id!("!invited:example.org");
        let joined = room_id!("!joined:example.org");

        let mut builder = SyncResponseBuilder::new();
        builder
            .add_invited_room(InvitedRoomBuilder::new(invited).add_state_event(json!({
                "type": "m.room.name",
                "state_key": "",
                "sender": "@bob:example.org",
                "content": { "name": "Secret plans" },
            })))
            .add_joined_room(
                JoinedRoomBuilder::new(joined)
                    .add_state_event(sync_state_event!("$n", "m.room.name", "", { "name": "J" }))
                    .add_timeline_event(sync_timeline_event!("$e1", "@bob:example.org", "hi")),
            );
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t1")), true)
            .await
            .unwrap();

        let info = client.store().get_room_info(invited).await.unwrap().unwrap();
        assert_eq!(info.room_state, RoomState::Invited);
        assert_eq!(info.display_name(), "Secret plans");

        builder.add_left_room(LeftRoomBuilder::new(joined).add_timeline_event(sync_state_event!(
            "$leave",
            "m.room.member",
            "@me:example.org",
            { "membership": "leave" }
        )));
        let output = client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t2")), false)
            .await
            .unwrap();
        assert!(output.rooms.is_timeline_reset(joined));

        let info = client.store().get_room_info(joined).await.unwrap().unwrap();
        assert_eq!(info.room_state, RoomState::Left);
        assert_eq!(info.display_name(), "J");
        assert!(timeline_ids(&client, joined).await.is_empty());
        assert!(client
            .store()
            .get_state_event(joined, "m.room.member", "@me:example.org")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_silence_is_not_removal_but_initial_sync_replaces() {
        let client = logged_in_client().await;
        let r1 = room_id!("!r1:example.org");
        let r2 = room_id!("!r2:example.org");

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(JoinedRoomBuilder::new(r1)).add_joined_room(JoinedRoomBuilder::new(r2));
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t1")), true)
            .await
            .unwrap();

        // An incremental sync not mentioning r2 keeps it.
        builder.add_joined_room(JoinedRoomBuilder::new(r1));
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t2")), false)
            .await
            .unwrap();
        assert!(client.store().get_room_info(r2).await.unwrap().is_some());

        // An initial sync not mentioning r2 removes it.
        builder.add_joined_room(JoinedRoomBuilder::new(r1));
        let output = client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t3")), true)
            .await
            .unwrap();
        assert_eq!(output.removed_rooms, [r2.to_owned()]);
        assert!(client.store().get_room_info(r2).await.unwrap().is_none());
        assert!(client.store().get_room_info(r1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ephemeral_events_feed_the_trackers() {
        let client = logged_in_client().await;
        let room_id = room_id!("!r1:example.org");

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(
            JoinedRoomBuilder::new(room_id)
                .add_ephemeral_event(json!({
                    "type": "m.typing",
                    "content": { "user_ids": ["@me:example.org", "@bob:example.org"] },
                }))
                .add_ephemeral_event(json!({
                    "type": "m.receipt",
                    "content": { "$e1": { "m.read": { "@bob:example.org": { "ts": 1 } } } },
                })),
        );
        client
            .receive_sync_response(parse(builder.build_json_sync_response_with_token("t1")), true)
            .await
            .unwrap();

        assert_eq!(
            client.typing_tracker().typing_users(room_id),
            [user_id!("@bob:example.org").to_owned()]
        );
        assert_let!(
            Some(receipt) =
                client.receipt_tracker().read_receipt(room_id, user_id!("@bob:example.org"))
        );
        assert_eq!(receipt.event_id, "$e1");

        // Logging out clears the session-scoped trackers.
        client.logout_locally().await.unwrap();
        assert!(!client.logged_in());
        assert!(client.typing_tracker().typing_users(room_id).is_empty());
        assert!(client.receipt_tracker().read_receipt(room_id, user_id!("@bob:example.org")).is_none());
        assert!(client.restore_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_session() {
        let client = logged_in_client().await;
        let store = client.store().inner().clone();

        let restored = BaseClient::with_store(store);
        assert!(!restored.logged_in());
        assert_let!(Some(session) = restored.restore_session().await.unwrap());
        assert_eq!(session.user_id, "@me:example.org");
        assert_eq!(restored.user_id().as_deref(), Some(user_id!("@me:example.org")));
    }
}
