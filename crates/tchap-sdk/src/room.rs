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

//! High-level room API

use eyeball::Subscriber;
use ruma::{OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, UserId};
use serde_json::Value as JsonValue;
use tchap_sdk_base::{
    deserialized_responses::{Direction, SyncTimelineEvent, ROOM_MESSAGE},
    trackers::Receipt,
    RoomInfo, RoomState, RoomSummary, StoreError,
};
use tracing::instrument;

use crate::{
    error::HttpResult,
    requests::{MessagesRequest, MessagesResponse},
    send_queue::{RoomSendQueue, RoomSendQueueError, SendHandle},
    timeline::{Timeline, TimelineBuilder},
    Client, Result,
};

/// How many times a failed `/messages` request is retried when the client's
/// request config has no retry limit.
const PAGINATION_RETRY_LIMIT: u32 = 3;

/// A handle on a room known to the client.
///
/// This is cheap to clone. It doesn't cache anything: every read goes to the
/// store, so it always reflects the last applied sync response.
#[derive(Debug, Clone)]
pub struct Room {
    client: Client,
    room_id: OwnedRoomId,
}

impl Room {
    /// Create a new `Room`
    ///
    /// # Arguments
    /// * `client` - The client used to make requests.
    ///
    /// * `room_id` - The ID of the room.
    pub(crate) fn new(client: Client, room_id: OwnedRoomId) -> Self {
        Self { client, room_id }
    }

    /// The ID of the room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The client this room belongs to.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The persisted metadata of the room.
    pub async fn info(&self) -> Result<RoomInfo> {
        Ok(self
            .client
            .base_client()
            .store()
            .get_room_info(&self.room_id)
            .await?
            .ok_or_else(|| StoreError::UnknownRoom(self.room_id.clone()))?)
    }

    /// The summary of the room, as shown in a room list.
    pub async fn summary(&self) -> Result<RoomSummary> {
        Ok(self.info().await?.summary())
    }

    /// The membership of the local user in the room.
    pub async fn state(&self) -> Result<RoomState> {
        Ok(self.info().await?.room_state)
    }

    /// The computed display name of the room.
    pub async fn display_name(&self) -> Result<String> {
        Ok(self.info().await?.display_name())
    }

    /// Get the current state event of the room for the given type and state
    /// key.
    pub async fn get_state_event(
        &self,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<SyncTimelineEvent>> {
        Ok(self
            .client
            .base_client()
            .store()
            .get_state_event(&self.room_id, event_type, state_key)
            .await?)
    }

    /// The users currently typing in the room, the local user excluded.
    pub fn typing_users(&self) -> Vec<OwnedUserId> {
        self.client.base_client().typing_tracker().typing_users(&self.room_id)
    }

    /// Subscribe to the users typing in the room.
    pub fn subscribe_to_typing(&self) -> Subscriber<Vec<OwnedUserId>> {
        self.client.base_client().typing_tracker().subscribe(&self.room_id)
    }

    /// The latest read receipt of the given user in the room, if any was
    /// received in this session.
    pub fn read_receipt(&self, user_id: &UserId) -> Option<Receipt> {
        self.client.base_client().receipt_tracker().read_receipt(&self.room_id, user_id)
    }

    /// Returns the [`RoomSendQueue`] for this specific room.
    pub fn send_queue(&self) -> RoomSendQueue {
        self.client.send_queue().for_room(&self.room_id)
    }

    /// Send an `m.room.message` event to this room.
    ///
    /// The local echo of the event is in the room's timelines when this
    /// returns, the event is sent in the background by the send queue.
    ///
    /// # Arguments
    ///
    /// * `content` - The content of the message.
    ///
    /// * `transaction_id` - The transaction ID to send the event with, it
    ///   makes the request idempotent. A new one is generated if `None`.
    pub async fn send_event(
        &self,
        content: JsonValue,
        transaction_id: Option<OwnedTransactionId>,
    ) -> Result<SendHandle, RoomSendQueueError> {
        self.send_queue().send(ROOM_MESSAGE, content, transaction_id).await
    }

    /// Create a new timeline for this room, starting at its live end.
    pub async fn timeline(&self) -> Result<Timeline> {
        self.timeline_builder().build().await
    }

    /// Returns a [`TimelineBuilder`] for this room, to configure the timeline
    /// before creating it.
    pub fn timeline_builder(&self) -> TimelineBuilder {
        Timeline::builder(self)
    }

    /// Fetch a page of older events from the server.
    ///
    /// The events of the response are in reverse chronological order.
    #[instrument(skip(self), fields(room_id = %self.room_id))]
    pub(crate) async fn messages(&self, from: &str, limit: u32) -> HttpResult<MessagesResponse> {
        let request = MessagesRequest {
            room_id: self.room_id.clone(),
            from: from.to_owned(),
            dir: Direction::Backward,
            limit,
        };

        // Pagination retries are bounded, even when the client's aren't.
        let mut config = self.client.request_config();
        if config.retry_limit.is_none() {
            config = config.retry_limit(PAGINATION_RETRY_LIMIT);
        }

        self.client.send(request, Some(config)).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;
    use tchap_sdk_base::{MatrixSession, RoomState, StoreError};
    use tchap_sdk_test::{sync_state_event, JoinedRoomBuilder, SyncResponseBuilder};

    use crate::{send_queue::RoomSendQueueError, Client, Error};

    async fn client_with_room() -> Client {
        let client =
            Client::builder().homeserver_url("https://matrix.example.org").build().await.unwrap();
        client
            .restore_session(MatrixSession {
                user_id: user_id!("@example:localhost").to_owned(),
                device_id: device_id!("DEVICEID").to_owned(),
                access_token: "1234".to_owned(),
            })
            .await
            .unwrap();

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(JoinedRoomBuilder::new(room_id!("!a:localhost")).add_state_event(
            sync_state_event!("$n", "m.room.name", "", { "name": "Kitchen" }),
        ));
        let response = serde_json::from_value(builder.build_json_sync_response()).unwrap();
        client.base_client().receive_sync_response(response, true).await.unwrap();

        client
    }

    #[tokio::test]
    async fn test_room_reads_from_the_store() {
        let client = client_with_room().await;
        let room = client.get_room(room_id!("!a:localhost")).await.unwrap().unwrap();

        assert_eq!(room.state().await.unwrap(), RoomState::Joined);
        assert_eq!(room.display_name().await.unwrap(), "Kitchen");
        assert_eq!(room.summary().await.unwrap().display_name, "Kitchen");

        let name = room.get_state_event("m.room.name", "").await.unwrap().unwrap();
        assert_eq!(name.event_id, "$n");
        assert!(room.get_state_event("m.room.topic", "").await.unwrap().is_none());
        assert!(room.typing_users().is_empty());
    }

    #[tokio::test]
    async fn test_forgotten_room() {
        let client = client_with_room().await;
        let room = client.get_room(room_id!("!a:localhost")).await.unwrap().unwrap();

        client.force_full_resync().await.unwrap();
        let response = serde_json::from_value(
            SyncResponseBuilder::new().build_json_sync_response(),
        )
        .unwrap();
        client.base_client().receive_sync_response(response, true).await.unwrap();

        assert_matches!(room.info().await, Err(Error::StateStore(StoreError::UnknownRoom(_))));
        assert_matches!(
            room.send_event(json!({ "msgtype": "m.text", "body": "hi" }), None).await,
            Err(RoomSendQueueError::RoomNotJoined)
        );
    }
}
