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

//! A send queue facility to serializing queuing and sending of events.
//!
//! Every event gets a local echo in the store as soon as it's queued, so that
//! timelines show it right away. A background task per room then sends the
//! queued events one after the other, retrying network failures, and records
//! the outcome on the echo. The echo is replaced by the confirmed event when
//! the latter comes down sync.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, PoisonError, RwLock as SyncRwLock},
};

use ruma::{OwnedRoomId, OwnedTransactionId, RoomId, TransactionId};
use serde_json::Value as JsonValue;
use tchap_sdk_base::{
    store::send_queue::{LocalEcho, SendState},
    RoomState, StoreError,
};
use tchap_sdk_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    retry::{self, RetryError},
};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    client::WeakClient, config::SendQueueConfig, error::HttpError, requests::SendEventRequest,
    Client, Result,
};

/// A client-wide send queue, for all the rooms known by a client.
pub struct SendQueue {
    client: Client,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue").finish_non_exhaustive()
    }
}

impl SendQueue {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// The send queue of the given room.
    pub fn for_room(&self, room_id: &RoomId) -> RoomSendQueue {
        let data = &self.client.inner.send_queue_data;
        let mut map = data.rooms.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(room_q) = map.get(room_id).cloned() {
            return room_q;
        }

        let room_q = RoomSendQueue::new(&self.client, room_id.to_owned(), data.config);
        map.insert(room_id.to_owned(), room_q.clone());
        room_q
    }

    /// Mark the local echoes that were being sent when the client last stopped
    /// as failed, so that they can be resent or discarded.
    ///
    /// Echoes of events that are still queued in this session are left alone.
    ///
    /// Returns the number of echoes that were marked as failed.
    #[instrument(skip(self))]
    pub async fn load_pending(&self) -> Result<usize> {
        let store = self.client.base_client().store();
        let mut count = 0;

        for room_id in store.active_room_ids().await? {
            let room_q = self.client.inner.send_queue_data.get(&room_id);

            for echo in store.local_echoes(&room_id).await? {
                if !echo.send_state.is_sending() {
                    continue;
                }

                if let Some(room_q) = &room_q {
                    if room_q.inner.queue.contains(&echo.transaction_id).await {
                        continue;
                    }
                }

                let send_state = SendState::Failed {
                    error: "the client stopped while the event was being sent".to_owned(),
                    is_recoverable: true,
                };
                store.update_echo_send_state(&room_id, &echo.transaction_id, &send_state).await?;
                count += 1;
            }
        }

        if count > 0 {
            info!(count, "Marked interrupted sends as failed");
        }

        Ok(count)
    }
}

pub(crate) struct SendQueueData {
    /// Mapping of room to their unique send queue.
    rooms: SyncRwLock<BTreeMap<OwnedRoomId, RoomSendQueue>>,

    /// How the events are retried.
    config: SendQueueConfig,
}

impl SendQueueData {
    pub fn new(config: SendQueueConfig) -> Self {
        Self { rooms: Default::default(), config }
    }

    fn get(&self, room_id: &RoomId) -> Option<RoomSendQueue> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).get(room_id).cloned()
    }

    /// Stop all the sending tasks, and forget about the queued events.
    ///
    /// Their echoes stay in the store in the sending state.
    pub fn abort_all(&self) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);

        debug!(rooms = rooms.len(), "Aborting all the sending tasks");
        for room_q in rooms.values() {
            room_q.inner.task.abort();
        }

        rooms.clear();
    }
}

/// A per-room send queue.
///
/// This is cheap to clone.
#[derive(Clone)]
pub struct RoomSendQueue {
    inner: Arc<RoomSendQueueInner>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for RoomSendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSendQueue").field("room_id", &self.inner.room_id).finish_non_exhaustive()
    }
}

impl RoomSendQueue {
    fn new(client: &Client, room_id: OwnedRoomId, config: SendQueueConfig) -> Self {
        let client = WeakClient::from_client(client);
        let queue = QueueStorage::new();
        let notifier = Arc::new(Notify::new());

        let task = spawn(Self::sending_task(
            client.clone(),
            room_id.clone(),
            queue.clone(),
            notifier.clone(),
            config,
        ))
        .abort_on_drop();

        Self { inner: Arc::new(RoomSendQueueInner { client, room_id, queue, notifier, task }) }
    }

    /// The ID of the room this queue sends to.
    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    /// Queue an event for sending it to this room.
    ///
    /// The local echo is in the store when this returns, the event itself is
    /// sent in the background. Its progress is reflected on the send state of
    /// the echo.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of the event, e.g. `m.room.message`.
    ///
    /// * `content` - The content of the event.
    ///
    /// * `transaction_id` - The transaction ID to send the event with. A new
    ///   one is generated if `None`.
    #[instrument(skip(self, content), fields(room_id = %self.inner.room_id))]
    pub async fn send(
        &self,
        event_type: &str,
        content: JsonValue,
        transaction_id: Option<OwnedTransactionId>,
    ) -> Result<SendHandle, RoomSendQueueError> {
        let client = self.client()?;

        // The queues are dropped on logout, a handle obtained before that
        // must not queue events that no task will ever send.
        let current = client.send_queue().for_room(self.room_id());
        if !Arc::ptr_eq(&current.inner, &self.inner) {
            debug!("This queue was aborted, using the room's current queue");
        }

        current.enqueue(&client, event_type, content, transaction_id).await
    }

    async fn enqueue(
        &self,
        client: &Client,
        event_type: &str,
        content: JsonValue,
        transaction_id: Option<OwnedTransactionId>,
    ) -> Result<SendHandle, RoomSendQueueError> {
        let store = client.base_client().store();

        let room_state = store.get_room_info(self.room_id()).await?.map(|info| info.room_state);
        if room_state != Some(RoomState::Joined) {
            return Err(RoomSendQueueError::RoomNotJoined);
        }

        let transaction_id = transaction_id.unwrap_or_else(TransactionId::new);
        let echo = LocalEcho::new(transaction_id.clone(), event_type.to_owned(), content);
        store.upsert_local_echo(self.room_id(), &echo).await?;

        self.inner.queue.push(echo).await;
        trace!(%transaction_id, "Queued an event for the background task");
        self.inner.notifier.notify_one();

        Ok(SendHandle { queue: self.clone(), transaction_id })
    }

    fn client(&self) -> Result<Client, RoomSendQueueError> {
        self.inner.client.get().ok_or(RoomSendQueueError::ClientDropped)
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn sending_task(
        client: WeakClient,
        room_id: OwnedRoomId,
        queue: QueueStorage,
        notifier: Arc<Notify>,
        config: SendQueueConfig,
    ) {
        info!("Spawned the sending task");

        loop {
            let Some(queued_event) = queue.peek_next_to_send().await else {
                trace!("Queue is empty, sleeping");
                // Wait for an explicit wakeup.
                notifier.notified().await;
                continue;
            };

            let Some(client) = client.get() else {
                trace!("The client was dropped, shutting down");
                break;
            };

            let transaction_id = queued_event.transaction_id.clone();
            let send_state = Self::send_event(&client, &room_id, queued_event, config).await;

            match &send_state {
                SendState::Sent { event_id } => {
                    debug!(%transaction_id, %event_id, "Successfully sent");
                }
                SendState::Failed { error, is_recoverable } => {
                    warn!(%transaction_id, is_recoverable, "Error when sending the event: {error}");
                }
                _ => {}
            }

            // The echo is gone if sync reconciled it in the meantime, it's not
            // brought back.
            if let Err(error) = client
                .base_client()
                .store()
                .update_echo_send_state(&room_id, &transaction_id, &send_state)
                .await
            {
                error!(%transaction_id, %error, "Couldn't save the send state of the event");
            }

            queue.remove(&transaction_id).await;
        }

        info!("Exited the sending task");
    }

    async fn send_event(
        client: &Client,
        room_id: &RoomId,
        queued_event: QueuedEvent,
        config: SendQueueConfig,
    ) -> SendState {
        let request = SendEventRequest {
            room_id: room_id.to_owned(),
            event_type: queued_event.event_type,
            transaction_id: queued_event.transaction_id,
            content: queued_event.content,
        };

        // The retries are driven by the send queue config.
        let request_config = client.request_config().disable_retry();
        let result = retry::execute(
            || client.send(request.clone(), Some(request_config)),
            Some(config.max_attempts),
            config.backoff,
        )
        .await;

        match result {
            Ok(response) => SendState::Sent { event_id: response.event_id },
            Err(RetryError::Permanent(error)) => SendState::Failed {
                is_recoverable: matches!(
                    error,
                    HttpError::AuthenticationRequired | HttpError::UnknownToken(_)
                ),
                error: error.to_string(),
            },
            Err(RetryError::AttemptsExhausted { last_error, .. }) => {
                SendState::Failed { error: last_error.to_string(), is_recoverable: true }
            }
            Err(RetryError::Cancelled) => SendState::Failed {
                error: "sending was cancelled".to_owned(),
                is_recoverable: true,
            },
        }
    }
}

struct RoomSendQueueInner {
    /// The client owning this queue.
    client: WeakClient,

    /// The room which this send queue relates to.
    room_id: OwnedRoomId,

    /// Queue of events that are either to be sent, or being sent.
    ///
    /// An event is removed from the queue once its send state has been saved,
    /// successful or not.
    queue: QueueStorage,

    /// Wakes the sending task up when an event is queued.
    notifier: Arc<Notify>,

    /// The sending task, aborted when the last handle on the queue is dropped.
    task: AbortOnDrop<()>,
}

/// A handle on an event that was queued for sending.
#[derive(Clone, Debug)]
pub struct SendHandle {
    queue: RoomSendQueue,
    transaction_id: OwnedTransactionId,
}

impl SendHandle {
    /// The transaction ID of the event.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Abort the sending of the event, if it wasn't dispatched yet.
    ///
    /// The local echo is removed. Returns true if the sending could be
    /// aborted, false if not (i.e. the event is being sent, or has already
    /// been sent).
    pub async fn abort(&self) -> Result<bool, RoomSendQueueError> {
        if !self.queue.inner.queue.cancel(&self.transaction_id).await {
            return Ok(false);
        }

        let client = self.queue.client()?;
        client
            .base_client()
            .store()
            .remove_local_echo(self.queue.room_id(), &self.transaction_id)
            .await?;
        debug!(transaction_id = %self.transaction_id, "Aborted sending the event");

        Ok(true)
    }

    /// Send a failed event again, under a new transaction ID.
    ///
    /// The failed echo is replaced by a new one in the sending state, at the
    /// end of the local echoes. Returns the handle of the new echo.
    pub async fn resend(&self) -> Result<SendHandle, RoomSendQueueError> {
        let echo = self.failed_echo().await?;
        let client = self.queue.client()?;

        let handle = self.queue.send(&echo.event_type, echo.content, None).await?;

        client
            .base_client()
            .store()
            .remove_local_echo(self.queue.room_id(), &self.transaction_id)
            .await?;
        debug!(
            old_transaction_id = %self.transaction_id,
            transaction_id = %handle.transaction_id,
            "Resending a failed event"
        );

        Ok(handle)
    }

    /// Remove a failed event from its room.
    pub async fn discard(&self) -> Result<(), RoomSendQueueError> {
        self.failed_echo().await?;

        let client = self.queue.client()?;
        client
            .base_client()
            .store()
            .remove_local_echo(self.queue.room_id(), &self.transaction_id)
            .await?;
        debug!(transaction_id = %self.transaction_id, "Discarded a failed event");

        Ok(())
    }

    async fn failed_echo(&self) -> Result<LocalEcho, RoomSendQueueError> {
        let client = self.queue.client()?;
        let echo = client
            .base_client()
            .store()
            .local_echoes(self.queue.room_id())
            .await?
            .into_iter()
            .find(|echo| echo.transaction_id == self.transaction_id)
            .ok_or(RoomSendQueueError::UnknownEcho)?;

        if !echo.send_state.is_failed() {
            return Err(RoomSendQueueError::NotFailed);
        }

        Ok(echo)
    }
}

#[derive(Clone)]
struct QueuedEvent {
    event_type: String,
    content: JsonValue,
    transaction_id: OwnedTransactionId,

    /// Flag to indicate if an event has been scheduled for sending.
    ///
    /// Useful to indicate if cancelling could happen or if it was too late and
    /// the event had already been sent.
    is_being_sent: bool,
}

#[derive(Clone)]
struct QueueStorage(Arc<RwLock<VecDeque<QueuedEvent>>>);

impl QueueStorage {
    /// Create a new synchronized queue for queuing events to be sent later.
    fn new() -> Self {
        Self(Arc::new(RwLock::new(VecDeque::with_capacity(16))))
    }

    /// Push a new event to be sent in the queue.
    async fn push(&self, echo: LocalEcho) {
        self.0.write().await.push_back(QueuedEvent {
            event_type: echo.event_type,
            content: echo.content,
            transaction_id: echo.transaction_id,
            is_being_sent: false,
        });
    }

    /// Peek at the next event to send, and mark it as being sent.
    async fn peek_next_to_send(&self) -> Option<QueuedEvent> {
        let mut queue = self.0.write().await;
        let next = queue.front_mut()?;
        next.is_being_sent = true;
        Some(next.clone())
    }

    async fn remove(&self, transaction_id: &TransactionId) {
        self.0.write().await.retain(|item| *item.transaction_id != *transaction_id);
    }

    /// Remove an event from the queue, unless it's being sent.
    ///
    /// Returns whether the event was removed.
    async fn cancel(&self, transaction_id: &TransactionId) -> bool {
        let mut queue = self.0.write().await;

        match queue.iter().position(|item| *item.transaction_id == *transaction_id) {
            Some(position) if !queue[position].is_being_sent => {
                queue.remove(position);
                true
            }
            _ => false,
        }
    }

    async fn contains(&self, transaction_id: &TransactionId) -> bool {
        self.0.read().await.iter().any(|item| *item.transaction_id == *transaction_id)
    }
}

/// Error type for the [`RoomSendQueue`].
#[derive(Debug, Error)]
pub enum RoomSendQueueError {
    /// The room isn't in the joined state.
    #[error("the room isn't in the joined state")]
    RoomNotJoined,

    /// The client owning the queue was dropped.
    #[error("the client was dropped")]
    ClientDropped,

    /// There's no local echo with this transaction ID in the room.
    #[error("the local echo is unknown")]
    UnknownEcho,

    /// Only failed events can be resent or discarded.
    #[error("the event isn't in a failed state")]
    NotFailed,

    /// The store failed.
    #[error(transparent)]
    StateStore(#[from] StoreError),
}
