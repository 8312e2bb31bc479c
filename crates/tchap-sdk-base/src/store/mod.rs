// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! The state store holds the overall state for rooms, their timelines and the
//! local echoes of the events being sent. It is the cache every read goes
//! through, accessible through [`Store`].
//!
//! Implementing the [`StateStore`] trait, you can plug any storage backend
//! into the store for the actual storage. By default this brings an in-memory
//! store.

use std::{collections::BTreeMap, fmt, ops::Deref, sync::Arc};

use dashmap::DashMap;
use ruma::{OwnedRoomId, RoomId, TransactionId};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

mod memory_store;
pub mod send_queue;
mod traits;

pub use self::{
    memory_store::MemoryStore,
    traits::{DynStateStore, IntoStateStore, StateStore, StateStoreDataKey, StateStoreDataValue},
};
use self::send_queue::{LocalEcho, SendState};
use crate::{
    deserialized_responses::{SyncTimelineEvent, TimelineChunk},
    rooms::{RoomInfo, RoomState},
    MatrixSession,
};

/// State store specific error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An error happened in the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An error happened while serializing or deserializing some data.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An error happened while deserializing a Matrix identifier, e.g. an user
    /// id.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),

    /// The room isn't known to the store.
    #[error("the room {0} is unknown")]
    UnknownRoom(OwnedRoomId),

    /// A chunk fetched through backward pagination doesn't connect to the
    /// cached timeline anymore, e.g. because a gap reset it in the meantime.
    #[error(
        "the pagination token doesn't match the cached timeline, \
         expected {expected:?}, got {got}"
    )]
    PaginationTokenMismatch {
        /// The backward pagination token of the cached timeline.
        expected: Option<String>,
        /// The token the chunk was fetched from.
        got: String,
    },

    /// The database format has changed in a backwards incompatible way.
    #[error(
        "The database format changed in an incompatible way, current \
        version: {0}, latest version: {1}"
    )]
    UnsupportedDatabaseVersion(usize, usize),
}

impl StoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A `StateStore` specific result type.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Everything one sync response changes for one room.
///
/// It is applied in a single transaction by
/// [`StateStore::apply_room_batch`].
#[derive(Clone, Debug)]
pub struct RoomBatch {
    /// The new info of the room, before `state_events` are applied to it.
    ///
    /// The store updates it with the state events it actually applies, see
    /// [`RoomInfo::handle_state_event`].
    pub room_info: RoomInfo,

    /// The state events to upsert, in the order they must be applied: the
    /// `state` block first, then the state events of the timeline.
    ///
    /// State events that were already applied once are skipped, so a replayed
    /// batch can't revert a newer state.
    pub state_events: Vec<SyncTimelineEvent>,

    /// The new timeline events, with the `prev_batch` token as
    /// `prev_token` and the sync `next_batch` token as `next_token`.
    pub timeline: TimelineChunk,

    /// Whether the server dropped events between the cached timeline and
    /// this one. The cached timeline is replaced instead of extended.
    pub limited: bool,

    /// Drop the cached timeline and the local echoes of the room, keeping
    /// its info and state. Set when the user left the room.
    pub clear_timeline: bool,
}

impl RoomBatch {
    /// Create an empty batch that only saves the given room info.
    pub fn new(room_info: RoomInfo) -> Self {
        Self {
            room_info,
            state_events: Vec::new(),
            timeline: TimelineChunk::default(),
            limited: false,
            clear_timeline: false,
        }
    }

    /// The ID of the room this batch applies to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_info.room_id
    }
}

/// A slice of a cached timeline, read from a single snapshot of the store.
#[derive(Clone, Debug, Default)]
pub struct TimelineSlice {
    /// The events of the slice, oldest first.
    ///
    /// `prev_token` is set to the backward pagination token of the cached
    /// timeline if the slice starts at the start of the cache, and
    /// `next_token` to the forward token if it ends at the live end.
    pub chunk: TimelineChunk,

    /// Whether the slice starts at the start of the cached timeline. Going
    /// further back requires paginating from the server with
    /// `chunk.prev_token`, or isn't possible if that's `None`.
    pub is_cache_start: bool,

    /// Whether the slice ends at the live end of the cached timeline.
    pub is_live_end: bool,

    /// The local echoes of the room, if the slice ends at the live end.
    ///
    /// They are read from the same snapshot as the events, so a reconciled
    /// echo is in exactly one of the two lists.
    pub local_echoes: Vec<LocalEcho>,
}

/// What changed in a room.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    /// The cached timeline was replaced or cleared. Timelines following the
    /// room must reload it.
    pub timeline_reset: bool,
}

/// A notification that some rooms changed in the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomUpdates {
    /// The rooms that changed.
    pub rooms: BTreeMap<OwnedRoomId, RoomUpdate>,
}

impl RoomUpdates {
    /// Create a notification for a single room.
    pub fn single(room_id: &RoomId, update: RoomUpdate) -> Self {
        Self { rooms: BTreeMap::from([(room_id.to_owned(), update)]) }
    }

    /// Is the given room part of this notification?
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Was the timeline of the given room reset?
    pub fn is_timeline_reset(&self, room_id: &RoomId) -> bool {
        self.rooms.get(room_id).is_some_and(|u| u.timeline_reset)
    }

    /// Record a change for the given room.
    pub fn insert(&mut self, room_id: &RoomId, update: RoomUpdate) {
        let entry = self.rooms.entry(room_id.to_owned()).or_default();
        entry.timeline_reset |= update.timeline_reset;
    }

    /// Is this notification empty?
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// The capacity of the room updates channel. Slow receivers that lag behind
/// get a `Lagged` error and must reload.
const ROOM_UPDATES_CAPACITY: usize = 128;

/// A wrapper around a [`StateStore`] that serializes the writes to each room
/// and broadcasts what changed.
///
/// Reads go straight to the underlying store through `Deref`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<DynStateStore>,
    room_locks: Arc<DashMap<OwnedRoomId, Arc<Mutex<()>>>>,
    room_updates: broadcast::Sender<RoomUpdates>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl Store {
    /// Create a new store, wrapping the given `StateStore`.
    pub fn new(inner: Arc<DynStateStore>) -> Self {
        let (room_updates, _) = broadcast::channel(ROOM_UPDATES_CAPACITY);
        Self { inner, room_locks: Default::default(), room_updates }
    }

    /// The underlying store.
    pub fn inner(&self) -> &Arc<DynStateStore> {
        &self.inner
    }

    /// Acquire the write lock of a room.
    ///
    /// Every write to a room goes through this lock, writes to different
    /// rooms don't block each other.
    pub async fn lock_room(&self, room_id: &RoomId) -> OwnedMutexGuard<()> {
        let lock = self.room_locks.entry(room_id.to_owned()).or_default().clone();
        lock.lock_owned().await
    }

    /// Subscribe to the notifications of changed rooms.
    pub fn subscribe_to_room_updates(&self) -> broadcast::Receiver<RoomUpdates> {
        self.room_updates.subscribe()
    }

    /// Notify the subscribers that some rooms changed.
    pub fn notify_room_updates(&self, updates: RoomUpdates) {
        if updates.is_empty() {
            return;
        }

        trace!(rooms = ?updates.rooms.keys().collect::<Vec<_>>(), "Broadcasting room updates");
        // No receivers is fine.
        let _ = self.room_updates.send(updates);
    }

    /// The stored sync token.
    pub async fn sync_token(&self) -> Result<Option<String>> {
        Ok(self
            .inner
            .get_kv_data(StateStoreDataKey::SyncToken)
            .await?
            .and_then(StateStoreDataValue::into_sync_token))
    }

    /// The stored session.
    pub async fn session(&self) -> Result<Option<MatrixSession>> {
        Ok(self
            .inner
            .get_kv_data(StateStoreDataKey::Session)
            .await?
            .and_then(StateStoreDataValue::into_session))
    }

    /// Insert or replace a local echo and notify the room's subscribers.
    pub async fn upsert_local_echo(&self, room_id: &RoomId, echo: &LocalEcho) -> Result<()> {
        let _guard = self.lock_room(room_id).await;
        self.inner.upsert_local_echo(room_id, echo).await?;
        debug!(%room_id, transaction_id = %echo.transaction_id, "Saved local echo");

        self.notify_room_updates(RoomUpdates::single(room_id, RoomUpdate::default()));
        Ok(())
    }

    /// Update the send state of a local echo and notify the room's
    /// subscribers.
    pub async fn update_echo_send_state(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
        send_state: &SendState,
    ) -> Result<bool> {
        let _guard = self.lock_room(room_id).await;
        let found = self.inner.update_echo_send_state(room_id, transaction_id, send_state).await?;

        if found {
            self.notify_room_updates(RoomUpdates::single(room_id, RoomUpdate::default()));
        }

        Ok(found)
    }

    /// Remove a local echo and notify the room's subscribers.
    pub async fn remove_local_echo(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
    ) -> Result<bool> {
        let _guard = self.lock_room(room_id).await;
        let found = self.inner.remove_local_echo(room_id, transaction_id).await?;

        if found {
            debug!(%room_id, %transaction_id, "Removed local echo");
            self.notify_room_updates(RoomUpdates::single(room_id, RoomUpdate::default()));
        }

        Ok(found)
    }

    /// Replace the local echo with the given transaction ID by its confirmed
    /// event, atomically.
    ///
    /// Readers see either the echo or the event, never both or neither. If
    /// the event is already stored, the echo is just removed.
    pub async fn reconcile_echo(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
        mut event: SyncTimelineEvent,
    ) -> Result<()> {
        let _guard = self.lock_room(room_id).await;

        let room_info = self
            .inner
            .get_room_info(room_id)
            .await?
            .ok_or_else(|| StoreError::UnknownRoom(room_id.to_owned()))?;

        event.unsigned.transaction_id = Some(transaction_id.to_owned());

        let mut batch = RoomBatch::new(room_info);
        batch.timeline.events.push(event);
        self.inner.apply_room_batch(&batch).await?;

        debug!(%room_id, %transaction_id, "Reconciled local echo");
        self.notify_room_updates(RoomUpdates::single(room_id, RoomUpdate::default()));

        Ok(())
    }

    /// Prepend a chunk fetched through backward pagination to the cached
    /// timeline of a room.
    ///
    /// See [`StateStore::prepend_backward_chunk`].
    pub async fn prepend_backward_chunk(
        &self,
        room_id: &RoomId,
        from_token: &str,
        chunk: &TimelineChunk,
    ) -> Result<Vec<SyncTimelineEvent>> {
        let _guard = self.lock_room(room_id).await;
        self.inner.prepend_backward_chunk(room_id, from_token, chunk).await
    }

    /// The IDs of the rooms the user is joined to or invited to.
    pub async fn active_room_ids(&self) -> Result<Vec<OwnedRoomId>> {
        Ok(self
            .inner
            .get_room_infos()
            .await?
            .into_iter()
            .filter(|info| info.room_state != RoomState::Left)
            .map(|info| info.room_id)
            .collect())
    }
}

impl Deref for Store {
    type Target = DynStateStore;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}
