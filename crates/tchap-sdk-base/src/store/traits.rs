// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::{fmt, sync::Arc};

use as_variant::as_variant;
use async_trait::async_trait;
use ruma::{EventId, RoomId, TransactionId};
use tchap_sdk_common::AsyncTraitDeps;

use super::{
    send_queue::{LocalEcho, SendState},
    RoomBatch, StoreError, TimelineSlice,
};
use crate::{
    deserialized_responses::{Direction, SyncTimelineEvent, TimelineChunk},
    rooms::RoomInfo,
    MatrixSession,
};

/// An abstract state store trait that can be used to implement different stores
/// for the SDK.
///
/// Implementations don't need to serialize writes to the same room, the
/// [`Store`][super::Store] wrapper does that. They must however make every
/// single call atomic: a concurrent reader sees either all of its effects or
/// none of them.
#[async_trait]
pub trait StateStore: AsyncTraitDeps {
    /// The error type used by this state store.
    type Error: fmt::Debug + Into<StoreError> + From<serde_json::Error>;

    /// Get key-value data from the store.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to fetch data for.
    async fn get_kv_data(
        &self,
        key: StateStoreDataKey,
    ) -> Result<Option<StateStoreDataValue>, Self::Error>;

    /// Put key-value data into the store.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to identify the data in the store.
    ///
    /// * `value` - The data to insert. It must be the variant matching `key`.
    async fn set_kv_data(
        &self,
        key: StateStoreDataKey,
        value: StateStoreDataValue,
    ) -> Result<(), Self::Error>;

    /// Remove key-value data from the store.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to remove the data for.
    async fn remove_kv_data(&self, key: StateStoreDataKey) -> Result<(), Self::Error>;

    /// Apply everything one sync response carries for one room, in a single
    /// transaction.
    ///
    /// This upserts the current state (skipping state events that were
    /// already applied once), appends the new timeline events (skipping the
    /// ones already stored), reconciles local echoes with their remote
    /// counterparts and saves the new [`RoomInfo`].
    async fn apply_room_batch(&self, batch: &RoomBatch) -> Result<(), Self::Error>;

    /// Get the [`RoomInfo`] of the given room, if the room is known.
    async fn get_room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>, Self::Error>;

    /// Get the [`RoomInfo`]s of all the known rooms.
    async fn get_room_infos(&self) -> Result<Vec<RoomInfo>, Self::Error>;

    /// Get the current state event for the given type and state key.
    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<SyncTimelineEvent>, Self::Error>;

    /// Read a slice of the cached timeline of a room.
    ///
    /// # Arguments
    ///
    /// * `from` - The event to start from, exclusive. `None` starts from the
    ///   live end when going backward, and from the start of the cache when
    ///   going forward.
    ///
    /// * `direction` - Which way to read.
    ///
    /// * `limit` - The maximum number of events to return.
    ///
    /// Returns `None` if `from` isn't part of the cached timeline anymore.
    async fn query_timeline_slice(
        &self,
        room_id: &RoomId,
        from: Option<&EventId>,
        direction: Direction,
        limit: usize,
    ) -> Result<Option<TimelineSlice>, Self::Error>;

    /// Prepend a chunk fetched through backward pagination to the cached
    /// timeline of a room.
    ///
    /// The chunk must have been fetched with the `prev_token` of the cached
    /// timeline as its `from` token, otherwise
    /// [`StoreError::PaginationTokenMismatch`] is returned. The events of the
    /// chunk must be in chronological order.
    ///
    /// Returns the events that were actually prepended, which excludes the
    /// ones already known.
    async fn prepend_backward_chunk(
        &self,
        room_id: &RoomId,
        from_token: &str,
        chunk: &TimelineChunk,
    ) -> Result<Vec<SyncTimelineEvent>, Self::Error>;

    /// Insert a local echo, or replace the one with the same transaction ID
    /// in place.
    async fn upsert_local_echo(&self, room_id: &RoomId, echo: &LocalEcho)
        -> Result<(), Self::Error>;

    /// Update the send state of a local echo.
    ///
    /// Returns `false` if there's no such echo.
    async fn update_echo_send_state(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
        send_state: &SendState,
    ) -> Result<bool, Self::Error>;

    /// Remove a local echo.
    ///
    /// Returns `false` if there's no such echo.
    async fn remove_local_echo(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
    ) -> Result<bool, Self::Error>;

    /// Get the local echoes of a room, in send order.
    async fn local_echoes(&self, room_id: &RoomId) -> Result<Vec<LocalEcho>, Self::Error>;

    /// Removes a room and all elements associated from the state store.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The `RoomId` of the room to delete.
    async fn remove_room(&self, room_id: &RoomId) -> Result<(), Self::Error>;
}

#[repr(transparent)]
struct EraseStateStoreError<T>(T);

#[cfg(not(tarpaulin_include))]
impl<T: fmt::Debug> fmt::Debug for EraseStateStoreError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
impl<T: StateStore> StateStore for EraseStateStoreError<T> {
    type Error = StoreError;

    async fn get_kv_data(
        &self,
        key: StateStoreDataKey,
    ) -> Result<Option<StateStoreDataValue>, Self::Error> {
        self.0.get_kv_data(key).await.map_err(Into::into)
    }

    async fn set_kv_data(
        &self,
        key: StateStoreDataKey,
        value: StateStoreDataValue,
    ) -> Result<(), Self::Error> {
        self.0.set_kv_data(key, value).await.map_err(Into::into)
    }

    async fn remove_kv_data(&self, key: StateStoreDataKey) -> Result<(), Self::Error> {
        self.0.remove_kv_data(key).await.map_err(Into::into)
    }

    async fn apply_room_batch(&self, batch: &RoomBatch) -> Result<(), Self::Error> {
        self.0.apply_room_batch(batch).await.map_err(Into::into)
    }

    async fn get_room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>, Self::Error> {
        self.0.get_room_info(room_id).await.map_err(Into::into)
    }

    async fn get_room_infos(&self) -> Result<Vec<RoomInfo>, Self::Error> {
        self.0.get_room_infos().await.map_err(Into::into)
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<SyncTimelineEvent>, Self::Error> {
        self.0.get_state_event(room_id, event_type, state_key).await.map_err(Into::into)
    }

    async fn query_timeline_slice(
        &self,
        room_id: &RoomId,
        from: Option<&EventId>,
        direction: Direction,
        limit: usize,
    ) -> Result<Option<TimelineSlice>, Self::Error> {
        self.0.query_timeline_slice(room_id, from, direction, limit).await.map_err(Into::into)
    }

    async fn prepend_backward_chunk(
        &self,
        room_id: &RoomId,
        from_token: &str,
        chunk: &TimelineChunk,
    ) -> Result<Vec<SyncTimelineEvent>, Self::Error> {
        self.0.prepend_backward_chunk(room_id, from_token, chunk).await.map_err(Into::into)
    }

    async fn upsert_local_echo(
        &self,
        room_id: &RoomId,
        echo: &LocalEcho,
    ) -> Result<(), Self::Error> {
        self.0.upsert_local_echo(room_id, echo).await.map_err(Into::into)
    }

    async fn update_echo_send_state(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
        send_state: &SendState,
    ) -> Result<bool, Self::Error> {
        self.0.update_echo_send_state(room_id, transaction_id, send_state).await.map_err(Into::into)
    }

    async fn remove_local_echo(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
    ) -> Result<bool, Self::Error> {
        self.0.remove_local_echo(room_id, transaction_id).await.map_err(Into::into)
    }

    async fn local_echoes(&self, room_id: &RoomId) -> Result<Vec<LocalEcho>, Self::Error> {
        self.0.local_echoes(room_id).await.map_err(Into::into)
    }

    async fn remove_room(&self, room_id: &RoomId) -> Result<(), Self::Error> {
        self.0.remove_room(room_id).await.map_err(Into::into)
    }
}

/// A type-erased [`StateStore`].
pub type DynStateStore = dyn StateStore<Error = StoreError>;

/// A type that can be type-erased into `Arc<dyn StateStore>`.
///
/// This trait is not meant to be implemented directly outside
/// `tchap-sdk-base`, but it is automatically implemented for everything that
/// implements `StateStore`.
pub trait IntoStateStore {
    #[doc(hidden)]
    fn into_state_store(self) -> Arc<DynStateStore>;
}

impl<T> IntoStateStore for T
where
    T: StateStore + Sized + 'static,
{
    fn into_state_store(self) -> Arc<DynStateStore> {
        Arc::new(EraseStateStoreError(self))
    }
}

// Turns a given `Arc<T>` into `Arc<DynStateStore>` by attaching the
// StateStore impl vtable of `EraseStateStoreError<T>`.
impl<T> IntoStateStore for Arc<T>
where
    T: StateStore + 'static,
{
    fn into_state_store(self) -> Arc<DynStateStore> {
        let ptr: *const T = Arc::into_raw(self);
        let ptr_erased = ptr as *const EraseStateStoreError<T>;
        // SAFETY: EraseStateStoreError is repr(transparent) so T and
        //         EraseStateStoreError<T> have the same layout and ABI
        unsafe { Arc::from_raw(ptr_erased) }
    }
}

/// A value for key-value data that should be persisted into the store.
#[derive(Debug, Clone)]
pub enum StateStoreDataValue {
    /// The sync token.
    SyncToken(String),

    /// The session of the logged-in user.
    Session(MatrixSession),
}

impl StateStoreDataValue {
    /// Get this value if it is a sync token.
    pub fn into_sync_token(self) -> Option<String> {
        as_variant!(self, Self::SyncToken)
    }

    /// Get this value if it is a session.
    pub fn into_session(self) -> Option<MatrixSession> {
        as_variant!(self, Self::Session)
    }
}

/// A key for key-value data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStoreDataKey {
    /// The sync token.
    SyncToken,

    /// The session of the logged-in user.
    Session,
}

impl StateStoreDataKey {
    /// Key to use for the [`SyncToken`][Self::SyncToken] variant.
    pub const SYNC_TOKEN: &'static str = "sync_token";
    /// Key to use for the [`Session`][Self::Session] variant.
    pub const SESSION: &'static str = "session";

    /// The string form of this key, as used by the persistent stores.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncToken => Self::SYNC_TOKEN,
            Self::Session => Self::SESSION,
        }
    }
}
