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

use std::sync::{Arc, Mutex as StdMutex};

use eyeball::{ObservableWriteGuard, SharedObservable, Subscriber};
use eyeball_im::{ObservableVector, VectorSubscriberStream};
use futures_util::future::{AbortHandle, Abortable};
use imbl::Vector;
use ruma::{OwnedEventId, OwnedUserId};
use tchap_sdk_base::{
    deserialized_responses::{Direction, EventKind, SyncTimelineEvent, TimelineChunk},
    store::{send_queue::LocalEcho, Store},
    StoreError,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, trace};

use super::{TimelineError, TimelineItem, TimelineState};
use crate::room::Room;

/// How many events are read at once when catching up with the live end.
const FORWARD_BATCH_SIZE: usize = 50;

pub(super) struct TimelineInner {
    room: Room,
    own_user_id: OwnedUserId,

    /// Confirmed events in timeline order, followed by the local echoes in
    /// send order.
    items: RwLock<ObservableVector<Arc<TimelineItem>>>,

    state: SharedObservable<TimelineState>,

    /// Serializes the changes of `items` that depend on what the store
    /// contains, so a reload can't interleave with a pagination.
    update_lock: Mutex<()>,

    /// Aborts the pagination request in flight, if any.
    pagination_abort: StdMutex<Option<AbortHandle>>,

    /// The minimum number of events to load when (re)loading the live end.
    initial_tail: usize,
}

impl TimelineInner {
    pub(super) fn new(room: Room, own_user_id: OwnedUserId, initial_tail: usize) -> Self {
        Self {
            room,
            own_user_id,
            items: Default::default(),
            state: SharedObservable::new(TimelineState::Live),
            update_lock: Mutex::new(()),
            pagination_abort: StdMutex::new(None),
            initial_tail,
        }
    }

    pub(super) fn room(&self) -> &Room {
        &self.room
    }

    fn store(&self) -> &Store {
        self.room.client().base_client().store()
    }

    pub(super) async fn items(&self) -> Vector<Arc<TimelineItem>> {
        self.items.read().await.clone()
    }

    pub(super) async fn subscribe(
        &self,
    ) -> (Vector<Arc<TimelineItem>>, VectorSubscriberStream<Arc<TimelineItem>>) {
        self.items.read().await.subscribe().into_values_and_stream()
    }

    pub(super) fn state(&self) -> TimelineState {
        self.state.get()
    }

    pub(super) fn subscribe_to_state(&self) -> Subscriber<TimelineState> {
        self.state.subscribe()
    }

    pub(super) fn is_detached(&self) -> bool {
        self.state.get() == TimelineState::Detached
    }

    /// Stop following the room: no more changes are applied, and the
    /// pagination in flight is aborted.
    pub(super) fn detach(&self) {
        self.state.set(TimelineState::Detached);

        if let Some(handle) = self.pagination_abort.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }

    /// Replace the items with the live end of the cached timeline.
    ///
    /// At least as many confirmed events as currently shown are loaded, so
    /// a reload doesn't lose the history paginated so far unless the cache
    /// itself lost it.
    #[instrument(skip(self), fields(room_id = %self.room.room_id()))]
    pub(super) async fn reload(&self) -> Result<(), StoreError> {
        let _guard = self.update_lock.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> Result<(), StoreError> {
        if self.is_detached() {
            return Ok(());
        }

        let shown = self.items.read().await.iter().filter(|item| !item.is_local_echo()).count();
        let limit = shown.max(self.initial_tail);

        let slice = self
            .store()
            .query_timeline_slice(self.room.room_id(), None, Direction::Backward, limit)
            .await?
            .unwrap_or_default();

        let mut new_items = Vector::new();
        for item in self.remote_items(slice.chunk.events).await {
            new_items.push_back(Arc::new(item));
        }
        for echo in slice.local_echoes {
            new_items.push_back(Arc::new(TimelineItem::local(echo, &self.own_user_id)));
        }

        debug!(items = new_items.len(), "Reloaded the timeline");

        let mut items = self.items.write().await;
        items.clear();
        if !new_items.is_empty() {
            items.append(new_items);
        }

        Ok(())
    }

    /// Apply what changed in the store since the newest confirmed event
    /// shown: new events are appended after the confirmed ones, replacing
    /// their local echo in place, and the local echoes are updated.
    #[instrument(skip(self), fields(room_id = %self.room.room_id()))]
    pub(super) async fn handle_room_update(&self) -> Result<(), StoreError> {
        let _guard = self.update_lock.lock().await;

        if self.is_detached() {
            return Ok(());
        }

        let Some(mut from) = self.newest_event_id().await else {
            return self.reload_locked().await;
        };

        let mut new_events = Vec::new();
        let echoes = loop {
            let slice = self
                .store()
                .query_timeline_slice(
                    self.room.room_id(),
                    Some(&from),
                    Direction::Forward,
                    FORWARD_BATCH_SIZE,
                )
                .await?;

            let Some(slice) = slice else {
                debug!("The newest event isn't cached anymore, reloading");
                return self.reload_locked().await;
            };

            if slice.is_live_end || slice.chunk.events.is_empty() {
                new_events.extend(slice.chunk.events);
                break slice.local_echoes;
            }

            if let Some(last) = slice.chunk.events.last() {
                from = last.event_id.clone();
            }
            new_events.extend(slice.chunk.events);
        };

        trace!(events = new_events.len(), echoes = echoes.len(), "Applying room update");

        let new_items = self.remote_items(new_events).await;
        self.apply_live(new_items, echoes).await;

        Ok(())
    }

    async fn apply_live(&self, new_items: Vec<TimelineItem>, echoes: Vec<LocalEcho>) {
        let mut items = self.items.write().await;
        let mut remote_count = items.iter().take_while(|item| !item.is_local_echo()).count();

        for item in new_items {
            let Some(event) = item.original_event() else { continue };

            // The copy already shown wins.
            if items.iter().take(remote_count).any(|i| i.event_id() == Some(&*event.event_id)) {
                continue;
            }

            let echo_index = items
                .iter()
                .skip(remote_count)
                .position(|i| i.is_echo_of(event))
                .map(|position| position + remote_count);
            let item = Arc::new(item);

            match echo_index {
                // The echo takes the slot of the confirmed event, replace it in
                // place.
                Some(index) if index == remote_count => {
                    items.set(index, item);
                }
                Some(index) => {
                    items.remove(index);
                    items.insert(remote_count, item);
                }
                None => items.insert(remote_count, item),
            }

            remote_count += 1;
        }

        // Drop the echoes that were removed from the store.
        let mut index = items.len();
        while index > remote_count {
            index -= 1;
            let txn_id = items[index].transaction_id();
            if !echoes.iter().any(|echo| Some(&*echo.transaction_id) == txn_id) {
                items.remove(index);
            }
        }

        for (offset, echo) in echoes.into_iter().enumerate() {
            let index = remote_count + offset;
            let current = items
                .iter()
                .skip(index)
                .position(|i| i.transaction_id() == Some(&*echo.transaction_id))
                .map(|position| position + index);

            match current {
                Some(current) if current == index => {
                    if items[index].send_state().as_ref() != Some(&echo.send_state) {
                        items.set(index, Arc::new(TimelineItem::local(echo, &self.own_user_id)));
                    }
                }
                Some(current) => {
                    items.remove(current);
                    items.insert(index, Arc::new(TimelineItem::local(echo, &self.own_user_id)));
                }
                None => {
                    items.insert(index, Arc::new(TimelineItem::local(echo, &self.own_user_id)))
                }
            }
        }
    }

    /// Load older events, from the store first and from the server once the
    /// cache is exhausted.
    ///
    /// Returns the number of events added to the timeline, `0` if the start
    /// of the room was reached.
    #[instrument(skip(self), fields(room_id = %self.room.room_id()))]
    pub(super) async fn paginate_backwards(&self, limit: u16) -> Result<usize, TimelineError> {
        {
            let mut state = self.state.write();
            match *state {
                TimelineState::Detached => return Err(TimelineError::Detached),
                TimelineState::PaginatingBackward => {
                    return Err(TimelineError::PaginationInProgress)
                }
                TimelineState::Live => {
                    ObservableWriteGuard::set(&mut state, TimelineState::PaginatingBackward);
                }
            }
        }

        let result = self.paginate_backwards_impl(limit).await;

        // A detached timeline stays detached.
        {
            let mut state = self.state.write();
            if *state == TimelineState::PaginatingBackward {
                ObservableWriteGuard::set(&mut state, TimelineState::Live);
            }
        }

        match &result {
            Ok(count) => debug!(count, "Back-pagination done"),
            Err(error) => debug!(%error, "Back-pagination failed"),
        }

        result
    }

    async fn paginate_backwards_impl(&self, limit: u16) -> Result<usize, TimelineError> {
        let limit = usize::from(limit);

        let token = {
            let _guard = self.update_lock.lock().await;

            let oldest = self.oldest_event_id().await;
            let slice = self
                .store()
                .query_timeline_slice(
                    self.room.room_id(),
                    oldest.as_deref(),
                    Direction::Backward,
                    limit,
                )
                .await?;

            let Some(slice) = slice else {
                debug!("The oldest event isn't cached anymore, reloading");
                self.reload_locked().await?;
                return Ok(0);
            };

            if !slice.chunk.events.is_empty() {
                trace!(events = slice.chunk.events.len(), "Paginating from the cache");
                let items = self.remote_items(slice.chunk.events).await;
                return Ok(self.prepend(items).await);
            }

            match slice.chunk.prev_token {
                Some(token) if slice.is_cache_start => token,
                _ => {
                    debug!("Reached the start of the room");
                    return Ok(0);
                }
            }
        };

        let chunk = self.fetch_backward_chunk(&token, limit).await?;

        let _guard = self.update_lock.lock().await;
        if self.is_detached() {
            return Err(TimelineError::Detached);
        }

        let new_events =
            self.store().prepend_backward_chunk(self.room.room_id(), &token, &chunk).await?;
        let items = self.remote_items(new_events).await;

        Ok(self.prepend(items).await)
    }

    /// Fetch the page of events before `token` from the server, in
    /// chronological order.
    async fn fetch_backward_chunk(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<TimelineChunk, TimelineError> {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        if let Ok(mut current) = self.pagination_abort.lock() {
            *current = Some(abort_handle);
        }

        // The timeline may have been detached before the handle was stored.
        if self.is_detached() {
            return Err(TimelineError::Detached);
        }

        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let result = Abortable::new(self.room.messages(token, limit), abort_registration).await;

        if let Ok(mut current) = self.pagination_abort.lock() {
            current.take();
        }

        let response = result.map_err(|_| TimelineError::Detached)??;

        trace!(events = response.chunk.len(), end = ?response.end, "Fetched a page of events");

        let mut events = response.chunk;
        events.reverse();

        Ok(TimelineChunk { prev_token: response.end, next_token: Some(token.to_owned()), events })
    }

    /// Insert older events before the shown ones, skipping those already
    /// shown. `items` must be in chronological order.
    async fn prepend(&self, new_items: Vec<TimelineItem>) -> usize {
        let mut items = self.items.write().await;
        let mut count = 0;

        for item in new_items.into_iter().rev() {
            if items.iter().any(|i| i.event_id().is_some() && i.event_id() == item.event_id()) {
                continue;
            }

            items.push_front(Arc::new(item));
            count += 1;
        }

        count
    }

    /// Try to decrypt again the events that couldn't be decrypted.
    ///
    /// Returns the number of events that could be decrypted.
    #[instrument(skip(self), fields(room_id = %self.room.room_id()))]
    pub(super) async fn retry_decryption(&self) -> usize {
        let candidates: Vec<SyncTimelineEvent> = self
            .items
            .read()
            .await
            .iter()
            .filter(|item| item.content().is_unable_to_decrypt())
            .filter_map(|item| item.original_event().cloned())
            .collect();

        if candidates.is_empty() {
            return 0;
        }

        let decryptor = self.room.client().inner.decryptor.clone();
        let mut decrypted = Vec::new();

        for event in candidates {
            match decryptor.decrypt(self.room.room_id(), &event).await {
                Ok(plaintext) => {
                    decrypted.push(TimelineItem::remote(event, Some(plaintext), &self.own_user_id))
                }
                Err(error) => trace!(event_id = %event.event_id, %error, "Still can't decrypt"),
            }
        }

        let _guard = self.update_lock.lock().await;
        if self.is_detached() {
            return 0;
        }

        let mut items = self.items.write().await;
        let mut count = 0;

        for item in decrypted {
            let index = items
                .iter()
                .position(|i| i.event_id().is_some() && i.event_id() == item.event_id());

            // The event may be gone because of a reload.
            if let Some(index) = index {
                items.set(index, Arc::new(item));
                count += 1;
            }
        }

        debug!(count, "Retried decryption");
        count
    }

    async fn remote_items(&self, events: Vec<SyncTimelineEvent>) -> Vec<TimelineItem> {
        let decryptor = &self.room.client().inner.decryptor;
        let mut items = Vec::with_capacity(events.len());

        for event in events {
            let decrypted = if event.kind() == EventKind::Encrypted {
                match decryptor.decrypt(self.room.room_id(), &event).await {
                    Ok(decrypted) => Some(decrypted),
                    Err(error) => {
                        debug!(event_id = %event.event_id, %error, "Couldn't decrypt event");
                        None
                    }
                }
            } else {
                None
            };

            items.push(TimelineItem::remote(event, decrypted, &self.own_user_id));
        }

        items
    }

    async fn newest_event_id(&self) -> Option<OwnedEventId> {
        let items = self.items.read().await;
        items.iter().rev().find_map(|item| item.event_id().map(ToOwned::to_owned))
    }

    async fn oldest_event_id(&self) -> Option<OwnedEventId> {
        let items = self.items.read().await;
        items.iter().find_map(|item| item.event_id().map(ToOwned::to_owned))
    }
}
