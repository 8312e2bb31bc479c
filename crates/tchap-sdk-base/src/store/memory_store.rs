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

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use imbl::{HashMap as ImHashMap, HashSet as ImHashSet, Vector};
use ruma::{EventId, OwnedEventId, OwnedRoomId, RoomId, TransactionId};
use tracing::{debug, trace};

use super::{
    send_queue::{LocalEcho, SendState},
    Result, RoomBatch, StateStore, StateStoreDataKey, StateStoreDataValue, StoreError,
    TimelineSlice,
};
use crate::{
    deserialized_responses::{Direction, SyncTimelineEvent, TimelineChunk},
    rooms::RoomInfo,
};

/// Everything the store knows about one room.
///
/// Writers clone it, which is cheap thanks to the persistent collections,
/// apply their changes to the clone and swap it in. Readers always work on
/// the last swapped-in snapshot.
#[derive(Clone, Debug, Default)]
struct RoomData {
    info: Option<RoomInfo>,
    /// The current state, keyed by `(event_type, state_key)`.
    state: ImHashMap<(String, String), SyncTimelineEvent>,
    /// Every state event ever applied, so a replayed batch can't revert a
    /// newer state.
    applied_state_events: ImHashSet<OwnedEventId>,
    events: Vector<SyncTimelineEvent>,
    event_ids: ImHashSet<OwnedEventId>,
    prev_token: Option<String>,
    next_token: Option<String>,
    echoes: Vector<LocalEcho>,
}

impl RoomData {
    fn apply_batch(&mut self, batch: &RoomBatch) {
        let mut info = batch.room_info.clone();

        for event in &batch.state_events {
            let Some(state_key) = &event.state_key else { continue };

            if self.applied_state_events.insert(event.event_id.clone()).is_some() {
                trace!(event_id = %event.event_id, "State event already applied, skipping");
                continue;
            }

            info.handle_state_event(event);
            self.state.insert((event.event_type.clone(), state_key.clone()), event.clone());
        }

        if batch.clear_timeline {
            self.events.clear();
            self.event_ids = ImHashSet::new();
            self.prev_token = None;
            self.next_token = None;
            self.echoes.clear();
        } else {
            if batch.limited {
                self.events.clear();
                self.event_ids = ImHashSet::new();
                self.prev_token = batch.timeline.prev_token.clone();
            } else if self.events.is_empty() && self.prev_token.is_none() {
                self.prev_token = batch.timeline.prev_token.clone();
            }

            for event in &batch.timeline.events {
                self.append_event(event.clone());
            }

            if let Some(token) = &batch.timeline.next_token {
                self.next_token = Some(token.clone());
            }
        }

        self.info = Some(info);
    }

    fn append_event(&mut self, mut event: SyncTimelineEvent) {
        let echo_position = self.echoes.iter().position(|echo| {
            event.transaction_id() == Some(&*echo.transaction_id)
                || echo.event_id().as_deref() == Some(&*event.event_id)
        });

        if let Some(position) = echo_position {
            let echo = self.echoes.remove(position);
            debug!(
                event_id = %event.event_id,
                transaction_id = %echo.transaction_id,
                "Reconciled local echo"
            );
            event.unsigned.transaction_id.get_or_insert(echo.transaction_id);
        }

        if self.event_ids.contains(&event.event_id) {
            trace!(event_id = %event.event_id, "Event already stored, skipping");
            return;
        }

        self.event_ids.insert(event.event_id.clone());
        self.events.push_back(event);
    }

    fn position_of(&self, event_id: &EventId) -> Option<usize> {
        self.events.iter().position(|event| *event.event_id == *event_id)
    }

    fn slice(&self, start: usize, end: usize) -> TimelineSlice {
        let len = self.events.len();
        let is_cache_start = start == 0;
        let is_live_end = end == len;

        TimelineSlice {
            chunk: TimelineChunk {
                prev_token: if is_cache_start { self.prev_token.clone() } else { None },
                next_token: if is_live_end { self.next_token.clone() } else { None },
                events: self.events.clone().slice(start..end).into_iter().collect(),
            },
            is_cache_start,
            is_live_end,
            local_echoes: if is_live_end { self.echoes.iter().cloned().collect() } else { Vec::new() },
        }
    }
}

/// In-memory, non-persistent implementation of the `StateStore`.
///
/// Default if no other is configured at startup.
#[derive(Debug, Default)]
pub struct MemoryStore {
    kv: DashMap<&'static str, StateStoreDataValue>,
    rooms: DashMap<OwnedRoomId, Arc<RoomData>>,
}

impl MemoryStore {
    /// Create a new empty MemoryStore
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, room_id: &RoomId) -> Option<Arc<RoomData>> {
        self.rooms.get(room_id).map(|data| data.clone())
    }

    /// Apply `f` to a copy of the room's data and swap the copy in if `f`
    /// succeeds.
    fn update_room<T>(
        &self,
        room_id: &RoomId,
        f: impl FnOnce(&mut RoomData) -> Result<T>,
    ) -> Result<T> {
        let mut entry = self.rooms.entry(room_id.to_owned()).or_default();
        let mut data = (**entry).clone();
        let result = f(&mut data)?;
        *entry = Arc::new(data);
        Ok(result)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    type Error = StoreError;

    async fn get_kv_data(&self, key: StateStoreDataKey) -> Result<Option<StateStoreDataValue>> {
        Ok(self.kv.get(key.as_str()).map(|value| value.clone()))
    }

    async fn set_kv_data(&self, key: StateStoreDataKey, value: StateStoreDataValue) -> Result<()> {
        self.kv.insert(key.as_str(), value);
        Ok(())
    }

    async fn remove_kv_data(&self, key: StateStoreDataKey) -> Result<()> {
        self.kv.remove(key.as_str());
        Ok(())
    }

    async fn apply_room_batch(&self, batch: &RoomBatch) -> Result<()> {
        self.update_room(batch.room_id(), |data| {
            data.apply_batch(batch);
            Ok(())
        })
    }

    async fn get_room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        Ok(self.snapshot(room_id).and_then(|data| data.info.clone()))
    }

    async fn get_room_infos(&self) -> Result<Vec<RoomInfo>> {
        Ok(self.rooms.iter().filter_map(|data| data.info.clone()).collect())
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<SyncTimelineEvent>> {
        Ok(self.snapshot(room_id).and_then(|data| {
            data.state.get(&(event_type.to_owned(), state_key.to_owned())).cloned()
        }))
    }

    async fn query_timeline_slice(
        &self,
        room_id: &RoomId,
        from: Option<&EventId>,
        direction: Direction,
        limit: usize,
    ) -> Result<Option<TimelineSlice>> {
        let Some(data) = self.snapshot(room_id) else {
            if from.is_some() {
                return Ok(None);
            }

            return Ok(Some(TimelineSlice {
                is_cache_start: true,
                is_live_end: true,
                ..Default::default()
            }));
        };

        let len = data.events.len();
        let (start, end) = match (from, direction) {
            (None, Direction::Backward) => (len.saturating_sub(limit), len),
            (None, Direction::Forward) => (0, limit.min(len)),
            (Some(event_id), direction) => {
                let Some(position) = data.position_of(event_id) else {
                    return Ok(None);
                };

                match direction {
                    Direction::Backward => (position.saturating_sub(limit), position),
                    Direction::Forward => (position + 1, (position + 1 + limit).min(len)),
                }
            }
        };

        Ok(Some(data.slice(start, end)))
    }

    async fn prepend_backward_chunk(
        &self,
        room_id: &RoomId,
        from_token: &str,
        chunk: &TimelineChunk,
    ) -> Result<Vec<SyncTimelineEvent>> {
        self.update_room(room_id, |data| {
            if data.prev_token.as_deref() != Some(from_token) {
                return Err(StoreError::PaginationTokenMismatch {
                    expected: data.prev_token.clone(),
                    got: from_token.to_owned(),
                });
            }

            let mut new_events = Vec::with_capacity(chunk.events.len());
            for event in &chunk.events {
                if data.event_ids.insert(event.event_id.clone()).is_none() {
                    new_events.push(event.clone());
                }
            }

            for event in new_events.iter().rev() {
                data.events.push_front(event.clone());
            }

            data.prev_token = chunk.prev_token.clone();

            Ok(new_events)
        })
    }

    async fn upsert_local_echo(&self, room_id: &RoomId, echo: &LocalEcho) -> Result<()> {
        self.update_room(room_id, |data| {
            match data.echoes.iter().position(|e| e.transaction_id == echo.transaction_id) {
                Some(position) => {
                    data.echoes.set(position, echo.clone());
                }
                None => data.echoes.push_back(echo.clone()),
            }

            Ok(())
        })
    }

    async fn update_echo_send_state(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
        send_state: &SendState,
    ) -> Result<bool> {
        if self.snapshot(room_id).is_none() {
            return Ok(false);
        }

        self.update_room(room_id, |data| {
            let Some(position) =
                data.echoes.iter().position(|e| *e.transaction_id == *transaction_id)
            else {
                return Ok(false);
            };

            let mut echo = data.echoes[position].clone();
            echo.send_state = send_state.clone();
            data.echoes.set(position, echo);

            Ok(true)
        })
    }

    async fn remove_local_echo(
        &self,
        room_id: &RoomId,
        transaction_id: &TransactionId,
    ) -> Result<bool> {
        if self.snapshot(room_id).is_none() {
            return Ok(false);
        }

        self.update_room(room_id, |data| {
            let Some(position) =
                data.echoes.iter().position(|e| *e.transaction_id == *transaction_id)
            else {
                return Ok(false);
            };

            data.echoes.remove(position);
            Ok(true)
        })
    }

    async fn local_echoes(&self, room_id: &RoomId) -> Result<Vec<LocalEcho>> {
        Ok(self
            .snapshot(room_id)
            .map(|data| data.echoes.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_room(&self, room_id: &RoomId) -> Result<()> {
        self.rooms.remove(room_id);
        Ok(())
    }
}
