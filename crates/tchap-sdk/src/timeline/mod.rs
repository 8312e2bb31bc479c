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

//! A high-level view into a room's contents.
//!
//! See [`Timeline`] for details.

use std::{fmt, sync::Arc};

use eyeball::Subscriber;
use eyeball_im::VectorDiff;
use futures_core::Stream;
use imbl::Vector;
use serde_json::Value as JsonValue;
use tchap_sdk_base::deserialized_responses::Direction;
use tchap_sdk_common::executor::AbortOnDrop;
use tracing::instrument;

use crate::{
    room::Room,
    send_queue::{RoomSendQueueError, SendHandle},
};

mod builder;
mod error;
mod inner;
mod item;

pub use self::{
    builder::TimelineBuilder,
    error::TimelineError,
    item::{TimelineItem, TimelineItemContent, TimelineItemKind},
};
use self::inner::TimelineInner;

/// Where a [`Timeline`] is at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimelineState {
    /// The timeline follows the live end of the room.
    Live,

    /// Older events are being loaded. The timeline still follows the live
    /// end meanwhile.
    PaginatingBackward,

    /// The timeline was closed. It doesn't change anymore.
    Detached,
}

/// A high-level view into a regular room's contents.
///
/// The timeline shows the confirmed events of the room in server order,
/// followed by the local echoes of the events being sent from this device,
/// in send order. It follows the room store: events received through sync
/// are appended, and the local echo of an event is replaced in place by the
/// event once it's confirmed.
///
/// Dropping the timeline closes it.
pub struct Timeline {
    inner: Arc<TimelineInner>,

    /// The listener of room updates, it's aborted when the timeline is
    /// dropped.
    room_update_join_handle: AbortOnDrop<()>,
}

impl Timeline {
    /// Create a new [`TimelineBuilder`] for the given room.
    pub fn builder(room: &Room) -> TimelineBuilder {
        TimelineBuilder::new(room)
    }

    /// The room this timeline shows.
    pub fn room(&self) -> &Room {
        self.inner.room()
    }

    /// Get the current timeline items.
    pub async fn items(&self) -> Vector<Arc<TimelineItem>> {
        self.inner.items().await
    }

    /// Get the latest item of the timeline, a local echo if any.
    pub async fn latest_item(&self) -> Option<Arc<TimelineItem>> {
        self.inner.items().await.last().cloned()
    }

    /// Get the current timeline items, and a stream of changes.
    ///
    /// You can poll this stream to receive updates. See
    /// [`futures_util::StreamExt`] for a high-level API on top of [`Stream`].
    pub async fn subscribe(
        &self,
    ) -> (Vector<Arc<TimelineItem>>, impl Stream<Item = VectorDiff<Arc<TimelineItem>>>) {
        self.inner.subscribe().await
    }

    /// The current state of the timeline.
    pub fn state(&self) -> TimelineState {
        self.inner.state()
    }

    /// Subscribe to the state of the timeline.
    pub fn subscribe_to_state(&self) -> Subscriber<TimelineState> {
        self.inner.subscribe_to_state()
    }

    /// Load more events in the given direction.
    ///
    /// The timeline always follows the live end of the room, so loading
    /// forward does nothing and returns `0`.
    ///
    /// Returns the number of events added to the timeline.
    pub async fn load_more(
        &self,
        direction: Direction,
        limit: u16,
    ) -> Result<usize, TimelineError> {
        match direction {
            Direction::Backward => self.paginate_backwards(limit).await,
            Direction::Forward => {
                if self.inner.is_detached() {
                    Err(TimelineError::Detached)
                } else {
                    Ok(0)
                }
            }
        }
    }

    /// Add more events to the start of the timeline.
    ///
    /// Events are read from the cache first, and fetched from the server
    /// once the cache is exhausted.
    ///
    /// Only one pagination can run at a time: calling this while one is
    /// running fails with [`TimelineError::PaginationInProgress`].
    ///
    /// Returns the number of events added to the timeline, `0` once the start
    /// of the room is reached.
    #[instrument(skip(self), fields(room_id = %self.room().room_id()))]
    pub async fn paginate_backwards(&self, limit: u16) -> Result<usize, TimelineError> {
        self.inner.paginate_backwards(limit).await
    }

    /// Try to decrypt again the events that couldn't be decrypted, e.g.
    /// after their room key was received.
    ///
    /// Returns the number of events that could be decrypted.
    pub async fn retry_decryption(&self) -> usize {
        if self.inner.is_detached() {
            return 0;
        }

        self.inner.retry_decryption().await
    }

    /// Send a message to the room.
    ///
    /// Its local echo is added at the end of the timeline right away, and
    /// replaced by the event once sync confirms it.
    ///
    /// # Arguments
    ///
    /// * `content` - The content of the `m.room.message` event.
    #[instrument(skip(self, content), fields(room_id = %self.room().room_id()))]
    pub async fn send(&self, content: JsonValue) -> Result<SendHandle, RoomSendQueueError> {
        self.room().send_event(content, None).await
    }

    /// Close the timeline.
    ///
    /// It stops following the room and the pagination in flight, if any, is
    /// aborted. The items stay as they are.
    pub fn close(&self) {
        self.inner.detach();
        self.room_update_join_handle.abort();
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.inner.detach();
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("room_id", &self.room().room_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
