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

use std::sync::Arc;

use tchap_sdk_common::executor::{spawn, JoinHandleExt as _};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info_span, trace, warn, Instrument, Span};

use super::{inner::TimelineInner, Timeline};
use crate::{room::Room, Error, Result};

/// The number of events loaded from the cache when a timeline is built.
const DEFAULT_INITIAL_TAIL: usize = 20;

/// Builder that allows creating and configuring various parts of a
/// [`Timeline`].
#[must_use]
#[derive(Debug)]
pub struct TimelineBuilder {
    room: Room,
    initial_tail: usize,
}

impl TimelineBuilder {
    pub(super) fn new(room: &Room) -> Self {
        Self { room: room.clone(), initial_tail: DEFAULT_INITIAL_TAIL }
    }

    /// The number of events to load from the cache when the timeline is
    /// built. Older ones are loaded with
    /// [`Timeline::paginate_backwards`].
    ///
    /// Defaults to 20.
    pub fn initial_tail(mut self, limit: usize) -> Self {
        self.initial_tail = limit;
        self
    }

    /// Create a [`Timeline`] with the options set on this builder.
    ///
    /// The timeline follows the room from then on, until it's closed or
    /// dropped.
    #[tracing::instrument(skip(self), fields(room_id = %self.room.room_id()))]
    pub async fn build(self) -> Result<Timeline> {
        let Self { room, initial_tail } = self;

        let own_user_id = room.client().user_id().ok_or(Error::AuthenticationRequired)?;
        let room_id = room.room_id().to_owned();

        // Subscribe before loading, so no change is missed in between.
        let mut room_updates = room.client().base_client().store().subscribe_to_room_updates();

        let inner = Arc::new(TimelineInner::new(room.clone(), own_user_id, initial_tail));
        inner.reload().await?;

        let span = info_span!(
            parent: Span::none(),
            "room_update_handler",
            room_id = ?room_id,
        );
        span.follows_from(Span::current());

        let room_update_join_handle = spawn({
            let inner = inner.clone();

            async move {
                trace!("Spawned the room update listener");

                loop {
                    let result = match room_updates.recv().await {
                        Ok(updates) => {
                            if !updates.contains(&room_id) {
                                continue;
                            }

                            if updates.is_timeline_reset(&room_id) {
                                trace!("The timeline was reset, reloading");
                                inner.reload().await
                            } else {
                                inner.handle_room_update().await
                            }
                        }

                        Err(RecvError::Lagged(num_skipped)) => {
                            warn!(
                                num_skipped,
                                "Lagged behind room updates, reloading the timeline"
                            );
                            inner.reload().await
                        }

                        Err(RecvError::Closed) => {
                            trace!("The store was dropped, stopping the listener");
                            break;
                        }
                    };

                    if let Err(error) = result {
                        error!(%error, "Couldn't update the timeline");
                    }

                    if inner.is_detached() {
                        break;
                    }
                }
            }
            .instrument(span)
        });

        Ok(Timeline { inner, room_update_join_handle: room_update_join_handle.abort_on_drop() })
    }
}
