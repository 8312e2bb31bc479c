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
#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations, missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use async_trait::async_trait;
pub use bytes;
pub use tchap_sdk_base::{
    decryption, deserialized_responses,
    store::{
        send_queue::{LocalEcho, SendState},
        DynStateStore, MemoryStore,
    },
    MatrixSession, RoomInfo, RoomState, RoomSummary, StateStore, StoreError,
};
#[cfg(feature = "sqlite")]
pub use tchap_sdk_sqlite::SqliteStateStore;
pub use tchap_sdk_common::*;

mod client;
pub mod config;
mod error;
mod http_client;
mod requests;
pub mod room;
pub mod send_queue;
pub mod sync;
pub mod timeline;

pub use client::{Client, ClientBuildError, ClientBuilder};
pub use error::{ApiError, Error, HttpError, HttpResult, Result};
pub use http_client::HttpSend;
pub use room::Room;
pub use ruma::{IdParseError, OwnedServerName, ServerName};
pub use send_queue::{RoomSendQueue, RoomSendQueueError, SendHandle, SendQueue};
pub use sync::{LoopCtrl, SyncState};
pub use timeline::{Timeline, TimelineError, TimelineItem};

#[cfg(test)]
tchap_sdk_test::init_tracing_for_tests!();
