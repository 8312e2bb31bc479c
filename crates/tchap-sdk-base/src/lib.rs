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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub use tchap_sdk_common::*;

pub use crate::error::{Error, Result};

mod client;
pub mod decryption;
pub mod deserialized_responses;
mod error;
pub mod rooms;
mod session;
pub mod store;
pub mod sync;
pub mod trackers;

pub use client::BaseClient;
pub use rooms::{RoomHero, RoomInfo, RoomState, RoomSummary, UnreadNotificationsCount};
pub use session::MatrixSession;
pub use store::{StateStore, StateStoreDataKey, StateStoreDataValue, StoreError};

#[cfg(test)]
tchap_sdk_test::init_tracing_for_tests!();
