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
#![warn(missing_debug_implementations)]

pub mod debug;
pub mod executor;
pub mod retry;
pub mod sleep;
pub mod tracing_timer;

/// Super trait that is used for our store traits.
pub trait AsyncTraitDeps: std::fmt::Debug + Send + Sync {}
impl<T: std::fmt::Debug + Send + Sync> AsyncTraitDeps for T {}

/// A [`futures_util::future::BoxFuture`] alias, re-exported for the crates
/// that spawn boxed tasks through the executor.
pub type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;
