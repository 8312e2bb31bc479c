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

use std::time::{Duration, Instant};

use tracing::Level;

/// A named RAII that will show on Drop how long its covered section took to
/// execute.
pub struct TracingTimer {
    id: String,
    start: Instant,
    level: Level,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for TracingTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingTimer").field("id", &self.id).field("start", &self.start).finish()
    }
}

impl Drop for TracingTimer {
    fn drop(&mut self) {
        let id = &self.id;
        let elapsed = self.elapsed().as_millis();

        match self.level {
            Level::ERROR => tracing::error!("{id} finished in {elapsed}ms"),
            Level::WARN => tracing::warn!("{id} finished in {elapsed}ms"),
            Level::INFO => tracing::info!("{id} finished in {elapsed}ms"),
            Level::DEBUG => tracing::debug!("{id} finished in {elapsed}ms"),
            _ => tracing::trace!("{id} finished in {elapsed}ms"),
        }
    }
}

impl TracingTimer {
    /// Create a new `TracingTimer` logging at the given level.
    pub fn new(id: String, level: Level) -> Self {
        Self { id, start: Instant::now(), level }
    }

    /// Time elapsed since the timer has been created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Macro to create a RAII timer that will log a `tracing` event once it's
/// dropped.
///
/// The tracing level can be specified as a first argument, but it's optional.
/// If it's missing, this will use the debug level.
#[macro_export]
macro_rules! timer {
    ($level:expr, $string:expr) => {
        $crate::tracing_timer::TracingTimer::new($string.into(), $level)
    };

    ($string:expr) => {
        $crate::timer!(tracing::Level::DEBUG, $string)
    };
}
