use once_cell::sync::Lazy;
use ruma::{room_id, user_id, RoomId, UserId};

#[doc(hidden)]
pub mod __macro_support {
    pub use ctor::ctor;
    pub use serde_json;
    pub use tracing_subscriber;
}

/// Create the JSON of a sync timeline event.
///
/// `sync_timeline_event!("$id", "@sender:server", "body")` builds an
/// `m.room.message` text event, any other input is forwarded to
/// [`serde_json::json`].
#[macro_export]
macro_rules! sync_timeline_event {
    ($event_id:literal, $sender:literal, $body:literal) => {
        $crate::__macro_support::serde_json::json!({
            "event_id": $event_id,
            "sender": $sender,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": $body },
            "origin_server_ts": 152037280,
        })
    };
    ($( $tt:tt )*) => {
        $crate::__macro_support::serde_json::json!( $($tt)* )
    };
}

/// Create the JSON of a sync state event, sent by [`ALICE`].
///
/// `sync_state_event!("$id", "m.room.name", "", { "name": "A" })`.
#[macro_export]
macro_rules! sync_state_event {
    ($event_id:literal, $event_type:literal, $state_key:literal, $content:tt) => {
        $crate::__macro_support::serde_json::json!({
            "event_id": $event_id,
            "sender": "@alice:example.org",
            "type": $event_type,
            "state_key": $state_key,
            "content": $content,
            "origin_server_ts": 152037280,
        })
    };
}

/// Install a `tracing` subscriber printing to the test output, filtered with
/// `RUST_LOG`, before any test of the crate runs.
#[macro_export]
macro_rules! init_tracing_for_tests {
    () => {
        #[$crate::__macro_support::ctor]
        fn init_logging() {
            use $crate::__macro_support::tracing_subscriber::{
                fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
            };

            let _ = $crate::__macro_support::tracing_subscriber::registry()
                .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .with(fmt::layer().with_test_writer())
                .try_init();
        }
    };
}

mod sync_builder;
pub mod test_json;

pub use self::sync_builder::{
    InvitedRoomBuilder, JoinedRoomBuilder, LeftRoomBuilder, SyncResponseBuilder,
};

pub static ALICE: Lazy<&UserId> = Lazy::new(|| user_id!("@alice:example.org"));
pub static BOB: Lazy<&UserId> = Lazy::new(|| user_id!("@bob:example.org"));
pub static CAROL: Lazy<&UserId> = Lazy::new(|| user_id!("@carol:example.org"));

/// The room ID used by the room builders when none is given.
pub static DEFAULT_TEST_ROOM_ID: Lazy<&RoomId> =
    Lazy::new(|| room_id!("!SVkFJHzfwvuaIEawgC:localhost"));
