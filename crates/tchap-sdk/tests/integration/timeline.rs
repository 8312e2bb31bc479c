use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches2::assert_let;
use ruma::{room_id, RoomId};
use serde_json::json;
use tchap_sdk::{
    async_trait,
    config::{RequestConfig, SyncSettings},
    decryption::{session_id_of, DecryptedEvent, DecryptionError, Decryptor},
    deserialized_responses::{Direction, SyncTimelineEvent},
    timeline::{TimelineItemContent, TimelineState},
    Client, SendState, TimelineError,
};
use tchap_sdk_test::{
    sync_timeline_event, test_json, JoinedRoomBuilder, SyncResponseBuilder,
};
use wiremock::{
    matchers::{method, path_regex, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    fast_backoff, logged_in_client_with_server, mock_sync, session, sync_settings, wait_until,
};

fn test_room_id() -> &'static RoomId {
    room_id!("!r1:localhost")
}

async fn mock_messages(server: &MockServer, from: &str, response: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/messages$"))
        .and(query_param("from", from))
        .and(query_param("dir", "b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .expect(1)
        .mount(server)
        .await;
}

/// Sync a room whose cached timeline is `$e5`, with `p1` to paginate from.
async fn synced_room_with_history(client: &Client, server: &MockServer) {
    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(test_room_id())
            .add_timeline_event(sync_timeline_event!("$e5", "@bob:localhost", "five"))
            .set_timeline_prev_batch("p1"),
    );
    mock_sync(server, builder.build_json_sync_response_with_token("t1"), None).await;
    client.sync_once(sync_settings()).await.unwrap();
}

fn event_ids(items: &imbl::Vector<Arc<tchap_sdk::TimelineItem>>) -> Vec<String> {
    items.iter().filter_map(|item| item.event_id()).map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn test_local_echo_is_reconciled_exactly_once() {
    let (client, server) = logged_in_client_with_server().await;

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(test_room_id())
            .add_timeline_event(sync_timeline_event!("$e1", "@bob:localhost", "one"))
            .add_timeline_event(sync_timeline_event!("$e2", "@bob:localhost", "two")),
    );
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;
    client.sync_once(sync_settings()).await.unwrap();

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_json::event_id_response("$e3")))
        .expect(1)
        .mount(&server)
        .await;

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();
    assert_eq!(event_ids(&timeline.items().await), ["$e1", "$e2"]);

    let handle = room
        .send_event(json!({ "msgtype": "m.text", "body": "hi" }), Some("tx1".into()))
        .await
        .unwrap();
    assert_eq!(handle.transaction_id().as_str(), "tx1");

    // The echo follows the confirmed events.
    wait_until(|| async {
        let items = timeline.items().await;
        items.len() == 3
            && items[2].transaction_id().is_some_and(|txn| txn.as_str() == "tx1")
            && items[2].send_state().is_some_and(|state| !state.is_failed())
    })
    .await;
    wait_until(|| async {
        timeline.items().await[2].send_state()
            == Some(SendState::Sent { event_id: ruma::event_id!("$e3").to_owned() })
    })
    .await;

    builder.add_joined_room(JoinedRoomBuilder::new(test_room_id()).add_timeline_event(
        sync_timeline_event!({
            "event_id": "$e3",
            "sender": "@example:localhost",
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" },
            "origin_server_ts": 3,
            "unsigned": { "transaction_id": "tx1" },
        }),
    ));
    mock_sync(&server, builder.build_json_sync_response_with_token("t2"), Some("t1")).await;
    client.sync_once(sync_settings()).await.unwrap();

    wait_until(|| async { timeline.items().await.iter().all(|item| !item.is_local_echo()) })
        .await;

    let items = timeline.items().await;
    assert_eq!(event_ids(&items), ["$e1", "$e2", "$e3"]);
    assert_eq!(items[2].send_state(), Some(SendState::Synced));
    assert_eq!(items[2].content().as_message().unwrap().body, "hi");
    assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_back_pagination_does_not_duplicate_events() {
    let (client, server) = logged_in_client_with_server().await;
    synced_room_with_history(&client, &server).await;

    mock_messages(
        &server,
        "p1",
        test_json::messages_response(
            "p1",
            Some("p0"),
            vec![
                sync_timeline_event!("$e4", "@bob:localhost", "four"),
                sync_timeline_event!("$e3", "@bob:localhost", "three"),
            ],
        ),
    )
    .await;
    // The server overlaps with what it already sent.
    mock_messages(
        &server,
        "p0",
        test_json::messages_response(
            "p0",
            None,
            vec![
                sync_timeline_event!("$e3", "@bob:localhost", "three"),
                sync_timeline_event!("$e2", "@bob:localhost", "two"),
            ],
        ),
    )
    .await;

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();

    assert_eq!(timeline.load_more(Direction::Backward, 20).await.unwrap(), 2);
    assert_eq!(event_ids(&timeline.items().await), ["$e3", "$e4", "$e5"]);

    assert_eq!(timeline.paginate_backwards(20).await.unwrap(), 1);
    assert_eq!(event_ids(&timeline.items().await), ["$e2", "$e3", "$e4", "$e5"]);

    // The start of the room was reached.
    assert_eq!(timeline.paginate_backwards(20).await.unwrap(), 0);
    assert_eq!(timeline.state(), TimelineState::Live);

    // Another timeline finds the history in the cache.
    let other = room.timeline_builder().initial_tail(1).build().await.unwrap();
    assert_eq!(event_ids(&other.items().await), ["$e5"]);
    assert_eq!(other.paginate_backwards(2).await.unwrap(), 2);
    assert_eq!(other.paginate_backwards(2).await.unwrap(), 1);
    assert_eq!(event_ids(&other.items().await), ["$e2", "$e3", "$e4", "$e5"]);
}

#[tokio::test]
async fn test_only_one_pagination_at_a_time() {
    let (client, server) = logged_in_client_with_server().await;
    synced_room_with_history(&client, &server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/messages$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(test_json::messages_response(
                    "p1",
                    None,
                    vec![sync_timeline_event!("$e4", "@bob:localhost", "four")],
                ))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();

    let (first, second) = tokio::join!(timeline.paginate_backwards(10), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(timeline.state(), TimelineState::PaginatingBackward);
        timeline.paginate_backwards(10).await
    });

    assert_eq!(first.unwrap(), 1);
    assert_let!(Err(TimelineError::PaginationInProgress) = second);
    assert_eq!(timeline.state(), TimelineState::Live);
}

#[tokio::test]
async fn test_gap_during_pagination_is_a_token_mismatch() {
    let (client, server) = logged_in_client_with_server().await;
    synced_room_with_history(&client, &server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/messages$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(test_json::messages_response(
                    "p1",
                    Some("p0"),
                    vec![sync_timeline_event!("$e4", "@bob:localhost", "four")],
                ))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(test_room_id())
            .add_timeline_event(sync_timeline_event!("$e9", "@bob:localhost", "nine"))
            .set_timeline_limited()
            .set_timeline_prev_batch("p8"),
    );
    mock_sync(&server, builder.build_json_sync_response_with_token("t2"), Some("t1")).await;

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();

    let (pagination, sync) = tokio::join!(timeline.paginate_backwards(10), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.sync_once(sync_settings()).await
    });
    sync.unwrap();

    assert_let!(Err(TimelineError::PaginationTokenMismatch) = pagination);
    assert_eq!(timeline.state(), TimelineState::Live);

    // The timeline follows the new live end.
    wait_until(|| async { event_ids(&timeline.items().await) == ["$e9"] }).await;
}

#[tokio::test]
async fn test_closing_the_timeline_aborts_the_pagination() {
    let (client, server) = logged_in_client_with_server().await;
    synced_room_with_history(&client, &server).await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/messages$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(test_json::messages_response("p1", None, vec![]))
                .set_delay(Duration::from_secs(60)),
        )
        .mount(&server)
        .await;

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();

    let (pagination, ()) = tokio::time::timeout(
        Duration::from_secs(5),
        async {
            tokio::join!(timeline.paginate_backwards(10), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                timeline.close();
            })
        },
    )
    .await
    .unwrap();

    assert_let!(Err(TimelineError::Detached) = pagination);
    assert_eq!(timeline.state(), TimelineState::Detached);
}

#[tokio::test]
async fn test_failing_pagination_gives_up_with_the_default_request_config() {
    let server = MockServer::start().await;
    let client = Client::builder()
        .homeserver_url(server.uri())
        .request_config(RequestConfig::new().backoff(fast_backoff()))
        .build()
        .await
        .unwrap();
    client.restore_session(session()).await.unwrap();
    synced_room_with_history(&client, &server).await;

    // One attempt and three retries, twice.
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/messages$"))
        .respond_with(ResponseTemplate::new(503).set_body_json(&*test_json::INTERNAL_ERROR))
        .expect(8)
        .mount(&server)
        .await;

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();

    for _ in 0..2 {
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            timeline.load_more(Direction::Backward, 20),
        )
        .await
        .expect("the pagination should give up");

        assert_let!(Err(TimelineError::Http(error)) = result);
        assert_eq!(error.as_api_error().unwrap().status.as_u16(), 503);
        assert_eq!(timeline.state(), TimelineState::Live);
    }

    assert_eq!(event_ids(&timeline.items().await), ["$e5"]);
}

/// Decrypts the events of the sessions it knows the key of. The plaintext is
/// in the `plaintext` field of the encrypted content.
#[derive(Debug, Default)]
struct KeyedDecryptor {
    known_sessions: Mutex<HashSet<String>>,
}

#[async_trait]
impl Decryptor for KeyedDecryptor {
    async fn decrypt(
        &self,
        _room_id: &RoomId,
        event: &SyncTimelineEvent,
    ) -> Result<DecryptedEvent, DecryptionError> {
        let session_id = session_id_of(event);
        let known = session_id
            .as_ref()
            .is_some_and(|id| self.known_sessions.lock().unwrap().contains(id));

        if !known {
            return Err(DecryptionError::MissingRoomKey { session_id });
        }

        Ok(DecryptedEvent {
            event_type: "m.room.message".to_owned(),
            content: event.content["plaintext"].clone(),
        })
    }
}

#[tokio::test]
async fn test_events_are_decrypted_once_the_key_arrives() {
    let server = MockServer::start().await;
    let decryptor = Arc::new(KeyedDecryptor::default());
    let client = Client::builder()
        .homeserver_url(server.uri())
        .request_config(RequestConfig::new().backoff(fast_backoff()))
        .decryptor(decryptor.clone())
        .build()
        .await
        .unwrap();
    client.restore_session(session()).await.unwrap();

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(test_room_id())
            .add_timeline_event(sync_timeline_event!("$e1", "@bob:localhost", "clear"))
            .add_timeline_event(sync_timeline_event!({
                "event_id": "$e2",
                "sender": "@bob:localhost",
                "type": "m.room.encrypted",
                "content": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "session_id": "S1",
                    "plaintext": { "msgtype": "m.text", "body": "secret" },
                },
                "origin_server_ts": 2,
            })),
    );
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;
    client.sync_once(SyncSettings::new().backoff(fast_backoff())).await.unwrap();

    let room = client.get_room(test_room_id()).await.unwrap().unwrap();
    let timeline = room.timeline().await.unwrap();

    let items = timeline.items().await;
    assert_eq!(items.len(), 2);
    assert_let!(TimelineItemContent::UnableToDecrypt { session_id } = items[1].content());
    assert_eq!(session_id.as_deref(), Some("S1"));

    assert_eq!(timeline.retry_decryption().await, 0);

    decryptor.known_sessions.lock().unwrap().insert("S1".to_owned());
    assert_eq!(timeline.retry_decryption().await, 1);

    let items = timeline.items().await;
    assert_eq!(event_ids(&items), ["$e1", "$e2"]);
    assert_eq!(items[1].event_type(), "m.room.message");
    assert_eq!(items[1].content().as_message().unwrap().body, "secret");
}
