use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use assert_matches2::assert_let;
use ruma::room_id;
use tchap_sdk::{config::SyncToken, Error, LoopCtrl, RoomState, SyncState};
use tchap_sdk_test::{
    sync_state_event, sync_timeline_event, test_json, JoinedRoomBuilder, LeftRoomBuilder,
    SyncResponseBuilder,
};
use wiremock::{
    matchers::{method, path, query_param},
    Mock, ResponseTemplate,
};

use crate::{logged_in_client_with_server, mock_sync, sync_settings};

#[tokio::test]
async fn test_sync_once_applies_the_response_and_persists_the_token() {
    let (client, server) = logged_in_client_with_server().await;
    let room_id = room_id!("!r1:localhost");

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(room_id)
            .add_timeline_event(sync_timeline_event!("$e1", "@bob:localhost", "one"))
            .add_timeline_event(sync_timeline_event!("$e2", "@bob:localhost", "two")),
    );
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;

    let response = client.sync_once(sync_settings()).await.unwrap();
    assert_eq!(response.next_batch, "t1");
    assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t1"));
    assert_eq!(client.sync_state(), SyncState::Idle);

    let summaries = client.room_summaries().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].room_id, room_id);
    assert_eq!(summaries[0].room_state, RoomState::Joined);
    assert_eq!(summaries[0].latest_event.as_ref().unwrap().event_id, "$e2");
}

#[tokio::test]
async fn test_state_changes_follow_the_server_order() {
    let (client, server) = logged_in_client_with_server().await;
    let room_id = room_id!("!r1:localhost");

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_state_event(sync_state_event!(
        "$n1",
        "m.room.name",
        "",
        { "name": "A" }
    )));
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;

    builder.add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(
        sync_state_event!("$n2", "m.room.name", "", { "name": "B" }),
    ));
    mock_sync(&server, builder.build_json_sync_response_with_token("t2"), Some("t1")).await;

    client.sync_once(sync_settings()).await.unwrap();
    let room = client.get_room(room_id).await.unwrap().unwrap();
    assert_eq!(room.display_name().await.unwrap(), "A");

    client.sync_once(sync_settings()).await.unwrap();
    assert_eq!(room.display_name().await.unwrap(), "B");
    assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_left_room() {
    let (client, server) = logged_in_client_with_server().await;
    let room_id = room_id!("!r1:localhost");

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(JoinedRoomBuilder::new(room_id));
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;
    builder.add_left_room(LeftRoomBuilder::new(room_id));
    mock_sync(&server, builder.build_json_sync_response_with_token("t2"), Some("t1")).await;

    client.sync_once(sync_settings()).await.unwrap();
    client.sync_once(sync_settings()).await.unwrap();

    let room = client.get_room(room_id).await.unwrap().unwrap();
    assert_eq!(room.state().await.unwrap(), RoomState::Left);
}

#[tokio::test]
async fn test_initial_sync_forgets_absent_rooms() {
    let (client, server) = logged_in_client_with_server().await;
    let kept = room_id!("!kept:localhost");
    let gone = room_id!("!gone:localhost");

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(JoinedRoomBuilder::new(kept));
    builder.add_joined_room(JoinedRoomBuilder::new(gone));
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;

    client.sync_once(sync_settings()).await.unwrap();
    assert_eq!(client.rooms().await.unwrap().len(), 2);

    builder.add_joined_room(JoinedRoomBuilder::new(kept));
    mock_sync(&server, builder.build_json_sync_response_with_token("t9"), None).await;

    client.force_full_resync().await.unwrap();
    client.sync_once(sync_settings()).await.unwrap();

    let rooms = client.rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].room_id(), kept);
    assert!(client.get_room(gone).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_access_token_invalidates_the_session() {
    let (client, server) = logged_in_client_with_server().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(401).set_body_json(&*test_json::UNKNOWN_TOKEN))
        .expect(1)
        .mount(&server)
        .await;

    assert_let!(Err(Error::SessionInvalid) = client.sync(sync_settings()).await);
    assert_eq!(client.sync_state(), SyncState::SessionInvalid);
}

#[tokio::test]
async fn test_malformed_response_is_retried_with_the_same_token() {
    let (client, server) = logged_in_client_with_server().await;

    // A bad batch is never applied, the same request is sent again.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(query_param("since", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{ \"next_batch\": "))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let mut builder = SyncResponseBuilder::new();
    mock_sync(&server, builder.build_json_sync_response_with_token("t2"), Some("t1")).await;

    let response = client.sync_once(sync_settings().token("t1")).await.unwrap();
    assert_eq!(response.next_batch, "t2");
    assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let (client, server) = logged_in_client_with_server().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(500).set_body_json(&*test_json::INTERNAL_ERROR))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(429).set_body_json(test_json::limit_exceeded(10)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let mut builder = SyncResponseBuilder::new();
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;

    client.sync_once(sync_settings()).await.unwrap();
    assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_forbidden_terminates_the_loop() {
    let (client, server) = logged_in_client_with_server().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(403).set_body_json(&*test_json::FORBIDDEN))
        .expect(1)
        .mount(&server)
        .await;

    let result = client.sync(sync_settings()).await;
    assert_eq!(result.unwrap_err().as_api_error().unwrap().errcode, "M_FORBIDDEN");
    assert_let!(SyncState::Terminated { .. } = client.sync_state());
}

#[tokio::test]
async fn test_sync_loop_uses_the_next_batch_of_the_previous_response() {
    let (client, server) = logged_in_client_with_server().await;

    let mut builder = SyncResponseBuilder::new();
    mock_sync(&server, builder.build_json_sync_response_with_token("t1"), None).await;
    mock_sync(&server, builder.build_json_sync_response_with_token("t2"), Some("t1")).await;
    mock_sync(&server, builder.build_json_sync_response_with_token("t3"), Some("t2")).await;

    let calls = Arc::new(AtomicUsize::new(0));
    client
        .sync_with_callback(sync_settings().token(SyncToken::NoToken), |response| {
            let calls = calls.clone();
            async move {
                let count = calls.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(response.next_batch, format!("t{count}"));

                if count == 3 {
                    LoopCtrl::Break
                } else {
                    LoopCtrl::Continue
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.sync_token().await.unwrap().as_deref(), Some("t3"));
    assert_eq!(client.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn test_logging_out_stops_the_sync_loop() {
    let (client, server) = logged_in_client_with_server().await;

    // The server never answers in time.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(&*test_json::EMPTY_SYNC)
                .set_delay(std::time::Duration::from_secs(60)),
        )
        .mount(&server)
        .await;

    let sync = tokio::spawn({
        let client = client.clone();
        async move { client.sync(sync_settings()).await }
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    client.logout_locally().await.unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), sync).await.unwrap();
    result.unwrap().unwrap();
    assert_eq!(client.sync_state(), SyncState::Idle);
}
