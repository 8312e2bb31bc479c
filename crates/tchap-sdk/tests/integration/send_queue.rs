use std::time::Duration;

use assert_matches2::{assert_let, assert_matches};
use ruma::{room_id, RoomId};
use serde_json::json;
use tchap_sdk::{timeline::Timeline, Client, SendState};
use tchap_sdk_test::{test_json, JoinedRoomBuilder, SyncResponseBuilder};
use wiremock::{
    matchers::{method, path_regex},
    Mock, MockServer, ResponseTemplate,
};

use crate::{logged_in_client_with_server, mock_sync, session, sync_settings, wait_until};

fn test_room_id() -> &'static RoomId {
    room_id!("!r1:localhost")
}

async fn joined_room_timeline(client: &Client, server: &MockServer) -> Timeline {
    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(JoinedRoomBuilder::new(test_room_id()));
    mock_sync(server, builder.build_json_sync_response_with_token("t1"), None).await;
    client.sync_once(sync_settings()).await.unwrap();

    client.get_room(test_room_id()).await.unwrap().unwrap().timeline().await.unwrap()
}

/// The transaction IDs and send states of the local echoes of the timeline.
async fn local_echoes(timeline: &Timeline) -> Vec<(String, SendState)> {
    timeline
        .items()
        .await
        .iter()
        .filter(|item| item.is_local_echo())
        .filter_map(|item| Some((item.transaction_id()?.to_string(), item.send_state()?)))
        .collect()
}

fn text(body: &str) -> serde_json::Value {
    json!({ "msgtype": "m.text", "body": body })
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_the_same_transaction_id() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx1$"))
        .respond_with(ResponseTemplate::new(500).set_body_json(&*test_json::INTERNAL_ERROR))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_json::event_id_response("$e1")))
        .expect(1)
        .mount(&server)
        .await;

    timeline.room().send_event(text("hi"), Some("tx1".into())).await.unwrap();

    wait_until(|| async {
        local_echoes(&timeline).await
            == [(
                "tx1".to_owned(),
                SendState::Sent { event_id: ruma::event_id!("$e1").to_owned() },
            )]
    })
    .await;
}

#[tokio::test]
async fn test_events_are_sent_in_order() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_json::event_id_response("$e")))
        .expect(3)
        .mount(&server)
        .await;

    for (i, body) in ["one", "two", "three"].into_iter().enumerate() {
        timeline.room().send_event(text(body), Some(format!("tx{i}").as_str().into())).await.unwrap();
    }

    wait_until(|| async {
        let echoes = local_echoes(&timeline).await;
        echoes.len() == 3 && echoes.iter().all(|(_, state)| matches!(state, SendState::Sent { .. }))
    })
    .await;

    let transaction_ids: Vec<_> =
        local_echoes(&timeline).await.into_iter().map(|(txn, _)| txn).collect();
    assert_eq!(transaction_ids, ["tx0", "tx1", "tx2"]);

    let sent_bodies: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.url.path().contains("/send/"))
        .map(|request| request.body_json::<serde_json::Value>().unwrap()["body"].to_string())
        .collect();
    assert_eq!(sent_bodies, ["\"one\"", "\"two\"", "\"three\""]);
}

#[tokio::test]
async fn test_failed_event_can_be_resent() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx1$"))
        .respond_with(ResponseTemplate::new(403).set_body_json(&*test_json::FORBIDDEN))
        .expect(1)
        .mount(&server)
        .await;

    let handle = timeline.room().send_event(text("hi"), Some("tx1".into())).await.unwrap();

    wait_until(|| async {
        local_echoes(&timeline).await.iter().any(|(_, state)| state.is_failed())
    })
    .await;
    assert_let!([(_, SendState::Failed { is_recoverable, .. })] = &local_echoes(&timeline).await[..]);
    assert!(!is_recoverable);

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_json::event_id_response("$e1")))
        .expect(1)
        .mount(&server)
        .await;

    let new_handle = handle.resend().await.unwrap();
    assert_ne!(new_handle.transaction_id(), handle.transaction_id());

    wait_until(|| async {
        let echoes = local_echoes(&timeline).await;
        echoes.len() == 1
            && echoes[0].0 == new_handle.transaction_id().as_str()
            && matches!(echoes[0].1, SendState::Sent { .. })
    })
    .await;

    // Only failed events can be resent or discarded.
    assert_matches!(
        new_handle.discard().await,
        Err(tchap_sdk::RoomSendQueueError::NotFailed)
    );
}

#[tokio::test]
async fn test_failed_event_can_be_discarded() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/.*$"))
        .respond_with(ResponseTemplate::new(500).set_body_json(&*test_json::INTERNAL_ERROR))
        .mount(&server)
        .await;

    let handle = timeline.room().send_event(text("hi"), None).await.unwrap();

    // The attempts are exhausted, the server may still accept it later.
    wait_until(|| async {
        local_echoes(&timeline).await.iter().any(|(_, state)| state.is_failed())
    })
    .await;
    assert_let!([(_, SendState::Failed { is_recoverable, .. })] = &local_echoes(&timeline).await[..]);
    assert!(is_recoverable);

    handle.discard().await.unwrap();
    wait_until(|| async { local_echoes(&timeline).await.is_empty() }).await;
}

#[tokio::test]
async fn test_queued_event_can_be_aborted() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx1$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(test_json::event_id_response("$e1"))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx2$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_json::event_id_response("$e2")))
        .expect(0)
        .mount(&server)
        .await;

    let room = timeline.room().clone();
    let first = room.send_event(text("one"), Some("tx1".into())).await.unwrap();
    let second = room.send_event(text("two"), Some("tx2".into())).await.unwrap();

    // The first one is in flight, the second one is still queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.abort().await.unwrap());
    assert!(second.abort().await.unwrap());

    wait_until(|| async {
        local_echoes(&timeline).await
            == [(
                "tx1".to_owned(),
                SendState::Sent { event_id: ruma::event_id!("$e1").to_owned() },
            )]
    })
    .await;
}

#[tokio::test]
async fn test_sends_interrupted_by_a_logout_are_failed_on_restore() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/.*$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(test_json::event_id_response("$e1"))
                .set_delay(Duration::from_secs(60)),
        )
        .mount(&server)
        .await;

    timeline.room().send_event(text("hi"), Some("tx1".into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.logout_locally().await.unwrap();
    assert_eq!(local_echoes(&timeline).await, [("tx1".to_owned(), SendState::Sending)]);

    client.restore_session(session()).await.unwrap();

    wait_until(|| async {
        local_echoes(&timeline).await.iter().all(|(_, state)| {
            matches!(state, SendState::Failed { is_recoverable: true, .. })
        })
    })
    .await;
}

#[tokio::test]
async fn test_queue_handle_from_before_a_logout_still_sends() {
    let (client, server) = logged_in_client_with_server().await;
    let timeline = joined_room_timeline(&client, &server).await;
    let queue = timeline.room().send_queue();

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/.*/send/m\.room\.message/tx1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(test_json::event_id_response("$e1")))
        .expect(1)
        .mount(&server)
        .await;

    client.logout_locally().await.unwrap();
    client.restore_session(session()).await.unwrap();

    let handle = queue.send("m.room.message", text("hi"), Some("tx1".into())).await.unwrap();
    assert_eq!(handle.transaction_id().as_str(), "tx1");

    wait_until(|| async {
        local_echoes(&timeline).await
            == [(
                "tx1".to_owned(),
                SendState::Sent { event_id: ruma::event_id!("$e1").to_owned() },
            )]
    })
    .await;
}
