// The http mocking library is not supported for wasm32
#![cfg(not(target_arch = "wasm32"))]

use std::{future::Future, time::Duration};

use ruma::{device_id, user_id};
use serde::Serialize;
use tchap_sdk::{
    config::{BackoffPolicy, RequestConfig, SendQueueConfig, SyncSettings},
    Client, MatrixSession,
};
use wiremock::{
    matchers::{header, method, path, query_param, query_param_is_missing},
    Mock, MockServer, ResponseTemplate,
};

mod send_queue;
mod sync;
mod timeline;

tchap_sdk_test::init_tracing_for_tests!();

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new()
        .initial_interval(Duration::from_millis(10))
        .max_interval(Duration::from_millis(20))
        .randomization_factor(0.0)
}

fn sync_settings() -> SyncSettings {
    SyncSettings::new().timeout(Duration::from_millis(10)).backoff(fast_backoff())
}

fn session() -> MatrixSession {
    MatrixSession {
        user_id: user_id!("@example:localhost").to_owned(),
        device_id: device_id!("DEVICEID").to_owned(),
        access_token: "1234".to_owned(),
    }
}

async fn logged_in_client(server: &MockServer) -> Client {
    let client = Client::builder()
        .homeserver_url(server.uri())
        .request_config(RequestConfig::new().retry_limit(3).backoff(fast_backoff()))
        .send_queue_config(SendQueueConfig::new().max_attempts(3).backoff(fast_backoff()))
        .build()
        .await
        .unwrap();

    client.restore_session(session()).await.unwrap();
    client
}

async fn logged_in_client_with_server() -> (Client, MockServer) {
    let server = MockServer::start().await;
    let client = logged_in_client(&server).await;
    (client, server)
}

/// Mount a Mock on the given server to handle the `GET /sync` endpoint with
/// an optional `since` param that returns a 200 status code with the given
/// response body.
async fn mock_sync(server: &MockServer, response_body: impl Serialize, since: Option<&str>) {
    let mut builder = Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(header("authorization", "Bearer 1234"));

    if let Some(since) = since {
        builder = builder.and(query_param("since", since));
    } else {
        builder = builder.and(query_param_is_missing("since"));
    }

    builder
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// Poll `condition` until it holds, failing the test after a few seconds.
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the condition wasn't met in time");
}
