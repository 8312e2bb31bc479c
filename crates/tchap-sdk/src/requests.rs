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

//! The client-server API endpoints the SDK talks to.

use std::{fmt::Debug, time::Duration};

use http::Method;
use ruma::{presence::PresenceState, OwnedEventId, OwnedRoomId, OwnedTransactionId};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use tchap_sdk_base::{
    deserialized_responses::{Direction, SyncTimelineEvent},
    sync::{deserialize_events_lossy, SyncEventsResponse},
};

/// A request to an endpoint under `/_matrix/client/v3`.
///
/// All of them require an access token.
pub(crate) trait OutgoingRequest: Debug {
    /// The HTTP method of the endpoint.
    const METHOD: Method;

    /// The body of a successful response.
    type Response: DeserializeOwned + Send;

    /// The path segments after `/_matrix/client/v3`, unescaped.
    fn path_segments(&self) -> Vec<String>;

    /// The query string parameters.
    fn query(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// The JSON body, if any.
    fn body(&self) -> Option<&JsonValue> {
        None
    }
}

/// `GET /_matrix/client/v3/sync`
#[derive(Clone, Debug, Default)]
pub(crate) struct SyncRequest {
    pub since: Option<String>,
    pub timeout: Option<Duration>,
    pub full_state: bool,
    pub set_presence: Option<PresenceState>,
}

impl OutgoingRequest for SyncRequest {
    const METHOD: Method = Method::GET;
    type Response = SyncEventsResponse;

    fn path_segments(&self) -> Vec<String> {
        vec!["sync".to_owned()]
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();

        if let Some(since) = &self.since {
            query.push(("since", since.clone()));
        }
        if let Some(timeout) = self.timeout {
            query.push(("timeout", timeout.as_millis().to_string()));
        }
        if self.full_state {
            query.push(("full_state", "true".to_owned()));
        }
        if let Some(presence) = &self.set_presence {
            query.push(("set_presence", presence.as_str().to_owned()));
        }

        query
    }
}

/// `GET /_matrix/client/v3/rooms/{roomId}/messages`
#[derive(Clone, Debug)]
pub(crate) struct MessagesRequest {
    pub room_id: OwnedRoomId,
    pub from: String,
    pub dir: Direction,
    pub limit: u32,
}

/// The body of a `/messages` response.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    /// The token the page starts at, i.e. the `from` of the request.
    #[allow(dead_code)]
    pub start: String,

    /// The token to continue paginating from. Missing if there are no more
    /// events in that direction.
    #[serde(default)]
    pub end: Option<String>,

    /// The events, in the order of the pagination: reverse chronological for
    /// a backward pagination.
    #[serde(default, deserialize_with = "deserialize_events_lossy")]
    pub chunk: Vec<SyncTimelineEvent>,
}

impl OutgoingRequest for MessagesRequest {
    const METHOD: Method = Method::GET;
    type Response = MessagesResponse;

    fn path_segments(&self) -> Vec<String> {
        vec!["rooms".to_owned(), self.room_id.to_string(), "messages".to_owned()]
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("from", self.from.clone()),
            ("dir", self.dir.as_str().to_owned()),
            ("limit", self.limit.to_string()),
        ]
    }
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`
#[derive(Clone, Debug)]
pub(crate) struct SendEventRequest {
    pub room_id: OwnedRoomId,
    pub event_type: String,
    pub transaction_id: OwnedTransactionId,
    pub content: JsonValue,
}

/// The body of a `/send` response.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SendEventResponse {
    pub event_id: OwnedEventId,
}

impl OutgoingRequest for SendEventRequest {
    const METHOD: Method = Method::PUT;
    type Response = SendEventResponse;

    fn path_segments(&self) -> Vec<String> {
        vec![
            "rooms".to_owned(),
            self.room_id.to_string(),
            "send".to_owned(),
            self.event_type.clone(),
            self.transaction_id.to_string(),
        ]
    }

    fn body(&self) -> Option<&JsonValue> {
        Some(&self.content)
    }
}
