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

//! Error conditions.

use std::time::Duration;

use as_variant::as_variant;
use http::StatusCode;
use reqwest::Error as ReqwestError;
use ruma::IdParseError;
use serde::Deserialize;
use serde_json::Error as JsonError;
use tchap_sdk_base::{Error as SdkBaseError, StoreError};
use tchap_sdk_common::retry::{RetryKind, Retryable};
use thiserror::Error;
use url::ParseError as UrlParseError;

/// Result type of the tchap-sdk.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result type of a pure HTTP request.
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// The `errcode` of an unknown or expired access token.
pub const M_UNKNOWN_TOKEN: &str = "M_UNKNOWN_TOKEN";
/// The `errcode` of a request that lacks an access token.
pub const M_MISSING_TOKEN: &str = "M_MISSING_TOKEN";
/// The `errcode` of a rate-limited request.
pub const M_LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";

/// An error response of the client-server API.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("the server returned an error: {status} {errcode}: {message}")]
pub struct ApiError {
    /// The HTTP status of the response.
    pub status: StatusCode,

    /// The Matrix error code, `M_UNKNOWN` if the body didn't contain one.
    pub errcode: String,

    /// The human-readable description of the error.
    pub message: String,

    /// How long the server asked to wait before retrying, for rate-limited
    /// requests.
    pub retry_after: Option<Duration>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

impl ApiError {
    /// Build the error out of the status and the body of a failed response.
    ///
    /// Bodies that aren't in the `errcode` + `error` format are tolerated, the
    /// error code is `M_UNKNOWN` then.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let body = serde_json::from_slice::<ErrorBody>(body).ok();
        let (errcode, message, retry_after_ms) = match body {
            Some(ErrorBody { errcode, error, retry_after_ms }) => (errcode, error, retry_after_ms),
            None => (None, None, None),
        };

        Self {
            status,
            errcode: errcode.unwrap_or_else(|| "M_UNKNOWN".to_owned()),
            message: message.unwrap_or_default(),
            retry_after: retry_after_ms.map(Duration::from_millis),
        }
    }

    /// Is this the answer to a request with an invalid access token?
    pub fn is_unknown_token(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
            || self.errcode == M_UNKNOWN_TOKEN
            || self.errcode == M_MISSING_TOKEN
    }

    /// Was the request rate-limited?
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS || self.errcode == M_LIMIT_EXCEEDED
    }
}

/// An HTTP error, representing either a connection error or an error while
/// converting the raw HTTP response into a Matrix response.
#[derive(Error, Debug)]
pub enum HttpError {
    /// An error at the HTTP layer.
    #[error(transparent)]
    Reqwest(#[from] ReqwestError),

    /// Queried endpoint requires authentication but was called on an anonymous
    /// client.
    #[error("the queried endpoint requires authentication but was called before logging in")]
    AuthenticationRequired,

    /// The server returned an error response.
    #[error(transparent)]
    Api(ApiError),

    /// The access token is invalid or expired, the session must be refreshed
    /// by logging in again.
    #[error("the access token is unknown to the server: {0}")]
    UnknownToken(ApiError),

    /// The body of a successful response couldn't be deserialized.
    #[error("the response is malformed: {0}")]
    MalformedResponse(#[source] JsonError),

    /// The request couldn't be built.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// The homeserver URL can't be used as a base for the endpoints.
    #[error("the homeserver URL {0} can't be used as a base URL")]
    InvalidHomeserverUrl(String),

    /// The request was cancelled before a response was received.
    #[error("the request was cancelled")]
    Cancelled,
}

impl HttpError {
    /// If `self` is an [`Api`](Self::Api) or an
    /// [`UnknownToken`](Self::UnknownToken) error, returns the error response.
    pub fn as_api_error(&self) -> Option<&ApiError> {
        as_variant!(self, Self::Api(e) | Self::UnknownToken(e) => e)
    }

    /// Build the error of a failed response.
    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let error = ApiError::from_response(status, body);

        if error.is_unknown_token() {
            Self::UnknownToken(error)
        } else {
            Self::Api(error)
        }
    }
}

impl Retryable for HttpError {
    fn retry_kind(&self) -> RetryKind {
        match self {
            // Builder errors are bugs, not network trouble.
            Self::Reqwest(e) if e.is_builder() => RetryKind::Permanent,
            Self::Reqwest(_) => RetryKind::Transient { retry_after: None },

            Self::Api(e) if e.is_rate_limited() => {
                RetryKind::Transient { retry_after: e.retry_after }
            }
            Self::Api(e) if e.status.is_server_error() => {
                RetryKind::Transient { retry_after: None }
            }

            // A single bad batch must not wedge the sync loop.
            Self::MalformedResponse(_) => RetryKind::Transient { retry_after: None },

            Self::Api(_)
            | Self::UnknownToken(_)
            | Self::AuthenticationRequired
            | Self::Http(_)
            | Self::InvalidHomeserverUrl(_)
            | Self::Cancelled => RetryKind::Permanent,
        }
    }
}

/// Internal representation of errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error doing an HTTP request.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Queried endpoint requires authentication but was called on an anonymous
    /// client.
    #[error("the queried endpoint requires authentication but was called before logging in")]
    AuthenticationRequired,

    /// The server doesn't accept the access token anymore. Nothing can be done
    /// until the session is restored with new credentials.
    #[error("the session is invalid, the user must log in again")]
    SessionInvalid,

    /// An error de/serializing type for the `StateStore`
    #[error(transparent)]
    SerdeJson(#[from] JsonError),

    /// An error occurred in the state store.
    #[error(transparent)]
    StateStore(#[from] StoreError),

    /// An error encountered when trying to parse an identifier.
    #[error(transparent)]
    Identifier(#[from] IdParseError),

    /// An error encountered when trying to parse a url.
    #[error(transparent)]
    Url(#[from] UrlParseError),

    /// A retried operation was cancelled, e.g. because the session was
    /// closed.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl Error {
    /// If `self` is an HTTP error with an error response, returns it.
    pub fn as_api_error(&self) -> Option<&ApiError> {
        as_variant!(self, Self::Http).and_then(HttpError::as_api_error)
    }
}

impl From<SdkBaseError> for Error {
    fn from(e: SdkBaseError) -> Self {
        match e {
            SdkBaseError::AuthenticationRequired => Self::AuthenticationRequired,
            SdkBaseError::StateStore(e) => Self::StateStore(e),
            SdkBaseError::SerdeJson(e) => Self::SerdeJson(e),
            #[allow(unreachable_patterns)]
            _ => Self::StateStore(StoreError::backend(e)),
        }
    }
}

impl Retryable for Error {
    fn retry_kind(&self) -> RetryKind {
        match self {
            Self::Http(e) => e.retry_kind(),
            _ => RetryKind::Permanent,
        }
    }
}
