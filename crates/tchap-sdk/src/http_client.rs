// Copyright 2020 Damir Jelić
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

use std::{
    any::type_name,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use tchap_sdk_common::{retry, AsyncTraitDeps};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, field::debug, instrument, trace, warn};
use url::Url;

use crate::{config::RequestConfig, error::HttpError, requests::OutgoingRequest};

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Abstraction around the http layer. The allows implementors to use different
/// http libraries.
#[async_trait]
pub trait HttpSend: AsyncTraitDeps {
    /// The method abstracting sending request types and receiving response
    /// types.
    ///
    /// This is called by the client every time it wants to send anything to a
    /// homeserver. Error responses must be returned as `Ok`, the client
    /// classifies them itself.
    ///
    /// # Arguments
    ///
    /// * `request` - The http request, with the access token and the JSON
    ///   body already set.
    ///
    /// * `timeout` - A timeout for the full request > response cycle.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use tchap_sdk::{async_trait, bytes::Bytes, HttpError, HttpSend};
    ///
    /// #[derive(Debug)]
    /// struct Client(reqwest::Client);
    ///
    /// impl Client {
    ///     async fn response_to_http_response(
    ///         &self,
    ///         mut response: reqwest::Response,
    ///     ) -> Result<http::Response<Bytes>, HttpError> {
    ///         // Convert the reqwest response to a http one.
    ///         todo!()
    ///     }
    /// }
    ///
    /// #[async_trait]
    /// impl HttpSend for Client {
    ///     async fn send_request(
    ///         &self,
    ///         request: http::Request<Bytes>,
    ///         timeout: Duration,
    ///     ) -> Result<http::Response<Bytes>, HttpError> {
    ///         Ok(self
    ///             .response_to_http_response(
    ///                 self.0.execute(reqwest::Request::try_from(request)?).await?,
    ///             )
    ///             .await?)
    ///     }
    /// }
    /// ```
    async fn send_request(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpError>;
}

#[derive(Clone, Debug)]
struct MaybeSemaphore(Arc<Option<Semaphore>>);

#[allow(dead_code)] // false-positive lint: we never use it but only hold it for the drop
struct MaybeSemaphorePermit<'a>(Option<SemaphorePermit<'a>>);

impl MaybeSemaphore {
    fn new(max: Option<NonZeroUsize>) -> Self {
        let inner = max.map(|i| Semaphore::new(i.into()));
        MaybeSemaphore(Arc::new(inner))
    }

    async fn acquire(&self) -> MaybeSemaphorePermit<'_> {
        match self.0.as_ref() {
            Some(inner) => {
                // This can only ever error if the semaphore was closed,
                // which we never do, so we can safely ignore any error case
                MaybeSemaphorePermit(inner.acquire().await.ok())
            }
            None => MaybeSemaphorePermit(None),
        }
    }
}

/// A request ready to be sent, that can be turned into as many
/// `http::Request`s as there are attempts.
struct PreparedRequest {
    method: http::Method,
    uri: http::Uri,
    authorization: String,
    body: Option<Bytes>,
}

impl PreparedRequest {
    fn to_http_request(&self) -> Result<http::Request<Bytes>, HttpError> {
        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .header(AUTHORIZATION, &self.authorization);

        if self.body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }

        Ok(builder.body(self.body.clone().unwrap_or_default())?)
    }
}

#[derive(Debug)]
pub(crate) struct HttpClient {
    pub(crate) inner: Arc<dyn HttpSend>,
    pub(crate) request_config: RequestConfig,
    concurrent_request_semaphore: MaybeSemaphore,
    next_request_id: Arc<AtomicU64>,
}

impl HttpClient {
    pub(crate) fn new(inner: Arc<dyn HttpSend>, request_config: RequestConfig) -> Self {
        HttpClient {
            inner,
            request_config,
            concurrent_request_semaphore: MaybeSemaphore::new(
                request_config.max_concurrent_requests,
            ),
            next_request_id: AtomicU64::new(0).into(),
        }
    }

    fn get_request_id(&self) -> String {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        format!("REQ-{request_id}")
    }

    fn serialize_request<R>(
        &self,
        request: &R,
        homeserver: &Url,
        access_token: &str,
    ) -> Result<PreparedRequest, HttpError>
    where
        R: OutgoingRequest,
    {
        trace!(request_type = type_name::<R>(), "Serializing request");

        let mut url = homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| HttpError::InvalidHomeserverUrl(homeserver.to_string()))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(request.path_segments());

        let query = request.query();
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let uri = url.as_str().parse::<http::Uri>().map_err(http::Error::from)?;
        let body = request.body().map(|body| Bytes::from(body.to_string()));

        Ok(PreparedRequest {
            method: R::METHOD,
            uri,
            authorization: format!("Bearer {access_token}"),
            body,
        })
    }

    /// Send a request, retrying it on transient errors as allowed by the
    /// config.
    #[instrument(
        skip(self, request, config, homeserver, access_token),
        fields(config, uri, method, request_size, request_id, status, response_size)
    )]
    pub(crate) async fn send<R>(
        &self,
        request: R,
        config: Option<RequestConfig>,
        homeserver: &Url,
        access_token: Option<&str>,
    ) -> Result<R::Response, HttpError>
    where
        R: OutgoingRequest,
    {
        let config = match config {
            Some(config) => config,
            None => self.request_config,
        };

        let access_token = access_token.ok_or(HttpError::AuthenticationRequired)?;

        let request = {
            let request_id = self.get_request_id();
            let span = tracing::Span::current();

            span.record("config", debug(config)).record("request_id", request_id);

            let request = self.serialize_request(&request, homeserver, access_token)?;

            // The query string may carry the sync token, only log the path.
            span.record("method", debug(&request.method)).record("uri", request.uri.path());

            if let Some(body) = &request.body {
                span.record("request_size", body.len());
            }

            request
        };

        // will be automatically dropped at the end of this function
        let _handle = self.concurrent_request_semaphore.acquire().await;

        match Box::pin(self.send_request_with_retries::<R>(&request, config)).await {
            Ok(response) => {
                debug!("Got response");
                Ok(response)
            }
            Err(e) => {
                debug!("Error while sending request: {e:?}");
                Err(e)
            }
        }
    }

    async fn send_request_with_retries<R>(
        &self,
        request: &PreparedRequest,
        config: RequestConfig,
    ) -> Result<R::Response, HttpError>
    where
        R: OutgoingRequest,
    {
        let send_attempt = move || async move {
            let request = request.to_http_request()?;
            self.send_once::<R>(request, config.timeout).await
        };

        retry::execute(send_attempt, config.max_attempts(), config.backoff)
            .await
            .map_err(|e| e.into_inner().unwrap_or(HttpError::Cancelled))
    }

    async fn send_once<R>(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<R::Response, HttpError>
    where
        R: OutgoingRequest,
    {
        let response = self.inner.send_request(request, timeout).await?;

        let status = response.status();
        tracing::Span::current()
            .record("status", status.as_u16())
            .record("response_size", response.body().len());

        if !status.is_success() {
            return Err(HttpError::from_response(status, response.body()));
        }

        serde_json::from_slice(response.body()).map_err(|error| {
            warn!(%error, request_type = type_name::<R>(), "Got a malformed response");
            HttpError::MalformedResponse(error)
        })
    }
}

async fn response_to_http_response(
    mut response: reqwest::Response,
) -> Result<http::Response<Bytes>, HttpError> {
    let status = response.status();

    let mut http_builder = http::Response::builder().status(status);

    if let Some(headers) = http_builder.headers_mut() {
        for (k, v) in response.headers_mut().drain() {
            if let Some(key) = k {
                headers.insert(key, v);
            }
        }
    }

    let body = response.bytes().await?;

    Ok(http_builder.body(body)?)
}

#[async_trait]
impl HttpSend for reqwest::Client {
    async fn send_request(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpError> {
        let mut request = reqwest::Request::try_from(request)?;
        *request.timeout_mut() = Some(timeout);

        let response = self.execute(request).await?;

        response_to_http_response(response).await
    }
}
