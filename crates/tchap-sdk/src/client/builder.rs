// Copyright 2022 The Matrix.org Foundation C.I.C.
// Copyright 2022 Kévin Commaille
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

use std::{fmt, sync::Arc};

use tchap_sdk_base::{
    decryption::{Decryptor, NoDecryptor},
    store::{DynStateStore, IntoStateStore, MemoryStore},
    BaseClient,
};
use thiserror::Error;
use tracing::{debug, field::debug, instrument, Span};
use url::Url;

use super::{Client, ClientInner};
use crate::{
    config::{RequestConfig, SendQueueConfig},
    http_client::{HttpClient, HttpSend},
    HttpError,
};

const DEFAULT_USER_AGENT: &str = concat!("tchap-sdk/", env!("CARGO_PKG_VERSION"));

/// Builder that allows creating and configuring various parts of a [`Client`].
///
/// When setting the `StateStore` it is up to the user to open/connect
/// the storage backend before client creation.
///
/// # Examples
///
/// ```
/// use tchap_sdk::{config::RequestConfig, Client};
///
/// let client_builder = Client::builder()
///     .homeserver_url("https://matrix.example.org")
///     .request_config(RequestConfig::short_retry())
///     .user_agent("MyApp/v3.0");
/// ```
///
/// # Example for using a custom http client
///
/// Note: setting a custom http client will ignore `user_agent`, you'd need to
/// set it yourself if you want it.
///
/// ```
/// use std::sync::Arc;
///
/// use tchap_sdk::Client;
///
/// // setting up a custom http client
/// let reqwest_builder =
///     reqwest::ClientBuilder::new().https_only(true).no_proxy().user_agent("MyApp/v3.0");
///
/// let client_builder = Client::builder().http_client(Arc::new(reqwest_builder.build()?));
/// # anyhow::Ok(())
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    homeserver_url: Option<String>,
    http_client: Option<Arc<dyn HttpSend>>,
    user_agent: Option<String>,
    store_config: BuilderStoreConfig,
    request_config: RequestConfig,
    send_queue_config: SendQueueConfig,
    decryptor: Option<Arc<dyn Decryptor>>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            homeserver_url: None,
            http_client: None,
            user_agent: None,
            store_config: BuilderStoreConfig::Memory,
            request_config: Default::default(),
            send_queue_config: Default::default(),
            decryptor: None,
        }
    }

    /// Set the homeserver URL to use.
    ///
    /// This method is mandatory, building the client fails without it.
    pub fn homeserver_url(mut self, url: impl AsRef<str>) -> Self {
        self.homeserver_url = Some(url.as_ref().to_owned());
        self
    }

    /// Set up the store configuration for a SQLite store.
    ///
    /// The database is created in the given directory if it doesn't exist.
    #[cfg(feature = "sqlite")]
    pub fn sqlite_store(mut self, path: impl AsRef<std::path::Path>) -> Self {
        self.store_config = BuilderStoreConfig::Sqlite { path: path.as_ref().to_owned() };
        self
    }

    /// Use the given, already opened, state store.
    ///
    /// The default is an in-memory store, which loses everything when the
    /// client is dropped.
    pub fn store(mut self, store: impl IntoStateStore) -> Self {
        self.store_config = BuilderStoreConfig::Custom(store.into_state_store());
        self
    }

    /// Set the default timeout, fail and retry behavior for all HTTP requests.
    pub fn request_config(mut self, request_config: RequestConfig) -> Self {
        self.request_config = request_config;
        self
    }

    /// Set how events sent through the send queue are retried.
    pub fn send_queue_config(mut self, send_queue_config: SendQueueConfig) -> Self {
        self.send_queue_config = send_queue_config;
        self
    }

    /// Set a custom HTTP user agent for the client.
    pub fn user_agent(mut self, user_agent: impl AsRef<str>) -> Self {
        self.user_agent = Some(user_agent.as_ref().to_owned());
        self
    }

    /// Specify a client to handle sending requests and receiving responses.
    ///
    /// Any type that implements the `HttpSend` trait can be used to send and
    /// receive HTTP requests, `reqwest::Client` does out of the box.
    pub fn http_client(mut self, client: Arc<dyn HttpSend>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Set the decryptor that turns `m.room.encrypted` events into their
    /// plaintext.
    ///
    /// Without one, every encrypted event shows as unable to decrypt in the
    /// timelines.
    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Create a [`Client`] with the options set on this builder.
    ///
    /// # Errors
    ///
    /// This method can fail for three general reasons:
    ///
    /// * No homeserver URL was set, or it's invalid
    /// * Invalid HTTP configuration
    /// * The store couldn't be opened
    #[instrument(skip_all, target = "tchap_sdk::client", fields(homeserver))]
    pub async fn build(self) -> Result<Client, ClientBuildError> {
        debug!("Starting to build the Client");

        let homeserver = self.homeserver_url.ok_or(ClientBuildError::MissingHomeserver)?;
        let homeserver = Url::parse(&homeserver)?;
        Span::current().record("homeserver", debug(&homeserver));

        let inner_http_client = match self.http_client {
            Some(client) => client,
            None => {
                let user_agent = self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
                let client = reqwest::Client::builder()
                    .user_agent(user_agent)
                    .build()
                    .map_err(HttpError::from)?;

                Arc::new(client) as Arc<dyn HttpSend>
            }
        };

        let store = match self.store_config {
            BuilderStoreConfig::Memory => MemoryStore::new().into_state_store(),
            #[cfg(feature = "sqlite")]
            BuilderStoreConfig::Sqlite { path } => {
                tchap_sdk_sqlite::SqliteStateStore::open(path).await?.into_state_store()
            }
            BuilderStoreConfig::Custom(store) => store,
        };

        let base_client = BaseClient::with_store(store);
        let http_client = HttpClient::new(inner_http_client, self.request_config);
        let decryptor = self.decryptor.unwrap_or_else(|| Arc::new(NoDecryptor));

        let inner = ClientInner::new(
            homeserver,
            http_client,
            base_client,
            decryptor,
            self.send_queue_config,
        );

        debug!("Done building the Client");

        Ok(Client { inner })
    }
}

#[derive(Clone)]
enum BuilderStoreConfig {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite {
        path: std::path::PathBuf,
    },
    Custom(Arc<DynStateStore>),
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BuilderStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[allow(clippy::infallible_destructuring_match)]
        match self {
            Self::Memory => f.write_str("Memory"),
            #[cfg(feature = "sqlite")]
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Self::Custom(store) => f.debug_tuple("Custom").field(store).finish(),
        }
    }
}

/// Errors that can happen in [`ClientBuilder::build`].
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// No homeserver URL was configured
    #[error("no homeserver URL was configured")]
    MissingHomeserver,

    /// An error encountered when trying to parse the homeserver url.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// Error setting up the HTTP client.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Error opening the sqlite store.
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteStore(#[from] tchap_sdk_sqlite::OpenStoreError),
}
