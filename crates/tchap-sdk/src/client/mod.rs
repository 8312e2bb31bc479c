// Copyright 2020 Damir Jelić
// Copyright 2020 The Matrix.org Foundation C.I.C.
// Copyright 2022 Famedly GmbH
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
    fmt::{self, Debug},
    sync::{Arc, Mutex as StdMutex, Weak},
};

use eyeball::{SharedObservable, Subscriber};
use ruma::{OwnedUserId, RoomId};
use tchap_sdk_base::{
    decryption::Decryptor, retry::AbortHandle, BaseClient, MatrixSession, RoomSummary,
};
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    config::{RequestConfig, SendQueueConfig},
    error::HttpResult,
    http_client::HttpClient,
    requests::OutgoingRequest,
    send_queue::{SendQueue, SendQueueData},
    sync::SyncState,
    Result, Room,
};

mod builder;

pub use self::builder::{ClientBuilder, ClientBuildError};

/// An async/await enabled Matrix client.
///
/// All of the state is held in an `Arc` so the `Client` can be cloned freely.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    /// The URL of the homeserver to connect to.
    homeserver: Url,

    /// The underlying HTTP client.
    http_client: HttpClient,

    /// User session data.
    pub(crate) base_client: BaseClient,

    /// Decrypts the `m.room.encrypted` events of the timelines.
    pub(crate) decryptor: Arc<dyn Decryptor>,

    /// Where the sync loop is at.
    pub(crate) sync_state: SharedObservable<SyncState>,

    /// Cancels the retries of the sync request in flight, if any.
    pub(crate) current_sync: StdMutex<Option<AbortHandle>>,

    /// The events being sent, and how they're retried.
    pub(crate) send_queue_data: Arc<SendQueueData>,
}

impl ClientInner {
    pub(crate) fn new(
        homeserver: Url,
        http_client: HttpClient,
        base_client: BaseClient,
        decryptor: Arc<dyn Decryptor>,
        send_queue_config: SendQueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            homeserver,
            http_client,
            base_client,
            decryptor,
            sync_state: SharedObservable::new(SyncState::Idle),
            current_sync: StdMutex::new(None),
            send_queue_data: Arc::new(SendQueueData::new(send_queue_config)),
        })
    }
}

/// A weak reference to the inner client, useful when trying to get a handle
/// on the owning client.
#[derive(Clone, Debug)]
pub(crate) struct WeakClient {
    client: Weak<ClientInner>,
}

impl WeakClient {
    /// Construct a [`WeakClient`] from a `Client`.
    pub fn from_client(client: &Client) -> Self {
        Self { client: Arc::downgrade(&client.inner) }
    }

    /// Attempts to get a [`Client`] from this [`WeakClient`].
    pub fn get(&self) -> Option<Client> {
        self.client.upgrade().map(|inner| Client { inner })
    }
}

#[cfg(not(tarpaulin_include))]
impl Debug for ClientInner {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ClientInner").field("homeserver", &self.homeserver).finish_non_exhaustive()
    }
}

#[cfg(not(tarpaulin_include))]
impl Debug for Client {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Client")
    }
}

impl Client {
    /// Create a new [`Client`] that will use the given homeserver.
    ///
    /// # Arguments
    ///
    /// * `homeserver_url` - The homeserver that the client should connect to.
    pub async fn new(homeserver_url: Url) -> Result<Self, ClientBuildError> {
        Self::builder().homeserver_url(homeserver_url).build().await
    }

    /// Create a new [`ClientBuilder`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn base_client(&self) -> &BaseClient {
        &self.inner.base_client
    }

    /// The Homeserver of the client.
    pub fn homeserver(&self) -> Url {
        self.inner.homeserver.clone()
    }

    /// The user ID of the logged-in user, if any.
    pub fn user_id(&self) -> Option<OwnedUserId> {
        self.base_client().user_id()
    }

    /// The whole session of the logged-in user, if any.
    pub fn session(&self) -> Option<MatrixSession> {
        self.base_client().session()
    }

    /// Subscribe to the changes of the session, e.g. to notice a logout.
    pub fn subscribe_to_session(&self) -> Subscriber<Option<MatrixSession>> {
        self.base_client().subscribe_to_session()
    }

    /// Is the client logged in.
    pub fn logged_in(&self) -> bool {
        self.base_client().logged_in()
    }

    /// Restore a previously logged in session.
    ///
    /// The session is persisted in the store, so that
    /// [`restore_stored_session`](Self::restore_stored_session) can pick it up
    /// after a restart. Events that were being sent when the client last
    /// stopped are marked as failed, so they can be resent.
    ///
    /// # Arguments
    ///
    /// * `session` - A session that the user already has from a previous
    ///   login call.
    #[instrument(skip_all, fields(user_id = %session.user_id))]
    pub async fn restore_session(&self, session: MatrixSession) -> Result<()> {
        self.base_client().activate(session).await?;
        self.send_queue().load_pending().await?;

        Ok(())
    }

    /// Restore the session persisted in the store, if any.
    ///
    /// Returns whether a session was found.
    pub async fn restore_stored_session(&self) -> Result<bool> {
        if self.base_client().restore_session().await?.is_none() {
            debug!("No session in the store");
            return Ok(false);
        }

        self.send_queue().load_pending().await?;
        Ok(true)
    }

    /// Forget the session and stop everything that runs on its behalf,
    /// without telling the server.
    ///
    /// The sync loop stops and the events that are still being sent are
    /// abandoned: their local echoes stay in their rooms, and are marked as
    /// failed once a session is restored. The rooms and the sync token stay in
    /// the store.
    pub async fn logout_locally(&self) -> Result<()> {
        if let Some(handle) = self.take_current_sync() {
            handle.abort();
        }

        self.inner.send_queue_data.abort_all();
        self.base_client().logout_locally().await?;
        self.inner.sync_state.set(SyncState::Idle);

        info!("Logged out locally");
        Ok(())
    }

    /// The token of the last sync response that was fully applied, if any.
    pub async fn sync_token(&self) -> Result<Option<String>> {
        Ok(self.base_client().sync_token().await?)
    }

    /// Forget the sync token, so the next sync is an initial one.
    ///
    /// The initial sync replaces the rooms of the store: the ones it doesn't
    /// mention anymore are removed.
    pub async fn force_full_resync(&self) -> Result<()> {
        info!("Forcing a full resync");
        Ok(self.base_client().clear_sync_token().await?)
    }

    /// Where the sync loop is at.
    pub fn sync_state(&self) -> SyncState {
        self.inner.sync_state.get()
    }

    /// Subscribe to the state of the sync loop.
    pub fn subscribe_to_sync_state(&self) -> Subscriber<SyncState> {
        self.inner.sync_state.subscribe()
    }

    /// The summaries of all the rooms the client knows about.
    pub async fn room_summaries(&self) -> Result<Vec<RoomSummary>> {
        Ok(self.base_client().room_summaries().await?)
    }

    /// All the rooms the client knows about, whatever the user's membership.
    pub async fn rooms(&self) -> Result<Vec<Room>> {
        Ok(self
            .base_client()
            .store()
            .get_room_infos()
            .await?
            .into_iter()
            .map(|info| Room::new(self.clone(), info.room_id))
            .collect())
    }

    /// Get a room with the given room id.
    ///
    /// Returns `None` if the room isn't known to the store.
    ///
    /// # Arguments
    ///
    /// `room_id` - The unique id of the room that should be fetched.
    pub async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        Ok(self
            .base_client()
            .store()
            .get_room_info(room_id)
            .await?
            .map(|info| Room::new(self.clone(), info.room_id)))
    }

    /// The send queue of this client, to send events to any room.
    pub fn send_queue(&self) -> SendQueue {
        SendQueue::new(self.clone())
    }

    pub(crate) fn set_current_sync(&self, handle: Option<AbortHandle>) {
        if let Ok(mut current) = self.inner.current_sync.lock() {
            *current = handle;
        }
    }

    pub(crate) fn take_current_sync(&self) -> Option<AbortHandle> {
        self.inner.current_sync.lock().ok().and_then(|mut current| current.take())
    }

    /// Send an arbitrary request to the server, with the access token of the
    /// session.
    ///
    /// # Arguments
    ///
    /// * `request` - A filled out and valid request for the endpoint to be hit
    ///
    /// * `config` - Optional request configuration, the client's one is used
    ///   if none is given.
    pub(crate) async fn send<R>(
        &self,
        request: R,
        config: Option<RequestConfig>,
    ) -> HttpResult<R::Response>
    where
        R: OutgoingRequest,
    {
        let access_token = self.session().map(|session| session.access_token);

        self.inner
            .http_client
            .send(request, config, &self.inner.homeserver, access_token.as_deref())
            .await
    }

    /// The request config the client was built with.
    pub(crate) fn request_config(&self) -> RequestConfig {
        self.inner.http_client.request_config
    }
}
