//! RPC Surface (spec §4.8): the typed duplex port between the peer and its
//! callers (a CLI, the sync bridge, eventually a UI).
//!
//! Grounded on the teacher's `RpcId`-tagged framed-message pattern
//! (`rostra-p2p::connection`), adapted from a wire protocol to an
//! in-process typed channel: `tokio::sync::mpsc` carries [`Request`]s in,
//! a `oneshot` carries each [`Response`] back, and long-running effects
//! (live queries) push further messages on a port the caller supplies with
//! the call. Since the peer, storage worker, and caller are one process in
//! this workspace's target deployment, the port carries owned Rust values
//! rather than an actual byte encoding — the `serde_json` envelope the spec
//! describes applies at whichever outer boundary (Electron IPC, a UI
//! process) eventually sits in front of this port, not to the port itself.

use std::collections::HashMap;
use std::sync::Arc;

use spaces_core::id::{Handle, StreamDid, UserDid};
use spaces_core::{Event, Ulid};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::identity::OAuthCallback;
use crate::peer::{LazyLoadOutcome, Peer};

pub const LOG_TARGET: &str = "spaces::peer::rpc";

/// A space's `comp_space` + `comp_info` rows, flattened for `getSpaceInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    pub hidden: bool,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
    pub handle_account: Option<String>,
    pub admins: Vec<String>,
}

/// Parameters for the closed set of queries `runQuery`/`createLiveQuery`
/// accept (spec §4.8 "queries"); not free-form, mirroring the log server's
/// own closed `named_query` set (spec §4.2, §6).
#[derive(Debug, Clone)]
pub enum NamedQuery {
    SpaceInfo { stream: StreamDid },
    ResolveHandleForSpace { stream: StreamDid },
    Members { room: Ulid },
    FetchEvents { stream: StreamDid, room: Option<Ulid>, limit: u32 },
    FetchLinks { room: Ulid },
    DataUsage { stream: StreamDid },
}

impl NamedQuery {
    /// Tables a live-query re-evaluation should watch (spec §4.5: a query
    /// only re-runs when a table it reads is touched).
    fn tables(&self) -> &'static [&'static str] {
        match self {
            Self::SpaceInfo { .. } => &["comp_space", "comp_info"],
            Self::ResolveHandleForSpace { .. } => &["comp_space"],
            Self::Members { .. } => &["edges"],
            Self::FetchEvents { .. } => &["events_raw", "events_by_stream"],
            Self::FetchLinks { .. } => &["comp_room_link"],
            Self::DataUsage { .. } => &["ids_data_usage"],
        }
    }
}

/// One call from spec §4.8's closed enumeration, plus the two
/// supplemented diagnostics (`getDataUsage`, `dumpTable`).
pub enum Request {
    // auth/session
    Initialize,
    Login(OAuthCallback),
    Logout,
    GetSessionId,
    GetProfile,
    GetMembers { room: Ulid },
    // streams
    CreateSpaceStream { genesis: Event },
    ConnectSpaceStream { stream: StreamDid },
    ConnectPendingSpaces,
    SetSpaceHandle { handle: Handle, stream: StreamDid },
    ResolveSpaceId { handle: Handle },
    ResolveHandleForSpace { stream: StreamDid },
    CheckSpaceExists { stream: StreamDid },
    GetSpaceInfo { stream: StreamDid },
    // events
    SendEvent { stream: StreamDid, event: Event },
    SendEventBatch { stream: StreamDid, events: Vec<Event> },
    FetchEvents { stream: StreamDid, room: Option<Ulid>, limit: u32 },
    FetchLinks { room: Ulid },
    LazyLoadRoom { stream: StreamDid, room: Ulid, end: Option<Ulid>, page_size: u32 },
    // queries
    RunQuery { query: NamedQuery },
    /// Registers a live query; results (including the initial run) are
    /// pushed on `push_tx` as they're produced, keyed by `id` so the caller
    /// can demultiplex several live queries over one port.
    CreateLiveQuery { id: u64, query: NamedQuery, push_tx: mpsc::UnboundedSender<QueryResult> },
    DeleteLiveQuery { id: u64 },
    // storage
    /// Browser-specific storage-worker coordination (spec §1 Non-goal:
    /// "browser storage adapters"); acknowledged, not acted on, outside
    /// that deployment.
    SetActiveSqliteWorker { active: bool },
    DangerousCompletelyDestroyDatabase,
    // blobs
    /// Blob/PDS upload (spec §1 Non-goal: "blob storage"); the call exists
    /// in the closed enumeration but has no implementation here.
    UploadToPds { content: Vec<u8> },
    // diagnostics
    Ping,
    GetDataUsage { stream: StreamDid },
    DumpTable { name: String },
}

/// The result of a query call (`runQuery`, and each push on a live query).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    SpaceInfo(Option<SpaceInfo>),
    HandleForSpace(Option<Handle>),
    Members(Vec<UserDid>),
    Events(Vec<Event>),
    Links(Vec<(Ulid, String)>),
    DataUsage { events_count: u64, bytes_stored: u64 },
}

#[derive(Debug, Clone)]
pub enum Response {
    Ack,
    SessionId(Option<UserDid>),
    Members(Vec<UserDid>),
    StreamDid(StreamDid),
    HandleForSpace(Option<Handle>),
    SpaceId(Option<StreamDid>),
    Exists(bool),
    SpaceInfo(Option<SpaceInfo>),
    Events(Vec<Event>),
    Links(Vec<(Ulid, String)>),
    LazyLoad(LazyLoadOutcome),
    Query(QueryResult),
    LiveQueryCreated,
    DataUsage { events_count: u64, bytes_stored: u64 },
    TableDump(usize),
    Pong,
    /// The spec marks `uploadToPds` as part of the closed enumeration
    /// without this workspace owning blob storage; callers get a typed
    /// "not supported here" rather than the call silently vanishing.
    NotSupported { call: &'static str },
    Error { message: String },
}

/// The peer's half of the duplex port (spec §4.8: "the peer may also call
/// back into the client ... over the same port"). Out of scope here: the
/// three callback messages (`setSessionId`, `initFinished`, `log`) are a
/// UI-process concern this workspace doesn't implement; `tracing` already
/// carries the `log` half for any in-process subscriber.
#[derive(Clone)]
pub struct PeerPort {
    tx: mpsc::UnboundedSender<Call>,
}

struct Call {
    request: Request,
    respond_to: oneshot::Sender<Response>,
}

/// A registered live query's cancellation handle. Dropping it (via
/// `DeleteLiveQuery`, or the whole map dropping when the port shuts down)
/// ends the background re-evaluation task (spec §4.5, §8 scenario 6 "Live
/// query teardown").
struct LiveQueryHandle {
    _cancel: oneshot::Sender<()>,
}

impl PeerPort {
    /// Spawns the dispatch loop and returns a cloneable handle to it. One
    /// loop per `Peer`, matching the teacher's one-request-handler-task
    /// shape (`client/src/task/request_handler.rs`).
    pub fn spawn(peer: Arc<Peer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(peer, rx));
        Self { tx }
    }

    pub async fn call(&self, request: Request) -> Response {
        let (respond_to, rx) = oneshot::channel();
        if self.tx.send(Call { request, respond_to }).is_err() {
            return Response::Error { message: "peer port is closed".to_owned() };
        }
        rx.await.unwrap_or(Response::Error { message: "peer port dropped the response".to_owned() })
    }
}

async fn run(peer: Arc<Peer>, mut rx: mpsc::UnboundedReceiver<Call>) {
    let mut live_queries: HashMap<u64, LiveQueryHandle> = HashMap::new();
    while let Some(Call { request, respond_to }) = rx.recv().await {
        let response = dispatch(&peer, &mut live_queries, request).await;
        let _ = respond_to.send(response);
    }
}

async fn run_named_query(peer: &Arc<Peer>, query: &NamedQuery) -> Result<QueryResult, Response> {
    let to_err = |err: impl ToString| Response::Error { message: err.to_string() };
    match query {
        NamedQuery::SpaceInfo { stream } => {
            let info = peer
                .get_space_info(stream)
                .await
                .map_err(to_err)?
                .map(|(space, info)| SpaceInfo {
                    hidden: space.hidden,
                    name: info.name,
                    avatar: info.avatar,
                    description: info.description,
                    handle_account: space.handle_account,
                    admins: space.admins.into_iter().collect(),
                });
            Ok(QueryResult::SpaceInfo(info))
        }
        NamedQuery::ResolveHandleForSpace { stream } => {
            let handle = peer.resolve_handle_for_space(stream).await.map_err(to_err)?;
            Ok(QueryResult::HandleForSpace(handle))
        }
        NamedQuery::Members { room } => {
            let members = peer.get_members(*room).await.map_err(to_err)?;
            Ok(QueryResult::Members(members))
        }
        NamedQuery::FetchEvents { stream, room, limit } => {
            let events = peer.fetch_events(stream, *room, *limit).await.map_err(to_err)?;
            Ok(QueryResult::Events(events))
        }
        NamedQuery::FetchLinks { room } => {
            let links = peer
                .fetch_links(*room)
                .await
                .map_err(to_err)?
                .into_iter()
                .map(|(id, link)| (id, link.label))
                .collect();
            Ok(QueryResult::Links(links))
        }
        NamedQuery::DataUsage { stream } => {
            let usage = peer.data_usage(stream).await.map_err(to_err)?;
            Ok(QueryResult::DataUsage { events_count: usage.events_count, bytes_stored: usage.bytes_stored })
        }
    }
}

/// Runs `query` once now, pushes the result, then re-runs and re-pushes it
/// every time a table it reads is touched — until `DeleteLiveQuery`
/// cancels it or `push_tx`'s receiver is dropped.
fn spawn_live_query(peer: Arc<Peer>, id: u64, query: NamedQuery, push_tx: mpsc::UnboundedSender<QueryResult>) -> LiveQueryHandle {
    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    let mut touched_rx = peer.db.touched_tables_subscribe();

    tokio::spawn(async move {
        match run_named_query(&peer, &query).await {
            Ok(result) => {
                if push_tx.send(result).is_err() {
                    return;
                }
            }
            Err(_) => warn!(target: LOG_TARGET, id, "initial live query evaluation failed"),
        }

        loop {
            tokio::select! {
                _ = &mut cancel_rx => break,
                touched = touched_rx.recv() => {
                    let should_rerun = match touched {
                        Ok(touched) => touched.iter().any(|t| query.tables().contains(t)),
                        Err(RecvError::Lagging(_)) => true,
                        Err(RecvError::Closed) => break,
                    };
                    if should_rerun {
                        match run_named_query(&peer, &query).await {
                            Ok(result) => {
                                if push_tx.send(result).is_err() {
                                    break;
                                }
                            }
                            Err(_) => warn!(target: LOG_TARGET, id, "live query re-evaluation failed"),
                        }
                    }
                }
            }
        }
    });

    LiveQueryHandle { _cancel: cancel_tx }
}

async fn dispatch(peer: &Arc<Peer>, live_queries: &mut HashMap<u64, LiveQueryHandle>, request: Request) -> Response {
    match request {
        Request::Initialize => match peer.initialize().await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::Login(callback) => match peer.login(callback).await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::Logout => match peer.logout().await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::GetSessionId => Response::SessionId(peer.session_id()),
        Request::GetProfile => {
            // No separate profile record is modeled in this store (spec
            // §1 Non-goal: "identity issuance"); the session id is the
            // only identity the peer itself knows.
            Response::SessionId(peer.session_id())
        }
        Request::GetMembers { room } => match peer.get_members(room).await {
            Ok(members) => Response::Members(members),
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::CreateSpaceStream { genesis } => match peer.create_space_stream(genesis).await {
            Ok(stream) => Response::StreamDid(stream),
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::ConnectSpaceStream { stream } => {
            peer.connect_space_stream(stream);
            Response::Ack
        }
        Request::ConnectPendingSpaces => match peer.connect_pending_spaces().await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::SetSpaceHandle { handle, stream } => match peer.set_space_handle(&handle, &stream).await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::ResolveSpaceId { handle } => match peer.resolve_space_id(&handle).await {
            Ok(stream) => Response::SpaceId(stream),
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::ResolveHandleForSpace { stream } => match peer.resolve_handle_for_space(&stream).await {
            Ok(handle) => Response::HandleForSpace(handle),
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::CheckSpaceExists { stream } => match peer.check_space_exists(&stream).await {
            Ok(exists) => Response::Exists(exists),
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::GetSpaceInfo { stream } => match run_named_query(peer, &NamedQuery::SpaceInfo { stream }).await {
            Ok(QueryResult::SpaceInfo(info)) => Response::SpaceInfo(info),
            Ok(_) => unreachable!("SpaceInfo query always returns QueryResult::SpaceInfo"),
            Err(response) => response,
        },
        Request::SendEvent { stream, event } => match peer.send_event(&stream, event).await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::SendEventBatch { stream, events } => match peer.send_event_batch(&stream, events).await {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::FetchEvents { stream, room, limit } => {
            match run_named_query(peer, &NamedQuery::FetchEvents { stream, room, limit }).await {
                Ok(QueryResult::Events(events)) => Response::Events(events),
                Ok(_) => unreachable!("FetchEvents query always returns QueryResult::Events"),
                Err(response) => response,
            }
        }
        Request::FetchLinks { room } => match run_named_query(peer, &NamedQuery::FetchLinks { room }).await {
            Ok(QueryResult::Links(links)) => Response::Links(links),
            Ok(_) => unreachable!("FetchLinks query always returns QueryResult::Links"),
            Err(response) => response,
        },
        Request::LazyLoadRoom { stream, room, end, page_size } => {
            match peer.lazy_load_room(&stream, room, end, page_size).await {
                Ok(outcome) => Response::LazyLoad(outcome),
                Err(err) => Response::Error { message: err.to_string() },
            }
        }
        Request::RunQuery { query } => match run_named_query(peer, &query).await {
            Ok(result) => Response::Query(result),
            Err(response) => response,
        },
        Request::CreateLiveQuery { id, query, push_tx } => {
            let handle = spawn_live_query(peer.clone(), id, query, push_tx);
            live_queries.insert(id, handle);
            Response::LiveQueryCreated
        }
        Request::DeleteLiveQuery { id } => {
            live_queries.remove(&id);
            Response::Ack
        }
        Request::SetActiveSqliteWorker { .. } => Response::NotSupported { call: "setActiveSqliteWorker" },
        Request::DangerousCompletelyDestroyDatabase => match peer.db.dangerous_destroy_all().await {
            Ok(()) => {
                warn!(target: LOG_TARGET, "local store destroyed by explicit admin request");
                Response::Ack
            }
            Err(err) => Response::Error { message: err.to_string() },
        },
        Request::UploadToPds { .. } => Response::NotSupported { call: "uploadToPds" },
        Request::Ping => Response::Pong,
        Request::GetDataUsage { stream } => match run_named_query(peer, &NamedQuery::DataUsage { stream }).await {
            Ok(QueryResult::DataUsage { events_count, bytes_stored }) => {
                Response::DataUsage { events_count, bytes_stored }
            }
            Ok(_) => unreachable!("DataUsage query always returns QueryResult::DataUsage"),
            Err(response) => response,
        },
        Request::DumpTable { name } => match peer.db.dump_table(&name).await {
            Ok(Ok(count)) => Response::TableDump(count),
            Ok(Err(err)) => Response::Error { message: err.to_string() },
            Err(err) => Response::Error { message: err.to_string() },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::InMemorySessionStore;
    use crate::peer::Peer;

    struct NoopIdentityProvider;

    #[async_trait::async_trait]
    impl crate::identity::IdentityProvider for NoopIdentityProvider {
        async fn restore(&self, _user: &UserDid) -> crate::identity::IdentityProviderResult<()> {
            Ok(())
        }

        async fn login_with_test_credentials(
            &self,
            handle: &str,
            _app_password: &str,
        ) -> crate::identity::IdentityProviderResult<UserDid> {
            Ok(format!("did:plc:{handle}").parse().expect("ascii, non-empty"))
        }

        async fn read_personal_stream_record(
            &self,
            _user: &UserDid,
        ) -> crate::identity::IdentityProviderResult<Option<crate::identity::PersonalStreamRecord>> {
            Ok(None)
        }

        async fn write_personal_stream_record(
            &self,
            _user: &UserDid,
            _record: &crate::identity::PersonalStreamRecord,
        ) -> crate::identity::IdentityProviderResult<()> {
            Ok(())
        }

        async fn read_space_handle_record(
            &self,
            _handle: &Handle,
        ) -> crate::identity::IdentityProviderResult<Option<crate::identity::SpaceHandleRecord>> {
            Ok(None)
        }

        async fn write_space_handle_record(
            &self,
            _handle: &Handle,
            _record: &crate::identity::SpaceHandleRecord,
        ) -> crate::identity::IdentityProviderResult<()> {
            Ok(())
        }
    }

    async fn test_peer() -> Arc<Peer> {
        Peer::builder(crate::config::Config::new("https://leaf.example"))
            .identity_provider(Arc::new(NoopIdentityProvider))
            .session_store(Arc::new(InMemorySessionStore::default()))
            .build()
            .await
            .expect("peer builds")
    }

    #[tokio::test]
    async fn ping_responds_pong() {
        let peer = test_peer().await;
        let port = PeerPort::spawn(peer);
        assert!(matches!(port.call(Request::Ping).await, Response::Pong));
    }

    #[tokio::test]
    async fn get_session_id_before_auth_is_none() {
        let peer = test_peer().await;
        let port = PeerPort::spawn(peer);
        assert!(matches!(port.call(Request::GetSessionId).await, Response::SessionId(None)));
    }

    #[tokio::test]
    async fn live_query_pushes_on_create_and_on_touch() {
        let peer = test_peer().await;
        let stream: StreamDid = "did:web:test-space".parse().expect("ascii, non-empty");
        let port = PeerPort::spawn(peer.clone());

        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        let response = port
            .call(Request::CreateLiveQuery {
                id: 1,
                query: NamedQuery::SpaceInfo { stream: stream.clone() },
                push_tx,
            })
            .await;
        assert!(matches!(response, Response::LiveQueryCreated));

        let initial = push_rx.recv().await.expect("initial push");
        assert!(matches!(initial, QueryResult::SpaceInfo(None)));

        // Bypass the write path's network/auth requirements and apply a
        // real event directly through the materializer, the same
        // component `connect_and_drain` feeds in production.
        let materializer = spaces_store::Materializer::new(peer.db.clone());
        let event = Event::new(
            Ulid::generate(),
            None,
            spaces_core::event::EventVariant::AddAdmin(spaces_core::event::AddAdmin {
                user: "did:plc:admin".parse().expect("ascii, non-empty"),
            }),
        );
        materializer.apply_batch(&stream, vec![event]).await.expect("applies");

        let updated = push_rx.recv().await.expect("push on touch");
        assert!(matches!(updated, QueryResult::SpaceInfo(Some(_))));
    }
}
