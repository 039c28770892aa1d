//! Wires the embedded [`spaces_peer::Peer`], the bridge's own
//! [`Repository`], and a `serenity` gateway connection together into one
//! running bridge (spec §4.7).
//!
//! One [`Bridge`] exists per (guild, space) pair; [`BridgeOrchestrator`]
//! owns the shared serenity client and dispatches gateway events to the
//! right `Bridge` by guild id, and drains each `Bridge`'s space-side event
//! stream to drive egress. Grounded on the teacher's `Client`/`ClientHandle`
//! "one task per concern, `Arc`-shared handle" shape (`rostra-client/src/client.rs`),
//! generalized from one peer to a small registry of them.

use std::collections::HashMap;
use std::sync::Arc;

use snafu::ResultExt as _;
use spaces_core::id::StreamDid;
use spaces_core::Ulid;
use spaces_peer::Peer;
use spaces_store::materializer::EventResult;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::egress::{plan_egress, EgressDecision};
use crate::error::{BridgeError, BridgeResult, SendEventSnafu};
use crate::ingest::Translated;
use crate::repository::Repository;
use crate::tables::BridgeMode;

pub const LOG_TARGET: &str = "spaces::bridge::orchestrator";

/// One guild-to-space bridge: the space-side [`Peer`] connection and the
/// Discord guild it mirrors into/out of.
pub struct Bridge {
    pub guild_id: u64,
    pub stream: StreamDid,
    pub mode: BridgeMode,
    pub peer: Arc<Peer>,
}

/// Owns every active [`Bridge`] plus the shared repository, and runs one
/// egress-drain task per bridge.
pub struct BridgeOrchestrator {
    repo: Arc<Repository>,
    http: Arc<serenity::http::Http>,
    bridges: RwLock<HashMap<u64, Arc<Bridge>>>,
}

impl BridgeOrchestrator {
    pub fn new(repo: Arc<Repository>, http: Arc<serenity::http::Http>) -> Self {
        Self { repo, http, bridges: RwLock::new(HashMap::new()) }
    }

    pub async fn bridge_for_guild(&self, guild_id: u64) -> Option<Arc<Bridge>> {
        self.bridges.read().await.get(&guild_id).cloned()
    }

    /// Registers a bridge and spawns its egress-drain task (spec §4.7
    /// "Egress"). Idempotent: replacing an existing guild's bridge drops
    /// the old `Arc`, which stops its drain loop once the `Peer` itself is
    /// no longer referenced elsewhere.
    #[instrument(skip(self, peer), fields(%guild_id, %stream))]
    pub async fn register(&self, guild_id: u64, stream: StreamDid, mode: BridgeMode, peer: Arc<Peer>) {
        let bridge = Arc::new(Bridge { guild_id, stream, mode, peer });
        self.bridges.write().await.insert(guild_id, bridge.clone());
        self.spawn_egress_drain(bridge);
    }

    pub async fn unregister(&self, guild_id: u64) {
        self.bridges.write().await.remove(&guild_id);
    }

    /// Subscribes to the space's materialized-event stream and pushes
    /// every applied event through [`plan_egress`], sending via the
    /// shared HTTP client on a match (spec §4.7 "Egress").
    fn spawn_egress_drain(&self, bridge: Arc<Bridge>) {
        let repo = self.repo.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            let mut events = bridge.peer.db.new_event_subscribe();
            loop {
                let outcome = match events.recv().await {
                    Ok(outcome) => outcome,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: LOG_TARGET, guild_id = bridge.guild_id, skipped, "egress drain lagged, some events were skipped");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if outcome.result != EventResult::Applied || outcome.stream != bridge.stream {
                    continue;
                }
                if let Err(err) = drain_one(&repo, &http, &bridge, outcome.event_id).await {
                    warn!(target: LOG_TARGET, guild_id = bridge.guild_id, event_id = %outcome.event_id, %err, "egress failed");
                }
            }
            debug!(target: LOG_TARGET, guild_id = bridge.guild_id, "egress drain stopped");
        });
    }
}

async fn drain_one(
    repo: &Repository,
    http: &serenity::http::Http,
    bridge: &Bridge,
    event_id: Ulid,
) -> BridgeResult<()> {
    let Some(event) = bridge
        .peer
        .fetch_event(event_id)
        .await
        .map_err(|e| BridgeError::Config { message: e.to_string() })?
    else {
        return Ok(());
    };

    let decision = plan_egress(repo, &event).await.map_err(|e| BridgeError::Config { message: e.to_string() })?;
    match decision {
        EgressDecision::Skip => Ok(()),
        EgressDecision::AlreadyPresent { discord_message_id } => {
            register_event_mapping(repo, &event, discord_message_id).await
        }
        EgressDecision::Send(action) => {
            if let Some(discord_message_id) = crate::discord::send_outbound(http, repo, action).await? {
                register_event_mapping(repo, &event, discord_message_id).await?;
            }
            Ok(())
        }
    }
}

async fn register_event_mapping(repo: &Repository, event: &spaces_core::Event, discord_message_id: u64) -> BridgeResult<()> {
    repo.insert_mapping(crate::tables::msg_key(discord_message_id), event.id)
        .await
        .map_err(|e| BridgeError::Config { message: e.to_string() })
}

/// Ingests one already-translated occurrence: sends the event to the
/// space (if there is one to send) and registers the mapping once it has
/// been accepted, so a re-delivered Discord event is idempotent even
/// across a bridge restart (spec §4.7 "Each translation is idempotent via
/// the mapping table").
#[instrument(skip(repo, peer, translated), fields(%stream))]
pub async fn apply_ingest(repo: &Repository, peer: &Peer, stream: &StreamDid, translated: Translated) -> BridgeResult<()> {
    let Translated { event, discord_key, roomy_id } = translated;
    let Some(event) = event else { return Ok(()) };

    peer.send_event(stream, event).await.context(SendEventSnafu { space: stream.clone() })?;
    repo.insert_mapping(discord_key, roomy_id)
        .await
        .map_err(|e| BridgeError::Config { message: e.to_string() })?;
    info!(target: LOG_TARGET, %roomy_id, "ingested discord occurrence");
    Ok(())
}
