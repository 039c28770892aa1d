//! Bridge daemon entry point (spec §4.7, §6 "Bridge CLI/commands").
//!
//! Grounded on the teacher's `rostra-bot/src/main.rs`: a `clap::Parser`
//! `Opts`, a `#[snafu::report] #[tokio::main]` entry, and an
//! init-then-run-forever shape — generalized from a scrape-and-publish
//! poll loop to a serenity gateway client plus per-guild bridges restored
//! from the repository on startup.

mod commands;
mod dedup;
mod discord;
mod egress;
mod error;
mod gateway;
mod ingest;
mod orchestrator;
mod repository;
mod tables;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serenity::all::GatewayIntents;
use snafu::{FromString, ResultExt, Snafu, Whatever};
use spaces_core::id::StreamDid;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::BridgeRuntimeConfig;
use crate::error::BridgeError;
use crate::gateway::Handler;
use crate::orchestrator::BridgeOrchestrator;
use crate::repository::Repository;

pub const PROJECT_NAME: &str = "spaces-bridge";
pub const LOG_TARGET: &str = "spaces::bridge::main";

type WhateverResult<T> = std::result::Result<T, Whatever>;

#[derive(Debug, Snafu)]
pub enum DaemonError {
    #[snafu(display("bridge error: {source}"))]
    Bridge { source: BridgeError },
    #[snafu(display("discord gateway error: {source}"))]
    Serenity { source: serenity::Error },
    #[snafu(display("miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}
pub type DaemonResult<T> = std::result::Result<T, DaemonError>;

/// Discord↔space bridge daemon (spec §4.7).
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Discord bot token.
    #[arg(long, env = "SPACES_BRIDGE_DISCORD_TOKEN")]
    pub discord_token: String,

    /// Log server base URL used for every space the bridge connects to.
    #[arg(long, env = "SPACES_LEAF_URL")]
    pub leaf_url: String,

    /// Handle the bridge authenticates as against every space it joins
    /// (spec §6 `testingHandle`, used here as the bridge's own identity).
    #[arg(long, env = "SPACES_BRIDGE_HANDLE")]
    pub bridge_handle: String,
    #[arg(long, env = "SPACES_BRIDGE_APP_PASSWORD")]
    pub bridge_app_password: String,

    /// Directory for the bridge's own repository (identifier mappings,
    /// dedup index) and each bridged space's local store.
    #[arg(long, env = "SPACES_BRIDGE_DATA_DIR")]
    pub data_dir: PathBuf,
}

#[snafu::report]
#[tokio::main]
async fn main() -> DaemonResult<()> {
    init_logging().context(WhateverSnafu)?;
    let opts = Opts::parse();

    let repo = Arc::new(Repository::open(opts.data_dir.join("bridge.redb")).await.map_err(|source| {
        DaemonError::Bridge { source: BridgeError::Config { message: source.to_string() } }
    })?);

    let http = Arc::new(serenity::http::Http::new(&opts.discord_token));
    let orchestrator = Arc::new(BridgeOrchestrator::new(repo.clone(), http.clone()));

    let runtime = BridgeRuntimeConfig {
        leaf_url: opts.leaf_url.clone(),
        data_dir: opts.data_dir.clone(),
        bridge_handle: opts.bridge_handle.clone(),
        bridge_app_password: opts.bridge_app_password.clone(),
    };

    restore_bridges(&repo, &orchestrator, &runtime).await;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = Handler { repo, orchestrator, runtime };

    let mut client = serenity::Client::builder(&opts.discord_token, intents)
        .event_handler(handler)
        .await
        .context(SerenitySnafu)?;

    info!(target: LOG_TARGET, "bridge daemon starting");
    client.start().await.context(SerenitySnafu)?;
    Ok(())
}

/// Reconnects every (guild, space) pair the repository remembers from a
/// previous run, so a restart doesn't require re-running
/// `connect-roomy-space` (spec §4.7 "Backfill": "On startup: ... materialize
/// the space's event log").
async fn restore_bridges(repo: &Arc<Repository>, orchestrator: &Arc<BridgeOrchestrator>, runtime: &BridgeRuntimeConfig) {
    let guild_bridges = match repo.all_guild_bridges().await {
        Ok(bridges) => bridges,
        Err(err) => {
            warn!(target: LOG_TARGET, %err, "failed to list persisted guild bridges");
            return;
        }
    };

    for (guild_id, config) in guild_bridges {
        let Ok(stream) = config.space_stream.parse::<StreamDid>() else {
            warn!(target: LOG_TARGET, %guild_id, stream = %config.space_stream, "persisted bridge has malformed space id");
            continue;
        };
        match crate::commands::spawn_bridge_peer(runtime, &stream).await {
            Ok(peer) => {
                orchestrator.register(guild_id, stream.clone(), config.mode, peer).await;
                info!(target: LOG_TARGET, %guild_id, %stream, "restored bridge from previous run");
            }
            Err(err) => {
                warn!(target: LOG_TARGET, %guild_id, %stream, %err, "failed to restore bridge");
            }
        }
    }
}

pub fn init_logging() -> WhateverResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy())
        .try_init()
        .map_err(|_| Whatever::without_source("Failed to initialize logging".to_string()))?;
    Ok(())
}
