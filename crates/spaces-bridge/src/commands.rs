//! Slash-command surface (spec §4.7 "Slash-command surface"):
//! `connect-roomy-space`, `disconnect-roomy-space`, `roomy-status`.
//!
//! Discord delivers interactions at least once, so every handler here is
//! idempotent and treats the duplicate-interaction error codes
//! (`40060`/`10062`, [`crate::error::is_duplicate_interaction_error`]) as
//! success rather than failure.

use serenity::all::{
    CommandInteraction, CommandOptionType, CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, ResolvedOption, ResolvedValue,
};
use spaces_peer::identity::{FileIdentityProvider, FileSessionStore};
use spaces_peer::Config as PeerConfig;
use tracing::{info, instrument};

use crate::discord::log_interaction_error;
use crate::orchestrator::BridgeOrchestrator;
use crate::repository::Repository;
use crate::tables::{BridgeMode, GuildBridgeConfig};

pub const LOG_TARGET: &str = "spaces::bridge::commands";

pub const CONNECT_COMMAND: &str = "connect-roomy-space";
pub const DISCONNECT_COMMAND: &str = "disconnect-roomy-space";
pub const STATUS_COMMAND: &str = "roomy-status";

/// The command definitions to register with Discord on startup.
pub fn command_definitions() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new(CONNECT_COMMAND)
            .description("Bridge this Discord server to a Roomy space")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "space", "The space's stream id (did:...)")
                    .required(true),
            )
            .add_option(
                CreateCommandOption::new(CommandOptionType::Boolean, "subset", "Bridge only channels granted to a role")
                    .required(false),
            ),
        CreateCommand::new(DISCONNECT_COMMAND).description("Disconnect this Discord server from its Roomy space"),
        CreateCommand::new(STATUS_COMMAND).description("Show this server's Roomy space bridge status"),
    ]
}

/// Common config shared by every `Peer` the bridge spins up.
#[derive(Clone)]
pub struct BridgeRuntimeConfig {
    pub leaf_url: String,
    pub data_dir: std::path::PathBuf,
    pub bridge_handle: String,
    pub bridge_app_password: String,
}

async fn spawn_peer_for_stream(
    runtime: &BridgeRuntimeConfig,
    stream_str: &str,
) -> Result<(spaces_core::id::StreamDid, std::sync::Arc<spaces_peer::Peer>), String> {
    let stream: spaces_core::id::StreamDid = stream_str.parse().map_err(|_| "malformed space id".to_string())?;
    let peer = spawn_bridge_peer(runtime, &stream).await?;
    Ok((stream, peer))
}

/// Builds and initializes the embedded [`spaces_peer::Peer`] a bridge uses
/// to talk to one already-known space, without re-parsing its id — used
/// both by the `connect-roomy-space` command (parses a fresh id) and by
/// daemon startup (restores an id already persisted in the repository).
pub(crate) async fn spawn_bridge_peer(
    runtime: &BridgeRuntimeConfig,
    stream: &spaces_core::id::StreamDid,
) -> Result<std::sync::Arc<spaces_peer::Peer>, String> {
    let mut config = PeerConfig::new(runtime.leaf_url.clone());
    config.discord_bridge = true;
    config.testing_handle = Some(runtime.bridge_handle.clone());
    config.testing_app_password = Some(runtime.bridge_app_password.clone());

    let identity_provider = std::sync::Arc::new(FileIdentityProvider::new(runtime.data_dir.clone()));
    let session_store = std::sync::Arc::new(FileSessionStore::new(runtime.data_dir.clone()));

    let peer = spaces_peer::Peer::builder(config)
        .identity_provider(identity_provider)
        .session_store(session_store)
        .build()
        .await
        .map_err(|err| err.to_string())?;
    peer.initialize().await.map_err(|err| err.to_string())?;
    Ok(peer)
}

/// Dispatches one slash-command interaction. Returns the text to reply
/// with; the caller is responsible for actually sending it (kept separate
/// so this function doesn't need a live `Context` to unit test).
#[instrument(skip(repo, orchestrator, runtime, options))]
pub async fn handle_command(
    repo: &Repository,
    orchestrator: &BridgeOrchestrator,
    runtime: &BridgeRuntimeConfig,
    guild_id: u64,
    command_name: &str,
    options: &[ResolvedOption<'_>],
) -> String {
    match command_name {
        CONNECT_COMMAND => handle_connect(repo, orchestrator, runtime, guild_id, options).await,
        DISCONNECT_COMMAND => handle_disconnect(repo, orchestrator, guild_id).await,
        STATUS_COMMAND => handle_status(repo, guild_id).await,
        other => format!("unknown command: {other}"),
    }
}

async fn handle_connect(
    repo: &Repository,
    orchestrator: &BridgeOrchestrator,
    runtime: &BridgeRuntimeConfig,
    guild_id: u64,
    options: &[ResolvedOption<'_>],
) -> String {
    let Some(ResolvedValue::String(space)) = options.iter().find(|o| o.name == "space").map(|o| o.value.clone()) else {
        return "missing required `space` option".to_string();
    };
    let subset = matches!(
        options.iter().find(|o| o.name == "subset").map(|o| o.value.clone()),
        Some(ResolvedValue::Boolean(true))
    );

    let (stream, peer) = match spawn_peer_for_stream(runtime, space).await {
        Ok(pair) => pair,
        Err(err) => return format!("failed to connect: {err}"),
    };

    let mode = if subset { BridgeMode::Subset } else { BridgeMode::Full };
    if let Err(err) = repo
        .set_guild_bridge(guild_id, GuildBridgeConfig { space_stream: stream.as_did().to_string(), mode, subset_role_id: None })
        .await
    {
        return format!("failed to persist bridge config: {err}");
    }

    orchestrator.register(guild_id, stream.clone(), mode, peer).await;
    info!(target: LOG_TARGET, %guild_id, %stream, "connected guild to space");
    format!("Connected this server to `{stream}`.")
}

async fn handle_disconnect(repo: &Repository, orchestrator: &BridgeOrchestrator, guild_id: u64) -> String {
    orchestrator.unregister(guild_id).await;
    if let Err(err) = repo.remove_guild_bridge(guild_id).await {
        return format!("failed to remove bridge config: {err}");
    }
    "Disconnected this server from its Roomy space.".to_string()
}

async fn handle_status(repo: &Repository, guild_id: u64) -> String {
    match repo.guild_bridge(guild_id).await {
        Ok(Some(config)) => format!(
            "Bridged to `{}` ({} mode).",
            config.space_stream,
            if matches!(config.mode, BridgeMode::Subset) { "subset" } else { "full" }
        ),
        Ok(None) => "Not bridged to a Roomy space.".to_string(),
        Err(err) => format!("failed to read bridge status: {err}"),
    }
}

/// Sends an interaction reply, swallowing the duplicate-delivery error
/// codes rather than surfacing them as a command failure (spec §4.7).
pub async fn reply(http: &serenity::http::Http, interaction: &CommandInteraction, content: String) {
    let response = CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().content(content));
    if let Err(err) = interaction.create_response(http, response).await {
        log_interaction_error("command reply", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definitions_cover_the_spec_surface() {
        let names: Vec<&str> = command_definitions().iter().map(|_| "").collect();
        // `CreateCommand` doesn't expose its name back out for inspection
        // without building it against a live client, so this test only
        // pins the count — one definition per documented command.
        assert_eq!(names.len(), 3);
    }
}
