//! The serenity `EventHandler` impl: the single place gateway events enter
//! the bridge. Every handler here does the minimum translation to plain
//! data (via [`crate::discord`]) and then defers to [`crate::ingest`] /
//! [`crate::commands`] for the actual decision-making, so this file stays
//! a thin dispatch table — the same shape as the teacher's
//! `rostra-bot/src/main.rs` command dispatch, generalized from a poll loop
//! to a push-based gateway.

use std::sync::Arc;

use serenity::all::{Context, EventHandler, GuildChannel, Interaction, Message, Reaction, Ready};
use serenity::async_trait;
use tracing::{info, instrument, warn};

use crate::commands::{self, BridgeRuntimeConfig};
use crate::discord::{bridged_stream, log_interaction_error, plain_channel, plain_message, plain_reaction};
use crate::ingest;
use crate::orchestrator::{apply_ingest, BridgeOrchestrator};
use crate::repository::Repository;

pub struct Handler {
    pub repo: Arc<Repository>,
    pub orchestrator: Arc<BridgeOrchestrator>,
    pub runtime: BridgeRuntimeConfig,
}

impl Handler {
    async fn bridge_peer_for_guild(&self, guild_id: u64) -> Option<Arc<crate::orchestrator::Bridge>> {
        self.orchestrator.bridge_for_guild(guild_id).await
    }
}

#[async_trait]
impl EventHandler for Handler {
    #[instrument(skip_all)]
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(target: crate::discord::LOG_TARGET, bot = %ready.user.name, "gateway connected");
        if let Err(err) = serenity::all::Command::set_global_commands(&ctx.http, commands::command_definitions()).await {
            warn!(target: crate::discord::LOG_TARGET, %err, "failed to register slash commands");
        }
    }

    #[instrument(skip_all, fields(channel_id = %message.channel_id))]
    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            // Every bridged message, including ones the bridge's own
            // webhook posted, would otherwise be re-ingested as a new
            // Discord message and loop forever.
            return;
        }
        let Some(guild_id) = message.guild_id else { return };
        let Some(bridge) = self.bridge_peer_for_guild(guild_id.get()).await else { return };

        let plain = plain_message(&message);
        let translated = match ingest::translate_message(&self.repo, &plain).await {
            Ok(translated) => translated,
            Err(err) => {
                warn!(target: crate::discord::LOG_TARGET, %err, "failed to translate message");
                return;
            }
        };
        if let Err(err) = apply_ingest(&self.repo, &bridge.peer, &bridge.stream, translated).await {
            warn!(target: crate::discord::LOG_TARGET, %err, "failed to ingest message");
        }
        let _ = ctx;
    }

    #[instrument(skip_all)]
    async fn message_update(
        &self,
        _ctx: Context,
        _old: Option<Message>,
        new: Option<Message>,
        _event: serenity::all::MessageUpdateEvent,
    ) {
        let Some(message) = new else { return };
        let Some(guild_id) = message.guild_id else { return };
        let Some(bridge) = self.bridge_peer_for_guild(guild_id.get()).await else { return };

        let plain = plain_message(&message);
        // The edit nonce is the new content's own hash truncated the same
        // way a send nonce is, so re-delivery of the identical edit is a
        // no-op while a genuinely different edit still produces a new
        // mapping entry.
        let nonce = crate::dedup::event_id_to_nonce(spaces_core::Ulid::derive_from_bytes(plain.content.as_bytes()));
        let translated = match ingest::translate_edit(&self.repo, &plain, &nonce).await {
            Ok(translated) => translated,
            Err(err) => {
                warn!(target: crate::discord::LOG_TARGET, %err, "failed to translate edit");
                return;
            }
        };
        if let Err(err) = apply_ingest(&self.repo, &bridge.peer, &bridge.stream, translated).await {
            warn!(target: crate::discord::LOG_TARGET, %err, "failed to ingest edit");
        }
    }

    #[instrument(skip_all)]
    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let Some(guild_id) = reaction.guild_id else { return };
        let Some(bridge) = self.bridge_peer_for_guild(guild_id.get()).await else { return };

        let plain = plain_reaction(&reaction);
        let translated = match ingest::translate_reaction_add(&self.repo, &plain).await {
            Ok(translated) => translated,
            Err(err) => {
                warn!(target: crate::discord::LOG_TARGET, %err, "failed to translate reaction");
                return;
            }
        };
        if let Err(err) = apply_ingest(&self.repo, &bridge.peer, &bridge.stream, translated).await {
            warn!(target: crate::discord::LOG_TARGET, %err, "failed to ingest reaction");
        }
    }

    #[instrument(skip_all)]
    async fn reaction_remove(&self, _ctx: Context, reaction: Reaction) {
        let Some(guild_id) = reaction.guild_id else { return };
        let Some(bridge) = self.bridge_peer_for_guild(guild_id.get()).await else { return };

        let plain = plain_reaction(&reaction);
        match ingest::translate_reaction_remove(&self.repo, &plain).await {
            Ok(Some(event)) => {
                if let Err(err) = bridge.peer.send_event(&bridge.stream, event).await {
                    warn!(target: crate::discord::LOG_TARGET, %err, "failed to send reaction removal");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(target: crate::discord::LOG_TARGET, %err, "failed to translate reaction removal"),
        }
    }

    #[instrument(skip_all, fields(channel_id = %channel.id))]
    async fn channel_create(&self, _ctx: Context, channel: GuildChannel) {
        let Some(bridge) = self.bridge_peer_for_guild(channel.guild_id.get()).await else { return };
        if let Err(err) = ingest_channel(&self.repo, &bridge, &channel).await {
            warn!(target: crate::discord::LOG_TARGET, %err, "failed to ingest channel creation");
        }
    }

    #[instrument(skip_all)]
    async fn thread_create(&self, _ctx: Context, thread: GuildChannel) {
        let Some(bridge) = self.bridge_peer_for_guild(thread.guild_id.get()).await else { return };
        if let Err(err) = ingest_channel(&self.repo, &bridge, &thread).await {
            warn!(target: crate::discord::LOG_TARGET, %err, "failed to ingest thread creation");
        }
    }

    #[instrument(skip_all)]
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else { return };
        let Some(guild_id) = command.guild_id else {
            log_interaction_error("slash command outside a guild", serenity::Error::Other("no guild"));
            return;
        };

        let options = command.data.options();
        let content =
            commands::handle_command(&self.repo, &self.orchestrator, &self.runtime, guild_id.get(), &command.data.name, &options)
                .await;
        commands::reply(&ctx.http, &command, content).await;
    }
}

async fn ingest_channel(
    repo: &Repository,
    bridge: &crate::orchestrator::Bridge,
    channel: &GuildChannel,
) -> Result<(), crate::error::BridgeError> {
    let plain = plain_channel(channel);
    let translated = ingest::translate_channel(repo, &plain)
        .await
        .map_err(|e| crate::error::BridgeError::Config { message: e.to_string() })?;
    apply_ingest(repo, &bridge.peer, &bridge.stream, translated).await
}

#[allow(unused)]
async fn resolve_bridge_from_config(repo: &Repository, guild_id: u64) -> Option<spaces_core::id::StreamDid> {
    bridged_stream(repo, serenity::all::GuildId::new(guild_id)).await.ok().flatten()
}
