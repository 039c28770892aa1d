//! The serenity-facing half of the bridge: gateway event handling
//! (ingest) and REST/webhook calls (egress), spec §4.7.
//!
//! Kept thin on purpose — every decision (translate? skip? dedup?) is made
//! by [`crate::ingest`]/[`crate::egress`] against plain data, so this
//! module's job is only to pull plain data out of serenity's types and to
//! push outbound actions through serenity's HTTP client with retry.
//! Grounded on the teacher's separation between `scraper.rs` (talks to the
//! network) and `dedup.rs`/`database.rs` (pure decision-making) in
//! `rostra-bot`.

use std::time::Duration;

use serenity::all::{
    ChannelId, ChannelType, CreateWebhook, EditWebhookMessage, ExecuteWebhook, GuildId, MessageId, Reaction, Webhook,
    WebhookId,
};
use snafu::ResultExt as _;
use spaces_core::id::StreamDid;
use tracing::{debug, instrument, warn};

use crate::egress::OutboundAction;
use crate::error::{
    is_duplicate_interaction_error, is_not_found, is_server_error, rate_limit_retry_after, BridgeError, BridgeResult,
    GatewaySnafu, WebhookRetriesExhaustedSnafu,
};
use crate::ingest::{DiscordChannel, DiscordMessage, DiscordReaction};
use crate::repository::Repository;
use crate::tables::WebhookRecord;

pub const LOG_TARGET: &str = "spaces::bridge::discord";

/// Maximum retries for a single webhook call before giving up and logging
/// (spec §4.7 "Retry/rate-limit").
const MAX_WEBHOOK_RETRIES: usize = 5;
/// Base delay for the 5xx exponential backoff; doubled per attempt.
const SERVER_ERROR_BASE_BACKOFF: Duration = Duration::from_millis(200);

/// Translates a serenity `Message` into the plain [`DiscordMessage`]
/// `ingest` translates from. A reply's target is read from
/// `message.referenced_message` when Discord includes it inline, falling
/// back to `message_reference` alone when it doesn't (e.g. a reply to a
/// message the bot hasn't cached).
pub fn plain_message(message: &serenity::all::Message) -> DiscordMessage {
    let reply_to_message_id = message
        .referenced_message
        .as_ref()
        .map(|m| m.id.get())
        .or_else(|| message.message_reference.as_ref().and_then(|r| r.message_id).map(|id| id.get()));
    DiscordMessage {
        message_id: message.id.get(),
        channel_id: message.channel_id.get(),
        author_id: message.author.id.get(),
        content: message.content.clone(),
        reply_to_message_id,
    }
}

pub fn plain_reaction(reaction: &Reaction) -> DiscordReaction {
    DiscordReaction {
        message_id: reaction.message_id.get(),
        user_id: reaction.user_id.map(|id| id.get()).unwrap_or_default(),
        emoji: reaction.emoji.to_string(),
    }
}

pub fn plain_channel(channel: &serenity::all::GuildChannel) -> DiscordChannel {
    DiscordChannel {
        channel_id: channel.id.get(),
        name: channel.name.clone(),
        parent_category_id: channel.parent_id.map(|id| id.get()),
        thread_parent_id: (channel.kind == ChannelType::PublicThread || channel.kind == ChannelType::PrivateThread)
            .then(|| channel.parent_id.map(|id| id.get()))
            .flatten(),
        is_category: channel.kind == ChannelType::Category,
    }
}

/// Fetches (creating if absent) the channel's bridge webhook, refreshing
/// the cache on a 404 (spec §4.7: "Webhook tokens are persisted ...
/// refreshed on 404").
#[instrument(skip(http, repo), fields(%channel_id))]
async fn ensure_webhook(
    http: &serenity::http::Http,
    repo: &Repository,
    channel_id: u64,
) -> BridgeResult<Webhook> {
    let cached = repo.webhook_for_channel(channel_id).await.map_err(|e| BridgeError::Config { message: e.to_string() })?;
    if let Some(cached) = cached {
        if let Ok(webhook) = http.get_webhook_with_token(WebhookId::new(cached.webhook_id), &cached.token).await {
            return Ok(webhook);
        }
        // Stale: fall through and recreate.
        repo.clear_webhook_for_channel(channel_id)
            .await
            .map_err(|e| BridgeError::Config { message: e.to_string() })?;
    }

    let webhook = http
        .create_webhook(ChannelId::new(channel_id), &CreateWebhook::new("roomy-bridge"), None)
        .await
        .context(GatewaySnafu)?;
    let token = webhook.token.clone().unwrap_or_default();
    repo.set_webhook_for_channel(channel_id, WebhookRecord { webhook_id: webhook.id.get(), token })
        .await
        .map_err(|e| BridgeError::Config { message: e.to_string() })?;
    Ok(webhook)
}

/// Sends one outbound action through a webhook, retrying 5xx/429 with
/// exponential backoff and refreshing the webhook once on 404 (spec §4.7
/// "Retry/rate-limit"). Returns the Discord message id a [`OutboundAction::SendMessage`]
/// created, so the caller can register the mapping; other actions act on
/// an already-mapped message and return `None`.
#[instrument(skip(http, repo), fields(channel_id = action_channel_id(&action)))]
pub async fn send_outbound(http: &serenity::http::Http, repo: &Repository, action: OutboundAction) -> BridgeResult<Option<u64>> {
    let channel_id = action_channel_id(&action);

    let attempt = || async {
        let webhook = ensure_webhook(http, repo, channel_id).await?;
        let token = webhook.token.as_deref().unwrap_or_default();
        let created_message_id = match &action {
            OutboundAction::SendMessage { nonce, body, .. } => {
                let builder = ExecuteWebhook::new().content(body.clone()).username("roomy-bridge");
                // serenity's `ExecuteWebhook` has no first-class nonce field;
                // Discord's webhook-execute endpoint doesn't accept one
                // either (nonces are a client-message-create concept), so
                // de-duplication for webhook sends relies entirely on the
                // mapping table and content-hash index (spec §4.7 step 2-3)
                // rather than on Discord's own nonce mechanism.
                let _ = nonce;
                let sent = http
                    .execute_webhook(webhook.id, None, token, true, vec![], &builder)
                    .await
                    .context(GatewaySnafu)?;
                sent.map(|message| message.id.get())
            }
            OutboundAction::EditMessage { discord_message_id, body, .. } => {
                let builder = EditWebhookMessage::new().content(body.clone());
                http.edit_webhook_message(webhook.id, None, token, MessageId::new(*discord_message_id), &builder)
                    .await
                    .context(GatewaySnafu)?;
                None
            }
            OutboundAction::DeleteMessage { discord_message_id, .. } => {
                http.delete_webhook_message(webhook.id, None, token, MessageId::new(*discord_message_id))
                    .await
                    .context(GatewaySnafu)?;
                None
            }
            OutboundAction::AddReaction { discord_message_id, emoji, .. } => {
                http.create_reaction(
                    ChannelId::new(channel_id),
                    MessageId::new(*discord_message_id),
                    &emoji.clone().into(),
                )
                .await
                .context(GatewaySnafu)?;
                None
            }
        };
        Ok::<Option<u64>, BridgeError>(created_message_id)
    };

    // Retries 5xx with exponential backoff and 429 by waiting exactly the
    // Discord-supplied `Retry-After` (spec §4.7 "Retry/rate-limit"): a
    // generic exponential schedule would ignore how long Discord actually
    // wants us to wait and can retry too early.
    let mut result = attempt().await;
    for attempt_no in 0..MAX_WEBHOOK_RETRIES {
        let err = match &result {
            Err(err) => err,
            Ok(_) => break,
        };
        let BridgeError::Gateway { source } = err else {
            break;
        };
        let backoff = if let Some(retry_after) = rate_limit_retry_after(source) {
            Duration::from_secs_f64(retry_after)
        } else if is_server_error(source) {
            SERVER_ERROR_BASE_BACKOFF.saturating_mul(1u32 << attempt_no)
        } else {
            break;
        };
        warn!(target: LOG_TARGET, %err, ?backoff, attempt = attempt_no, "retrying webhook call");
        tokio::time::sleep(backoff).await;
        result = attempt().await;
    }

    match result {
        Ok(created) => Ok(created),
        Err(BridgeError::Gateway { source }) if is_not_found(&source) => {
            repo.clear_webhook_for_channel(channel_id)
                .await
                .map_err(|e| BridgeError::Config { message: e.to_string() })?;
            WebhookRetriesExhaustedSnafu { channel_id }.fail()
        }
        Err(other) => Err(other),
    }
}

fn action_channel_id(action: &OutboundAction) -> u64 {
    match action {
        OutboundAction::SendMessage { channel_id, .. }
        | OutboundAction::EditMessage { channel_id, .. }
        | OutboundAction::DeleteMessage { channel_id, .. }
        | OutboundAction::AddReaction { channel_id, .. } => *channel_id,
    }
}

/// Subset-mode channel visibility (spec §4.7 "Subset mode"): a channel is
/// bridged only if the per-bridge role's `VIEW_CHANNEL: Allow` overwrite is
/// present on it.
pub fn channel_is_in_subset(channel: &serenity::all::GuildChannel, subset_role_id: u64) -> bool {
    channel.permission_overwrites.iter().any(|overwrite| {
        matches!(overwrite.kind, serenity::all::PermissionOverwriteType::Role(id) if id.get() == subset_role_id)
            && overwrite.allow.contains(serenity::all::Permissions::VIEW_CHANNEL)
    })
}

/// Resolves the space stream a guild is bridged to, or `None` if the guild
/// has no configured bridge (spec §4.7 "Slash-command surface").
pub async fn bridged_stream(repo: &Repository, guild_id: GuildId) -> BridgeResult<Option<StreamDid>> {
    let Some(config) = repo.guild_bridge(guild_id.get()).await.map_err(|e| BridgeError::Config { message: e.to_string() })?
    else {
        return Ok(None);
    };
    let stream = config
        .space_stream
        .parse()
        .map_err(|_| BridgeError::Config { message: format!("malformed stream did: {}", config.space_stream) })?;
    Ok(Some(stream))
}

/// Logs and suppresses the two duplicate-interaction error codes Discord's
/// at-least-once interaction delivery is expected to produce (spec §4.7
/// "Slash-command surface").
pub fn log_interaction_error(context: &str, err: serenity::Error) {
    if is_duplicate_interaction_error(&err) {
        debug!(target: LOG_TARGET, %context, "duplicate interaction delivery, ignoring");
        return;
    }
    warn!(target: LOG_TARGET, %context, %err, "interaction failed");
}

