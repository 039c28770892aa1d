//! Error taxonomy for the Sync Bridge (spec §7: `DuplicateInteraction`,
//! `RateLimited`, plus the ambient transport/storage kinds already defined
//! by `spaces-peer`/`spaces-store`).

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum BridgeError {
    #[snafu(display("discord gateway error: {source}"))]
    Gateway { source: serenity::Error },
    #[snafu(transparent)]
    Db { source: spaces_store::DbError },
    #[snafu(display("failed to send event to space {space}: {source}"))]
    SendEvent {
        space: spaces_core::id::StreamDid,
        source: spaces_peer::error::SendEventError,
    },
    #[snafu(display("webhook call exhausted retries for channel {channel_id}"))]
    WebhookRetriesExhausted { channel_id: u64 },
    #[snafu(display("no mapped webhook for channel {channel_id}"))]
    NoWebhook { channel_id: u64 },
    #[snafu(display("config error: {message}"))]
    Config { message: String },
}
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Discord interaction error codes that are expected under duplicate
/// delivery and must be suppressed rather than logged as failures (spec
/// §4.7 "Slash-command surface").
pub const DISCORD_ALREADY_ACKNOWLEDGED: isize = 40060;
pub const DISCORD_UNKNOWN_INTERACTION: isize = 10062;

/// True if `err` is one of the two duplicate-interaction codes a retried
/// or re-delivered interaction is expected to produce.
pub fn is_duplicate_interaction_error(err: &serenity::Error) -> bool {
    let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response)) = err else {
        return false;
    };
    matches!(
        response.error.code,
        DISCORD_ALREADY_ACKNOWLEDGED | DISCORD_UNKNOWN_INTERACTION
    )
}

/// True if `err` is an HTTP 404, the signal to clear a cached webhook and
/// recreate it (spec §4.7 "Webhook tokens are persisted ... refreshed on
/// 404").
pub fn is_not_found(err: &serenity::Error) -> bool {
    matches!(
        err,
        serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

/// True if `err` is an HTTP 5xx, which the egress retry loop backs off and
/// retries rather than dead-lettering (spec §4.7 "Retry/rate-limit").
pub fn is_server_error(err: &serenity::Error) -> bool {
    matches!(
        err,
        serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() >= 500
    )
}

/// The server-provided `Retry-After` seconds on a 429, if `err` is one.
/// Discord's JSON error body for rate limits carries a top-level
/// `retry_after` float; serenity surfaces the raw body as the
/// [`DiscordJsonError::message`] when it doesn't recognize the shape, so we
/// scrape it rather than depend on a dedicated serenity type.
pub fn rate_limit_retry_after(err: &serenity::Error) -> Option<f64> {
    match err {
        serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 429 =>
        {
            response
                .error
                .message
                .split("retry_after\":")
                .nth(1)
                .and_then(|rest| rest.split([',', '}']).next())
                .and_then(|s| s.trim().parse::<f64>().ok())
        }
        _ => None,
    }
}
