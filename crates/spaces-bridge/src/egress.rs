//! Egress (space -> external), spec §4.7:
//! 1. Truncate the event id to a 25-char nonce for Discord-side dedup.
//! 2. Skip if the event is already mapped — either it originated from
//!    Discord via ingest, or a previous bridge run already sent it.
//! 3. Skip (but still register the mapping) if an exact content hash
//!    already exists in the per-channel index built by backfill.
//! 4. Hand the remainder to the webhook sender, which retries with
//!    backoff (spec §4.7 "Retry/rate-limit", implemented in
//!    [`crate::discord`]).

use spaces_core::event::EventVariant;
use spaces_core::extension::Extension;
use spaces_core::Event;

use crate::dedup::{content_hash, event_id_to_nonce, AttachmentMeta};
use crate::repository::{Repository, RepositoryResult};
use crate::tables::{msg_key, parse_discord_id};

/// What the egress path decided to do with one materialized event, in
/// Discord-agnostic terms — [`crate::discord`] is the only module that
/// turns this into an actual HTTP call, so this type (and the function
/// that produces it) is unit-testable without a live bot token.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundAction {
    SendMessage { channel_id: u64, nonce: String, body: String },
    EditMessage { channel_id: u64, discord_message_id: u64, body: String },
    DeleteMessage { channel_id: u64, discord_message_id: u64 },
    AddReaction { channel_id: u64, discord_message_id: u64, emoji: String },
}

/// Either a concrete action, a decision to dedup-skip because the content
/// hash already points at an existing Discord message (so the mapping
/// should be registered without sending), or nothing to do.
#[derive(Clone, Debug, PartialEq)]
pub enum EgressDecision {
    Send(OutboundAction),
    AlreadyPresent { discord_message_id: u64 },
    Skip,
}

/// Resolves the mapped Discord channel id for `room`, if any.
async fn mapped_channel_id(repo: &Repository, room: spaces_core::Ulid) -> RepositoryResult<Option<u64>> {
    Ok(repo.mapped_discord_key(room).await?.as_deref().and_then(parse_discord_id))
}

/// Resolves the mapped Discord message id for `target`, if any.
async fn mapped_message_id(repo: &Repository, target: spaces_core::Ulid) -> RepositoryResult<Option<u64>> {
    Ok(repo.mapped_discord_key(target).await?.as_deref().and_then(parse_discord_id))
}

fn has_discord_origin(extensions: &spaces_core::extension::ExtensionMap) -> bool {
    extensions.iter().any(|(_, ext)| matches!(ext, Extension::DiscordOrigin(_)))
}

/// Decides what, if anything, to do with a locally materialized event.
pub async fn plan_egress(repo: &Repository, event: &Event) -> RepositoryResult<EgressDecision> {
    // Step 2: already mapped means either Discord-originated (ingest
    // registered it) or already bridged out in a prior pass.
    if repo.mapped_discord_key(event.id).await?.is_some() {
        return Ok(EgressDecision::Skip);
    }

    match &event.variant {
        EventVariant::CreateMessage(payload) => {
            if has_discord_origin(&payload.extensions) {
                return Ok(EgressDecision::Skip);
            }
            let Some(room) = event.room else { return Ok(EgressDecision::Skip) };
            let Some(channel_id) = mapped_channel_id(repo, room).await? else {
                return Ok(EgressDecision::Skip);
            };

            // Step 3: exact content-hash dedup against the backfilled index.
            let attachments: Vec<AttachmentMeta> = Vec::new();
            let hash = content_hash(&payload.body, &attachments);
            if let Some(existing) = repo.discord_message_for_hash(channel_id, hash).await? {
                return Ok(EgressDecision::AlreadyPresent { discord_message_id: existing });
            }

            Ok(EgressDecision::Send(OutboundAction::SendMessage {
                channel_id,
                nonce: event_id_to_nonce(event.id),
                body: payload.body.clone(),
            }))
        }
        EventVariant::EditMessage(payload) => {
            if has_discord_origin(&payload.extensions) {
                return Ok(EgressDecision::Skip);
            }
            let Some(room) = event.room else { return Ok(EgressDecision::Skip) };
            let (Some(channel_id), Some(discord_message_id)) =
                (mapped_channel_id(repo, room).await?, mapped_message_id(repo, payload.target).await?)
            else {
                return Ok(EgressDecision::Skip);
            };
            Ok(EgressDecision::Send(OutboundAction::EditMessage { channel_id, discord_message_id, body: payload.body.clone() }))
        }
        EventVariant::DeleteMessage(payload) => {
            let Some(room) = event.room else { return Ok(EgressDecision::Skip) };
            let (Some(channel_id), Some(discord_message_id)) =
                (mapped_channel_id(repo, room).await?, mapped_message_id(repo, payload.target).await?)
            else {
                return Ok(EgressDecision::Skip);
            };
            Ok(EgressDecision::Send(OutboundAction::DeleteMessage { channel_id, discord_message_id }))
        }
        EventVariant::AddReaction(payload) => {
            let Some(room) = event.room else { return Ok(EgressDecision::Skip) };
            let (Some(channel_id), Some(discord_message_id)) =
                (mapped_channel_id(repo, room).await?, mapped_message_id(repo, payload.target).await?)
            else {
                return Ok(EgressDecision::Skip);
            };
            Ok(EgressDecision::Send(OutboundAction::AddReaction { channel_id, discord_message_id, emoji: payload.emoji.clone() }))
        }
        // `removeReaction`/bridged-reaction variants resolve their target
        // message and emoji through the materialized `comp_reaction` row
        // rather than the event payload alone (which carries only the
        // reaction's own id); left to the orchestrator, which reads the
        // projection before the row is dropped.
        _ => Ok(EgressDecision::Skip),
    }
}

#[cfg(test)]
mod tests {
    use spaces_core::event::CreateMessage;
    use spaces_core::extension::DiscordOrigin;
    use spaces_core::Ulid;

    use super::*;
    use crate::tables::room_key;

    fn extmap_with_origin() -> spaces_core::extension::ExtensionMap {
        let mut m = spaces_core::extension::ExtensionMap::default();
        m.insert("discordOrigin", Extension::DiscordOrigin(DiscordOrigin::Message { discord_id: "1".into() }));
        m
    }

    fn message_event(room: Option<Ulid>, body: &str, extensions: spaces_core::extension::ExtensionMap) -> Event {
        Event::new(
            Ulid::generate(),
            room,
            EventVariant::CreateMessage(CreateMessage { body: body.to_string(), body_mime: "text/plain".into(), extensions }),
        )
    }

    #[tokio::test]
    async fn skips_messages_with_discord_origin() {
        let repo = Repository::new_in_memory().await.unwrap();
        let event = message_event(Some(Ulid::generate()), "hi", extmap_with_origin());
        assert_eq!(plan_egress(&repo, &event).await.unwrap(), EgressDecision::Skip);
    }

    #[tokio::test]
    async fn skips_messages_in_unmapped_rooms() {
        let repo = Repository::new_in_memory().await.unwrap();
        let event = message_event(Some(Ulid::generate()), "hi", Default::default());
        assert_eq!(plan_egress(&repo, &event).await.unwrap(), EgressDecision::Skip);
    }

    #[tokio::test]
    async fn sends_messages_in_mapped_rooms() {
        let repo = Repository::new_in_memory().await.unwrap();
        let room = Ulid::generate();
        repo.insert_mapping(room_key(5), room).await.unwrap();
        let event = message_event(Some(room), "hello world this has enough tokens", Default::default());
        let decision = plan_egress(&repo, &event).await.unwrap();
        assert_eq!(
            decision,
            EgressDecision::Send(OutboundAction::SendMessage {
                channel_id: 5,
                nonce: event_id_to_nonce(event.id),
                body: "hello world this has enough tokens".into(),
            })
        );
    }

    #[tokio::test]
    async fn already_mapped_events_are_skipped() {
        let repo = Repository::new_in_memory().await.unwrap();
        let event_id = Ulid::generate();
        repo.insert_mapping(msg_key(99), event_id).await.unwrap();
        let mut event = message_event(Some(Ulid::generate()), "hi", Default::default());
        event.id = event_id;
        assert_eq!(plan_egress(&repo, &event).await.unwrap(), EgressDecision::Skip);
    }

    #[tokio::test]
    async fn exact_content_match_reports_already_present() {
        let repo = Repository::new_in_memory().await.unwrap();
        let room = Ulid::generate();
        repo.insert_mapping(room_key(5), room).await.unwrap();
        let body = "hello world this has enough tokens";
        let hash = content_hash(body, &[]);
        repo.index_content_hash(5, hash, 777).await.unwrap();

        let event = message_event(Some(room), body, Default::default());
        assert_eq!(
            plan_egress(&repo, &event).await.unwrap(),
            EgressDecision::AlreadyPresent { discord_message_id: 777 }
        );
    }
}
