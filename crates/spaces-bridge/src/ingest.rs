//! Ingest (external -> space), spec §4.7: "Channel creation, thread
//! creation, message creation, reaction add/remove, and message edits are
//! translated to the corresponding event variants. Each translation is
//! idempotent via the mapping table: if the Discord id already maps,
//! return the existing Roomy id; otherwise create and register."
//!
//! Each `translate_*` function is pure with respect to Discord's gateway —
//! it takes plain data extracted from a serenity event (never a serenity
//! type directly) and returns the [`spaces_core::Event`] to send plus the
//! mapping to register, so it can be unit-tested without a live gateway
//! connection. Grounded on the teacher's translation-is-a-pure-function
//! style in `rostra-bot/src/dedup.rs` (normalization helpers take owned
//! data, not network types).

use spaces_core::event::{
    AddBridgedReaction, CreateMessage, CreateRoom, DeleteMessage, EditMessage, EventVariant, RemoveBridgedReaction,
    RoomKind,
};
use spaces_core::extension::{bridged_author_did, DiscordOrigin, Extension, ExtensionMap};
use spaces_core::{Event, Ulid};

use crate::repository::{Repository, RepositoryResult};
use crate::tables::{msg_key, reaction_key, room_key};

/// A plain description of a Discord channel or thread, extracted from
/// serenity's `Channel`/`GuildChannel` before it reaches translation.
#[derive(Clone, Debug)]
pub struct DiscordChannel {
    pub channel_id: u64,
    pub name: String,
    pub parent_category_id: Option<u64>,
    /// `Some(parent_channel_id)` for a thread, `None` for a top-level
    /// channel or category.
    pub thread_parent_id: Option<u64>,
    pub is_category: bool,
}

/// A plain description of a Discord message, extracted before translation.
#[derive(Clone, Debug)]
pub struct DiscordMessage {
    pub message_id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub content: String,
    pub reply_to_message_id: Option<u64>,
}

/// A plain description of a Discord reaction add/remove.
#[derive(Clone, Debug)]
pub struct DiscordReaction {
    pub message_id: u64,
    pub user_id: u64,
    pub emoji: String,
}

/// The outcome of translating one Discord-side occurrence: the event to
/// send (`None` if the occurrence was already mapped and there is nothing
/// new to send), plus the mapping to register once the event lands.
pub struct Translated {
    pub event: Option<Event>,
    pub discord_key: String,
    pub roomy_id: Ulid,
}

/// Channel or thread creation -> `createRoom` (spec §4.7).
///
/// `is_category` maps to [`RoomKind::Category`]; a `thread_parent_id`
/// present maps to [`RoomKind::Thread`] with `parent` set to the mapped
/// room id of the parent channel; otherwise [`RoomKind::Channel`].
pub async fn translate_channel(repo: &Repository, channel: &DiscordChannel) -> RepositoryResult<Translated> {
    let discord_key = room_key(channel.channel_id);
    if let Some(existing) = repo.mapped_id(discord_key.clone()).await? {
        return Ok(Translated { event: None, discord_key, roomy_id: existing });
    }

    let parent = match channel.thread_parent_id {
        Some(parent_channel_id) => repo.mapped_id(room_key(parent_channel_id)).await?,
        None => None,
    };
    let kind = if channel.is_category {
        RoomKind::Category
    } else if channel.thread_parent_id.is_some() {
        RoomKind::Thread
    } else {
        RoomKind::Channel
    };

    let roomy_id = Ulid::generate();
    let event = Event::new(
        roomy_id,
        parent,
        EventVariant::CreateRoom(CreateRoom { kind, parent, name: channel.name.clone() }),
    );
    Ok(Translated { event: Some(event), discord_key, roomy_id })
}

/// Message creation -> `createMessage`, tagged with a
/// [`DiscordOrigin::Message`] extension so the egress path recognizes the
/// echo and never bridges it back (spec §4.7 "Origin extensions").
pub async fn translate_message(repo: &Repository, message: &DiscordMessage) -> RepositoryResult<Translated> {
    let discord_key = msg_key(message.message_id);
    if let Some(existing) = repo.mapped_id(discord_key.clone()).await? {
        return Ok(Translated { event: None, discord_key, roomy_id: existing });
    }

    let Some(room) = repo.mapped_id(room_key(message.channel_id)).await? else {
        // The channel hasn't been bridged yet (e.g. it predates the bridge
        // joining and backfill hasn't reached it); nothing to ingest.
        return Ok(Translated { event: None, discord_key, roomy_id: Ulid::ZERO });
    };

    let mut extensions = ExtensionMap::default();
    extensions.insert(
        "discordOrigin".to_string(),
        Extension::DiscordOrigin(DiscordOrigin::Message { discord_id: message.message_id.to_string() }),
    );
    if let Some(reply_to) = message.reply_to_message_id {
        if let Some(target) = repo.mapped_id(msg_key(reply_to)).await? {
            extensions.insert("reply".to_string(), Extension::Reply { target });
        }
    }

    let roomy_id = Ulid::generate();
    let event = Event::new(
        roomy_id,
        Some(room),
        EventVariant::CreateMessage(CreateMessage {
            body: message.content.clone(),
            body_mime: "text/plain".to_string(),
            extensions,
        }),
    );
    Ok(Translated { event: Some(event), discord_key, roomy_id })
}

/// Message edit -> `editMessage`. Idempotency here is scoped to "this
/// Discord edit has already been applied as this Roomy event", tracked by
/// prefixing the edit-mapping key with the edited message's own key and the
/// new content's hash, so re-delivery of the same edit webhook is a no-op
/// while a genuinely new edit still produces a new event.
pub async fn translate_edit(
    repo: &Repository,
    message: &DiscordMessage,
    edit_nonce: &str,
) -> RepositoryResult<Translated> {
    let discord_key = format!("edit:{}:{edit_nonce}", message.message_id);
    if let Some(existing) = repo.mapped_id(discord_key.clone()).await? {
        return Ok(Translated { event: None, discord_key, roomy_id: existing });
    }
    let Some(target) = repo.mapped_id(msg_key(message.message_id)).await? else {
        return Ok(Translated { event: None, discord_key, roomy_id: Ulid::ZERO });
    };

    let roomy_id = Ulid::generate();
    let event = Event::new(
        roomy_id,
        None,
        EventVariant::EditMessage(EditMessage {
            target,
            previous_edit: None,
            body: message.content.clone(),
            body_mime: "text/plain".to_string(),
            extensions: ExtensionMap::default(),
        }),
    );
    Ok(Translated { event: Some(event), discord_key, roomy_id })
}

/// Message delete -> `deleteMessage`.
pub async fn translate_delete(repo: &Repository, message_id: u64) -> RepositoryResult<Option<Event>> {
    let Some(target) = repo.mapped_id(msg_key(message_id)).await? else {
        return Ok(None);
    };
    Ok(Some(Event::new(Ulid::generate(), None, EventVariant::DeleteMessage(DeleteMessage { target }))))
}

/// Reaction add -> `addBridgedReaction` (never `addReaction`, which is
/// reserved for reactions authored by a real Roomy user — a Discord
/// reactor is represented by the synthetic `did:discord:{id}` produced by
/// [`bridged_author_did`], spec §4.7).
pub async fn translate_reaction_add(repo: &Repository, reaction: &DiscordReaction) -> RepositoryResult<Translated> {
    let discord_key = reaction_key(reaction.message_id, reaction.user_id, &reaction.emoji);
    if let Some(existing) = repo.mapped_id(discord_key.clone()).await? {
        return Ok(Translated { event: None, discord_key, roomy_id: existing });
    }
    let Some(target) = repo.mapped_id(msg_key(reaction.message_id)).await? else {
        return Ok(Translated { event: None, discord_key, roomy_id: Ulid::ZERO });
    };

    let roomy_id = Ulid::generate();
    let event = Event::new(
        roomy_id,
        None,
        EventVariant::AddBridgedReaction(AddBridgedReaction {
            target,
            emoji: reaction.emoji.clone(),
            bridged_user: bridged_author_did(&reaction.user_id.to_string()),
        }),
    );
    Ok(Translated { event: Some(event), discord_key, roomy_id })
}

/// Reaction remove -> `removeBridgedReaction`, looked up by the same key
/// the add used so the pair always agrees on which Roomy reaction id to
/// target.
pub async fn translate_reaction_remove(
    repo: &Repository,
    reaction: &DiscordReaction,
) -> RepositoryResult<Option<Event>> {
    let discord_key = reaction_key(reaction.message_id, reaction.user_id, &reaction.emoji);
    let Some(reaction_id) = repo.mapped_id(discord_key).await? else {
        return Ok(None);
    };
    Ok(Some(Event::new(
        Ulid::generate(),
        None,
        EventVariant::RemoveBridgedReaction(RemoveBridgedReaction { reaction_id }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_translation_is_idempotent() {
        let repo = Repository::new_in_memory().await.unwrap();
        let channel = DiscordChannel {
            channel_id: 1,
            name: "general".into(),
            parent_category_id: None,
            thread_parent_id: None,
            is_category: false,
        };

        let first = translate_channel(&repo, &channel).await.unwrap();
        assert!(first.event.is_some());
        repo.insert_mapping(first.discord_key.clone(), first.roomy_id).await.unwrap();

        let second = translate_channel(&repo, &channel).await.unwrap();
        assert!(second.event.is_none());
        assert_eq!(second.roomy_id, first.roomy_id);
    }

    #[tokio::test]
    async fn thread_parent_resolves_to_mapped_room() {
        let repo = Repository::new_in_memory().await.unwrap();
        let parent_room = Ulid::generate();
        repo.insert_mapping(room_key(10), parent_room).await.unwrap();

        let thread = DiscordChannel {
            channel_id: 11,
            name: "thread-1".into(),
            parent_category_id: None,
            thread_parent_id: Some(10),
            is_category: false,
        };
        let translated = translate_channel(&repo, &thread).await.unwrap();
        let event = translated.event.unwrap();
        assert_eq!(event.room, Some(parent_room));
        match event.variant {
            EventVariant::CreateRoom(payload) => {
                assert_eq!(payload.kind, RoomKind::Thread);
                assert_eq!(payload.parent, Some(parent_room));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_without_mapped_channel_produces_no_event() {
        let repo = Repository::new_in_memory().await.unwrap();
        let message =
            DiscordMessage { message_id: 1, channel_id: 99, author_id: 2, content: "hi".into(), reply_to_message_id: None };
        let translated = translate_message(&repo, &message).await.unwrap();
        assert!(translated.event.is_none());
    }

    #[tokio::test]
    async fn message_carries_discord_origin_extension() {
        let repo = Repository::new_in_memory().await.unwrap();
        let room = Ulid::generate();
        repo.insert_mapping(room_key(5), room).await.unwrap();

        let message =
            DiscordMessage { message_id: 42, channel_id: 5, author_id: 2, content: "hi".into(), reply_to_message_id: None };
        let translated = translate_message(&repo, &message).await.unwrap();
        let event = translated.event.unwrap();
        match event.variant {
            EventVariant::CreateMessage(payload) => {
                assert!(payload
                    .extensions
                    .get("discordOrigin")
                    .map(|ext| matches!(ext, Extension::DiscordOrigin(DiscordOrigin::Message { .. })))
                    .unwrap_or(false));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaction_add_then_remove_round_trips_through_same_key() {
        let repo = Repository::new_in_memory().await.unwrap();
        let room = Ulid::generate();
        repo.insert_mapping(room_key(5), room).await.unwrap();
        let target = Ulid::generate();
        repo.insert_mapping(msg_key(42), target).await.unwrap();

        let reaction = DiscordReaction { message_id: 42, user_id: 7, emoji: "👍".into() };
        let added = translate_reaction_add(&repo, &reaction).await.unwrap();
        let event = added.event.unwrap();
        repo.insert_mapping(added.discord_key.clone(), added.roomy_id).await.unwrap();

        let removed = translate_reaction_remove(&repo, &reaction).await.unwrap().unwrap();
        match (event.variant, removed.variant) {
            (EventVariant::AddBridgedReaction(_), EventVariant::RemoveBridgedReaction(remove)) => {
                assert_eq!(remove.reaction_id, added.roomy_id);
            }
            other => panic!("unexpected variants: {other:?}"),
        }
    }
}
