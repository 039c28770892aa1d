//! redb table definitions for the bridge's persistent state: the
//! identifier mapping, the per-channel content-hash dedup index, cached
//! webhooks, backfill cursors, and per-guild bridge configuration.
//!
//! Grounded on the teacher's `rostra-bot/src/tables.rs` + `database.rs`
//! (`def_table!`-style redb-bincode table definitions, opened inside a
//! `write_with`/`read_with` closure).

use spaces_core::{ContentHash, Ulid};

macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

/// A Discord-side id, prefixed to disambiguate namespaces that otherwise
/// collide — Discord reuses a message's id as its thread id when a thread
/// is started from that message (spec §4.7 "Identifier mapping").
pub type DiscordIdKey = String;

pub fn room_key(discord_channel_id: u64) -> DiscordIdKey {
    format!("room:{discord_channel_id}")
}
pub fn msg_key(discord_message_id: u64) -> DiscordIdKey {
    format!("msg:{discord_message_id}")
}
pub fn reaction_key(discord_message_id: u64, user_id: u64, emoji: &str) -> DiscordIdKey {
    format!("rx:{discord_message_id}:{user_id}:{emoji}")
}
pub fn user_key(discord_user_id: u64) -> DiscordIdKey {
    format!("user:{discord_user_id}")
}

/// Strips a `"room:"`/`"msg:"`-style prefix and parses the numeric Discord
/// id back out, the inverse of [`room_key`]/[`msg_key`].
pub fn parse_discord_id(key: &str) -> Option<u64> {
    key.rsplit(':').next()?.parse().ok()
}

def_table! {
    /// `discord_id -> roomy_id`, the forward half of the bidirectional map.
    id_map_forward: DiscordIdKey => Ulid
}
def_table! {
    /// `roomy_id -> discord_id`, the reverse half.
    id_map_reverse: Ulid => DiscordIdKey
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct WebhookRecord {
    pub webhook_id: u64,
    pub token: String,
}

def_table! {
    /// Per-channel cached webhook, refreshed on 404 (spec §4.7 "Egress").
    webhook_by_channel: u64 => WebhookRecord
}

def_table! {
    /// `(channel_id, content_hash) -> discord_message_id`: the per-channel
    /// hash index built by backfilling Discord history, consulted before
    /// sending to avoid re-posting content that already exists on the
    /// Discord side (spec §4.7 "Egress" step 3, §8 scenario 5).
    content_hash_index: (u64, ContentHash) => u64
}

def_table! {
    /// Per-channel "latest seen" Discord message id, persisted across
    /// restarts so backfill pagination resumes rather than rescanning
    /// (spec §4.7 "Backfill").
    backfill_cursor: u64 => u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum BridgeMode {
    Full,
    Subset,
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct GuildBridgeConfig {
    pub space_stream: String,
    pub mode: BridgeMode,
    /// Present only in `Subset` mode: the per-bridge role whose
    /// `VIEW_CHANNEL: Allow` overwrites on selected channels are both the
    /// grant and the authoritative channel list (spec §4.7 "Subset mode").
    pub subset_role_id: Option<u64>,
}

def_table! {
    /// One bridge per (guild, space) pair, keyed by the Discord guild id.
    guild_bridge: u64 => GuildBridgeConfig
}
