//! Database table definitions for the local relational projection (spec §3).
//!
//! For the content lifecycle (insertion vs. processing vs. pruning vs. GC)
//! see the module docs on [`crate::content`].

use std::collections::BTreeSet;

use spaces_core::id::{Did, StreamDid, UserDid};
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
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

// ============================================================================
// SYSTEM TABLES
// ============================================================================

def_table! {
    /// Single monotonic schema version string (spec §6 "Persistence
    /// layout"); an incompatible upgrade triggers a full rebuild rather
    /// than an in-place migration.
    db_version: () => String
}

// ============================================================================
// RAW EVENT LOG (content-addressable store for the wire-encoded event)
// ============================================================================

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct RawEventRecord {
    pub stream: StreamDidBytes,
    pub encoded: Vec<u8>,
    pub reception_order: u64,
}

def_table! {
    /// Every event ever applied or parked, by id, regardless of stream.
    events_raw: Ulid => RawEventRecord
}

def_table! {
    /// FIFO index of events within a stream, for backfill/replay.
    /// Keyed by `(stream, event_id)` so a range scan over a fixed stream
    /// prefix yields log order (event ids are themselves time-ordered).
    events_by_stream: (StreamDidBytes, Ulid) => ()
}

/// `StreamDid` wraps a `String`, which isn't `bincode::Encode + Decode`
/// friendly as a *table key* without extra trait bounds gymnastics, so the
/// tables store it via this small stable byte wrapper instead. Conversion
/// lives in `crate::ids`.
pub type StreamDidBytes = String;

pub fn stream_key(stream: &StreamDid) -> StreamDidBytes {
    stream.as_did().as_str().to_owned()
}

// ============================================================================
// DEPENDENCY PARKING (Materializer, spec §4.4)
// ============================================================================

def_table! {
    /// `(missing_dependency_id, parked_event_id) -> stream`. A range scan
    /// with a fixed first component yields every event parked on that
    /// dependency, re-attempted as soon as it resolves.
    pending_by_missing_id: (Ulid, Ulid) => StreamDidBytes
}

// ============================================================================
// CONTENT DEDUP (supplemented feature; not a spec §3 table but the
// idiomatic way to avoid storing the same attachment/page body twice)
// ============================================================================

def_table! {
    content_store: ContentHash => Vec<u8>
}

def_table! {
    content_rc: ContentHash => u64
}

// ============================================================================
// RELATIONAL PROJECTION (spec §3)
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug, bincode::Encode, bincode::Decode)]
pub enum EntityKind {
    Room,
    Message,
    Reaction,
    Page,
    RoomLink,
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct EntityRecord {
    pub stream: StreamDidBytes,
    pub parent: Option<Ulid>,
    pub kind: EntityKind,
}

def_table! {
    /// An entity row exists before any companion row references it
    /// (invariant, spec §3).
    entities: Ulid => EntityRecord
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, bincode::Encode, bincode::Decode)]
pub enum RoomKind {
    Channel,
    Category,
    Thread,
    Page,
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct CompRoom {
    pub kind: RoomKind,
    pub label: String,
    /// Monotonic within a stream (spec §3 invariant): once set, never
    /// cleared.
    pub deleted: bool,
}

def_table! {
    comp_room: Ulid => CompRoom
}

#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct CompInfo {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
}

def_table! {
    comp_info: Ulid => CompInfo
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct CompSpace {
    pub hidden: bool,
    /// Raw JSON: an ordered list of `{name, children:[room_id,...]}`
    /// categories (spec §9 — direction of travel for the sidebar).
    pub sidebar_config_json: Option<String>,
    pub handle_account: Option<String>,
    pub backfilled_to: Option<Ulid>,
    pub admins: BTreeSet<String>,
}

impl Default for CompSpace {
    fn default() -> Self {
        Self {
            hidden: false,
            sidebar_config_json: None,
            handle_account: None,
            backfilled_to: None,
            admins: BTreeSet::new(),
        }
    }
}

def_table! {
    /// Keyed by the stream's own id, which is also the space entity's id.
    comp_space: Ulid => CompSpace
}

def_table! {
    /// Presence-only marker: a user row exists once any event from that
    /// user has been observed.
    comp_user: UserDidBytes => ()
}

pub type UserDidBytes = String;
pub fn user_key(did: &UserDid) -> UserDidBytes {
    did.as_did().as_str().to_owned()
}
pub fn did_key(did: &Did) -> UserDidBytes {
    did.as_str().to_owned()
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct EdgeRecord {
    pub label: String,
    pub payload: Vec<u8>,
}

def_table! {
    /// `edges` reference only existing entities (invariant, spec §3).
    edges: (Ulid, Ulid) => EdgeRecord
}

#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct CompLastRead {
    pub timestamp: Ulid,
    pub unread_count: u32,
}

def_table! {
    comp_last_read: (Ulid, UserDidBytes) => CompLastRead
}

// ---------------------------------------------------------------------
// Domain-specific companions
// ---------------------------------------------------------------------

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct CompMessage {
    pub room: Ulid,
    pub author: UserDidBytes,
    pub body: String,
    pub body_mime: String,
    pub reply_to: Option<Ulid>,
    pub deleted: bool,
    pub reaction_count: u32,
}

def_table! {
    comp_message: Ulid => CompMessage
}

def_table! {
    /// Ordering within a room: `(room, message_id) -> ()`.
    comp_message_by_room: (Ulid, Ulid) => ()
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct CompReaction {
    pub target: Ulid,
    pub emoji: String,
    pub actor: UserDidBytes,
}

def_table! {
    comp_reaction: Ulid => CompReaction
}

def_table! {
    /// `(target, reaction_id) -> ()`, used to enumerate a message's
    /// reactions and to implement addReaction/removeReaction idempotently.
    comp_reaction_by_target: (Ulid, Ulid) => ()
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct CompPage {
    pub room: Ulid,
    pub body: String,
    pub body_mime: String,
}

def_table! {
    comp_page: Ulid => CompPage
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct CompRoomLink {
    pub label: String,
}

def_table! {
    comp_room_link: (Ulid, Ulid) => CompRoomLink
}

// ---------------------------------------------------------------------
// Data-usage accounting (supplemented feature, spec SPEC_FULL.md)
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct DataUsageRecord {
    pub events_count: u64,
    pub bytes_stored: u64,
}

def_table! {
    ids_data_usage: StreamDidBytes => DataUsageRecord
}
