//! Typed extension objects keyed by NSID, carried on messages (spec §3
//! "Extensions").

use std::collections::BTreeMap;

use crate::id::Did;
use crate::Ulid;

/// Sorted so the canonical encoding is deterministic regardless of
/// insertion order (a `HashMap` would make `encode(parse(b)) == b` fail).
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ExtensionMap(BTreeMap<String, Extension>);

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nsid: impl Into<String>, ext: Extension) {
        self.0.insert(nsid.into(), ext);
    }

    pub fn get(&self, nsid: &str) -> Option<&Extension> {
        self.0.get(nsid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Extension)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Extension {
    /// `space.roomy.ext.reply.v0` — this message replies to `target`.
    Reply { target: Ulid },
    /// `space.roomy.ext.comment.v0` — a comment anchored to a byte range of
    /// a specific page version.
    Comment {
        page_version: Ulid,
        from: u32,
        to: u32,
    },
    /// `space.roomy.ext.authorOverride.v0` — used by bridges to puppet a
    /// display identity that isn't the event's cryptographic author.
    AuthorOverride {
        display_name: String,
        avatar: Option<String>,
    },
    /// `space.roomy.ext.timestampOverride.v0` — used on backfill, where the
    /// wall-clock arrival time differs from the original send time.
    TimestampOverride { timestamp: Ulid },
    /// `space.roomy.ext.attachment.v0`.
    Attachment {
        mime: String,
        uri: String,
        filename: Option<String>,
    },
    /// `space.roomy.ext.linkPreview.v0`.
    LinkPreview {
        url: String,
        title: Option<String>,
        description: Option<String>,
        image_uri: Option<String>,
    },
    /// `space.roomy.ext.discordOrigin.v0` family — present on every event a
    /// bridge writes, so the reverse sync direction can skip it (spec
    /// §4.7 "Origin extensions").
    DiscordOrigin(DiscordOrigin),
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DiscordOrigin {
    Room { discord_id: String },
    Message { discord_id: String },
    Reaction { discord_id: String },
    Sidebar,
    User { discord_id: String },
    RoomLink { discord_id: String },
}

impl DiscordOrigin {
    pub fn discord_id(&self) -> Option<&str> {
        match self {
            Self::Room { discord_id }
            | Self::Message { discord_id }
            | Self::Reaction { discord_id }
            | Self::User { discord_id }
            | Self::RoomLink { discord_id } => Some(discord_id),
            Self::Sidebar => None,
        }
    }
}

/// Also exposed at the bridged-identity level so `Did` stays opaque to the
/// schema crate while the bridge can still tag a bridged author.
pub fn bridged_author_did(discord_user_id: &str) -> Did {
    format!("did:discord:{discord_user_id}")
        .parse()
        .expect("ascii, non-empty")
}
