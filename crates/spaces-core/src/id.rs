//! Primitive identifiers: [`Ulid`], [`Did`] and its branded forms, [`Handle`].

use core::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};

use snafu::{ensure, Snafu};

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// A 128-bit, time-ordered, lexicographically comparable identifier.
///
/// The high 48 bits are a millisecond Unix timestamp; the low 80 bits are
/// random. Byte order is big-endian end to end, so `Ord` on the raw bytes
/// agrees with creation order (ties broken by the random tail).
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Ulid([u8; 16]);

// Used only to give same-millisecond Ulids generated in-process a strictly
// increasing random tail, so batches minted back-to-back still sort in
// mint order. Does not survive a restart and is not a correctness
// requirement (cross-process ties are broken by the random bits alone).
static MONOTONIC_TAIL: AtomicU16 = AtomicU16::new(0);

impl Ulid {
    pub const ZERO: Self = Self([0; 16]);

    pub fn new(timestamp_ms: u64, rand_tail: impl FnOnce() -> [u8; 10]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..6].copy_from_slice(&timestamp_ms.to_be_bytes()[2..8]);
        bytes[6..16].copy_from_slice(&rand_tail());
        Self(bytes)
    }

    /// Generate a new id using the system clock and an OS random tail.
    #[cfg(feature = "rand")]
    pub fn generate() -> Self {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_millis() as u64;
        let seq = MONOTONIC_TAIL.fetch_add(1, Ordering::Relaxed);
        Self::new(timestamp_ms, || {
            let mut tail = [0u8; 10];
            rand::Rng::fill(&mut rand::thread_rng(), &mut tail[2..]);
            tail[0..2].copy_from_slice(&seq.to_be_bytes());
            tail
        })
    }

    pub fn timestamp_ms(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[0..6]);
        u64::from_be_bytes(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Derives a stable id from arbitrary bytes (e.g. a stream's own root
    /// id) by hashing them, for the cases where an entity's id is defined
    /// to equal something other than an event id — the space entity itself
    /// is keyed by its stream root (spec §3 "Lifecycle").
    ///
    /// Not time-ordered: the "timestamp" half is hash output, not a real
    /// creation time. Only used for this one derived-key purpose.
    pub fn derive_from_bytes(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash.as_bytes()[0..16]);
        Self(out)
    }
}

impl Default for Ulid {
    fn default() -> Self {
        Self::ZERO
    }
}

// Serialized as its Crockford-base32 string rather than the raw byte tuple,
// so a `Ulid` round-trips through `serde_json` (the RPC surface's envelope
// encoding) the same way it prints in logs and URLs.
#[cfg(feature = "serde")]
impl serde::Serialize for Ulid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Ulid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str> as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(|_| serde::de::Error::custom("invalid ulid"))
    }
}

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub struct UlidParseError {
    pub len: usize,
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 128 bits packed 5 bits at a time = 26 Crockford-base32 characters,
        // the last character carrying only 8 of its 5-bit slots.
        let mut out = [0u8; 26];
        let mut acc: u64 = 0;
        let mut acc_bits = 0u32;
        let mut out_idx = 0;
        for &byte in self.0.iter() {
            acc = (acc << 8) | u64::from(byte);
            acc_bits += 8;
            while acc_bits >= 5 {
                acc_bits -= 5;
                let idx = ((acc >> acc_bits) & 0b11111) as usize;
                out[out_idx] = CROCKFORD_ALPHABET[idx];
                out_idx += 1;
            }
        }
        if acc_bits > 0 {
            let idx = ((acc << (5 - acc_bits)) & 0b11111) as usize;
            out[out_idx] = CROCKFORD_ALPHABET[idx];
        }
        f.write_str(std::str::from_utf8(&out).expect("ascii"))
    }
}

impl FromStr for Ulid {
    type Err = UlidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(s.len() == 26, UlidSnafu { len: s.len() });
        let mut bits: u128 = 0;
        for ch in s.bytes() {
            let v = CROCKFORD_ALPHABET
                .iter()
                .position(|&c| c.eq_ignore_ascii_case(&ch))
                .ok_or(UlidParseError { len: s.len() })? as u128;
            bits = (bits << 5) | v;
        }
        // 26 chars * 5 bits = 130 bits decoded; the top 2 are overflow from
        // the 128-bit value and must be zero for a canonical encoding.
        let bytes = (bits & ((1u128 << 128) - 1)).to_be_bytes();
        Ok(Self(bytes))
    }
}

/// An opaque, self-describing identity string (`did:method:specific-id`).
///
/// Validated only for non-emptiness and ASCII-printability at this layer;
/// method-specific validation (e.g. `did:plc:...`) is the identity
/// provider's concern, not the schema's.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Did(String);

#[derive(Debug, Snafu, Clone)]
pub enum DidParseError {
    Empty,
    NotAscii,
}

impl Did {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Did {
    type Err = DidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(!s.is_empty(), EmptySnafu);
        ensure!(s.is_ascii(), NotAsciiSnafu);
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! branded_did {
    ($name:ident) => {
        #[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
        #[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(Did);

        impl $name {
            pub fn new(did: Did) -> Self {
                Self(did)
            }

            pub fn as_did(&self) -> &Did {
                &self.0
            }

            pub fn into_did(self) -> Did {
                self.0
            }
        }

        impl FromStr for $name {
            type Err = DidParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Did::from_str(s)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

/// A [`Did`] branded as the root identity of a stream.
branded_did!(StreamDid);
/// A [`Did`] branded as a user.
branded_did!(UserDid);

/// A human-readable, domain-like name: `^[a-z0-9][a-z0-9-]{0,62}(\.[a-z0-9-]+)+$`.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Handle(String);

#[derive(Debug, Snafu, Clone)]
pub enum HandleParseError {
    #[snafu(display("handle does not match ^[a-z0-9][a-z0-9-]{{0,62}}(\\.[a-z0-9-]+)+$"))]
    Invalid,
}

impl Handle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(s: &str) -> bool {
        let Some((first_label, rest)) = s.split_once('.') else {
            return false;
        };
        // first label: [a-z0-9][a-z0-9-]{0,62}
        let mut chars = first_label.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
            return false;
        }
        if first_label.len() > 63 {
            return false;
        }
        if !first_label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return false;
        }
        // remaining labels: one or more `.[a-z0-9-]+`
        if rest.is_empty() {
            return false;
        }
        rest.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
    }
}

impl FromStr for Handle {
    type Err = HandleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(Self::is_valid(s), InvalidSnafu);
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_round_trips_through_string() {
        let id = Ulid::new(1_700_000_000_123, || [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let s = id.to_string();
        assert_eq!(s.len(), 26);
        let parsed: Ulid = s.parse().expect("parses");
        assert_eq!(parsed, id);
    }

    #[test]
    fn ulid_ordering_follows_timestamp() {
        let a = Ulid::new(1000, || [0; 10]);
        let b = Ulid::new(2000, || [0; 10]);
        assert!(a < b);
    }

    #[test]
    fn handle_validates_domain_shape() {
        assert!(Handle::from_str("alice.example.com").is_ok());
        assert!(Handle::from_str("Alice.example.com").is_err());
        assert!(Handle::from_str("-alice.example.com").is_err());
        assert!(Handle::from_str("alice").is_err());
    }

    #[test]
    fn did_rejects_empty() {
        assert!(Did::from_str("").is_err());
        assert!(Did::from_str("did:plc:abc123").is_ok());
    }
}
