#[cfg(feature = "bincode")]
pub mod bincode;
pub mod dependency;
pub mod event;
pub mod extension;
pub mod id;
#[cfg(feature = "bincode")]
pub mod schema;

pub use dependency::dependencies_of;
pub use event::{Event, EventVariant};
pub use id::{Did, Handle, StreamDid, Ulid, UserDid};
#[cfg(feature = "bincode")]
pub use schema::{encode, parse, SchemaError};

#[macro_export]
macro_rules! define_array_type_no_serde {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $(#[$outer])*
        #[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
        #[derive(Copy, Clone, Hash, Debug)]
        pub struct $t([u8; $n]);

        impl $t {
            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }

            pub fn as_bytes(&self) -> &[u8; $n] {
                &self.0
            }
        }
    }
}

#[macro_export]
macro_rules! define_array_type {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $crate::define_array_type_no_serde!(
            #[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
            $(#[$outer])*
            struct $t, $n
        );

    }
}

#[macro_export]
macro_rules! define_array_type_public {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $crate::define_array_type!(
            #[derive(PartialOrd, Ord, PartialEq, Eq)]
            $(#[$outer])*
            struct $t, $n
        );
    }
}

macro_rules! impl_base32_str {
    (
        $t:tt
    ) => {
        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                data_encoding::BASE32_NOPAD.encode_write(self.as_slice(), f)
            }
        }

        impl std::str::FromStr for $t {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                let v = data_encoding::BASE32_NOPAD.decode(s.as_bytes())?;
                let a = v.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(a))
            }
        }
    };
}
pub(crate) use impl_base32_str;

/// Content-addressed hash of a blob (attachment bytes, page body, ...).
///
/// Not part of the event envelope itself; used by the relational store's
/// content-dedup table (see `spaces-store`).
define_array_type_public!(struct ContentHash, 32);
impl_base32_str!(ContentHash);

impl From<blake3::Hash> for ContentHash {
    fn from(value: blake3::Hash) -> Self {
        Self(value.as_bytes()[..32].try_into().expect("Must be 32 bytes"))
    }
}

impl ContentHash {
    /// Hashes `bytes` with blake3.
    pub fn of(bytes: &[u8]) -> Self {
        blake3::hash(bytes).into()
    }
}

impl From<ContentHash> for [u8; 32] {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

/// Length of a message, encoded in a fixed-size way.
///
/// Used by the transport's framing, where a 32-bit length field must be a
/// fixed width on the wire.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgLen(pub u32);

impl From<u32> for MsgLen {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<MsgLen> for u32 {
    fn from(value: MsgLen) -> Self {
        value.0
    }
}
