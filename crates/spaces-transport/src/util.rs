use std::fmt;

pub trait ToShort {
    type ShortId;
    fn to_short(self) -> Self::ShortId;
}

/// First 8 bytes of an `iroh` node's public key, for log lines — printing
/// the full 32-byte key on every debug line would drown the signal.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PeerShortId([u8; 8]);

impl PeerShortId {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl ToShort for iroh::PublicKey {
    type ShortId = PeerShortId;

    fn to_short(self) -> Self::ShortId {
        PeerShortId::from_bytes(self.as_bytes()[..8].try_into().expect("slice is 8 bytes"))
    }
}

impl fmt::Display for PeerShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl fmt::Debug for PeerShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
