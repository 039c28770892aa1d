//! `parse`/`encode` — the canonical wire encoding for [`Event`] (spec §4.1).

use snafu::{ResultExt, Snafu};

use crate::bincode::STD_BINCODE_CONFIG;
use crate::Event;

#[derive(Debug, Snafu)]
pub enum SchemaError {
    #[snafu(display("failed to decode event: {source}"))]
    Decode { source: bincode::error::DecodeError },
    #[snafu(display("trailing bytes after a valid event"))]
    TrailingBytes,
}

/// Canonical deterministic binary encoding: struct field order is wire
/// order, extension maps are sorted `BTreeMap`s, so identical events always
/// encode to identical bytes (required for content hashing and for the
/// round-trip property `encode(parse(b)) == b`).
pub fn encode(event: &Event) -> Vec<u8> {
    bincode::encode_to_vec(event, STD_BINCODE_CONFIG).expect("Event encoding cannot fail")
}

pub fn parse(bytes: &[u8]) -> Result<Event, SchemaError> {
    let (event, consumed) =
        bincode::decode_from_slice(bytes, STD_BINCODE_CONFIG).context(DecodeSnafu)?;
    snafu::ensure!(consumed == bytes.len(), TrailingBytesSnafu);
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CreateMessage, EventVariant};
    use crate::extension::ExtensionMap;
    use crate::Ulid;

    #[test]
    fn round_trips_through_canonical_encoding() {
        let event = Event::new(
            Ulid::generate(),
            Some(Ulid::generate()),
            EventVariant::CreateMessage(CreateMessage {
                body: "hello".into(),
                body_mime: "text/plain".into(),
                extensions: ExtensionMap::default(),
            }),
        );
        let bytes = encode(&event);
        let parsed = parse(&bytes).expect("parses");
        assert_eq!(parsed, event);
        assert_eq!(encode(&parsed), bytes);
    }

    #[test]
    fn rejects_trailing_garbage() {
        let event = Event::new(Ulid::generate(), None, EventVariant::LastRead(crate::event::LastRead {
            room: Ulid::generate(),
            timestamp: Ulid::generate(),
        }));
        let mut bytes = encode(&event);
        bytes.push(0xff);
        assert!(parse(&bytes).is_err());
    }
}
