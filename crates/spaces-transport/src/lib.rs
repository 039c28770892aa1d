//! Stream Client wire RPC (spec §4.2, §6 "Log server protocol").
//!
//! One [`connection::Connection`] per stream talks to the log server over a
//! length-prefixed bincode framing on top of an `iroh` QUIC connection. The
//! verb set is the abstract log-server protocol from spec §6: `append`,
//! `subscribe`, `query`, `check_exists`.

pub mod connection;
pub mod util;

use spaces_util_error::BoxedError;
use snafu::Snafu;

/// ALPN identifying this wire protocol to `iroh`'s QUIC handshake.
pub const SPACES_SYNC_V0_ALPN: &[u8] = b"spaces-sync-v0";

pub const LOG_TARGET: &str = "spaces::transport";

#[derive(Debug, Snafu)]
pub enum RpcError {
    Connection {
        source: iroh::endpoint::ConnectionError,
    },
    Write {
        source: iroh::endpoint::WriteError,
    },
    Read {
        source: BoxedError,
    },
    RequestTooLarge {
        len: u32,
        limit: u32,
    },
    ResponseTooLarge {
        len: u32,
        limit: u32,
    },
    Encoding {
        source: bincode::error::EncodeError,
    },
    Decoding {
        source: bincode::error::DecodeError,
    },
    /// The server rejected the append (spec §4.2 "append ... fails if the
    /// server rejects").
    #[snafu(display("server rejected rpc: {reason}"))]
    Rejected {
        reason: String,
    },
}
pub type RpcResult<T> = std::result::Result<T, RpcError>;
