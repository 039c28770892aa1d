//! Error taxonomy for the Peer Session (spec §7).

use snafu::Snafu;
use spaces_core::id::StreamDid;

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("failed to initialize iroh endpoint"))]
    InitIrohClient { source: std::io::Error },
    #[snafu(transparent)]
    Db { source: spaces_store::DbError },
}
pub type InitResult<T> = std::result::Result<T, InitError>;

/// `TransportTransient` / `TransportFatal` (spec §7).
#[derive(Debug, Snafu)]
pub enum ConnectError {
    Rpc { source: spaces_transport::RpcError },
    /// Per-space connection timeout elapsed (spec §4.6, §5: 30s).
    #[snafu(display("connection to stream {stream} timed out"))]
    Timeout { stream: StreamDid },
    #[snafu(display("failed to resolve leaf endpoint address"))]
    ResolveLeaf { source: reqwest::Error },
    #[snafu(display("leaf endpoint ticket was malformed: {message}"))]
    MalformedTicket { message: String },
    #[snafu(display("failed to open connection to leaf endpoint"))]
    Iroh { source: iroh::endpoint::ConnectError },
}
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

/// `AuthExpired` (spec §7).
///
/// `#[snafu(context(false))]` on the fieldless variants below: three of
/// these error enums each carry their own `NotAuthenticated` case, and
/// snafu's generated context-selector structs are named after the variant,
/// not the enum, so leaving codegen on would collide across enums sharing
/// this module. Fieldless variants gain nothing from the selector pattern
/// anyway — they're constructed directly.
#[derive(Debug, Snafu)]
pub enum AuthError {
    #[snafu(context(false))]
    NotAuthenticated,
    #[snafu(display("identity provider error: {message}"))]
    IdentityProvider { message: String },
    Io { source: std::io::Error },
}
pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Snafu)]
pub enum SendEventError {
    #[snafu(context(false))]
    NotAuthenticated,
    #[snafu(transparent)]
    Connect { source: ConnectError },
    #[snafu(transparent)]
    Rpc { source: spaces_transport::RpcError },
    /// The write-path future never resolved locally (materializer never
    /// observed the event come back through fanout); surfaced distinctly
    /// from a hard connection error (spec §4.6 "Write path").
    LocalMaterializationTimedOut,
}
pub type SendEventResult<T> = std::result::Result<T, SendEventError>;

#[derive(Debug, Snafu)]
pub enum LazyLoadError {
    #[snafu(context(false))]
    NotAuthenticated,
    UnknownStream { stream: StreamDid },
    #[snafu(transparent)]
    Connect { source: ConnectError },
    #[snafu(transparent)]
    Rpc { source: spaces_transport::RpcError },
    #[snafu(transparent)]
    Db { source: spaces_store::DbError },
}
pub type LazyLoadResult<T> = std::result::Result<T, LazyLoadError>;
