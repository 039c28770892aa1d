//! The Peer Session (spec §4.6) and its write/read surfaces: the auth
//! lifecycle, event channel, stream roster, and the request/response port
//! other processes (a CLI, a bridge) drive the peer through (§4.8).
//!
//! Grounded on the teacher's `rostra-client` crate: one long-lived `Peer`
//! per identity, built with a `bon` async constructor, exposing its state
//! machines as `tokio::sync::watch` channels rather than callbacks.

pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod leaf;
pub mod peer;
pub mod roster;
pub mod rpc;

pub use auth::{AuthCell, AuthState};
pub use channel::{ChannelBatch, EventChannelReceiver, EventChannelSender};
pub use config::Config;
pub use error::{
    AuthError, AuthResult, ConnectError, ConnectResult, InitError, InitResult, LazyLoadError,
    LazyLoadResult, SendEventError, SendEventResult,
};
pub use identity::{
    FileIdentityProvider, FileSessionStore, IdentityProvider, IdentityProviderError,
    IdentityProviderResult, InMemorySessionStore, OAuthCallback, PersonalStreamRecord,
    SessionStore, SpaceHandleRecord,
};
pub use peer::{ConnectingStatus, LazyLoadOutcome, Peer, PeerHandle};
pub use roster::{joined_spaces, Backoff, RosterEntry, SpaceStatus, StreamRoster};
pub use rpc::{PeerPort, Request, Response};
