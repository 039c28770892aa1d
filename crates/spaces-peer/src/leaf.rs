//! Resolves the log server's (`leafUrl`, spec §6) reachable iroh address.
//!
//! The teacher resolves a peer's iroh address via a pkarr DHT record
//! (`rostra-client::net::connect_by_pkarr_resolution`). A single
//! known-URL log server has no DHT presence to look up, so this instead
//! fetches a compact ticket over plain HTTP; the ticket encoding itself
//! (`base64url` over the ticket's byte form) is the teacher's
//! `CompactTicket` pattern unchanged.

use core::{fmt, str};

use iroh_base::ticket::{NodeTicket, Ticket as _};
use iroh_base::EndpointAddr;

use crate::error::{ConnectError, ConnectResult};

#[derive(Debug, Clone)]
pub struct LeafTicket(NodeTicket);

impl fmt::Display for LeafTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::BASE64URL_NOPAD.encode_write(&self.0.to_bytes(), f)
    }
}

impl str::FromStr for LeafTicket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::BASE64URL_NOPAD
            .decode(s.trim().as_bytes())
            .map_err(|err| err.to_string())?;
        let ticket = NodeTicket::from_bytes(&bytes).map_err(|err| err.to_string())?;
        Ok(Self(ticket))
    }
}

impl From<LeafTicket> for EndpointAddr {
    fn from(val: LeafTicket) -> Self {
        val.0.into()
    }
}

/// Fetches and decodes the leaf server's address ticket from `{leaf_url}`.
pub async fn resolve_leaf_endpoint(leaf_url: &str) -> ConnectResult<EndpointAddr> {
    let body = reqwest::get(leaf_url)
        .await
        .map_err(|source| ConnectError::ResolveLeaf { source })?
        .error_for_status()
        .map_err(|source| ConnectError::ResolveLeaf { source })?
        .text()
        .await
        .map_err(|source| ConnectError::ResolveLeaf { source })?;

    let ticket: LeafTicket = body
        .parse()
        .map_err(|message| ConnectError::MalformedTicket { message })?;
    Ok(ticket.into())
}
