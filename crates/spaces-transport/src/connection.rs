//! One connection per stream (spec §4.2 "Stream Client").
//!
//! Unary verbs (`append`, `query`, `check_exists`) go over
//! [`Connection::rpc`]: a bidirectional QUIC stream carrying one
//! length-prefixed request and one length-prefixed response. `subscribe` is
//! long-lived — [`Connection::subscribe`] opens its own bidirectional
//! stream and yields a [`futures::Stream`] of [`BatchFrame`]s for as long as
//! the server keeps it open.

use bincode::{Decode, Encode};
use convi::CastInto as _;
use futures::Stream;
use snafu::{ensure, ResultExt as _};
use spaces_core::bincode::STD_BINCODE_CONFIG;
use spaces_core::Ulid;
use spaces_util_error::FmtCompact as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tracing::{instrument, trace};

use crate::{
    ConnectionSnafu, DecodingSnafu, EncodingSnafu, ReadSnafu, RejectedSnafu, RequestTooLargeSnafu,
    ResponseTooLargeSnafu, RpcResult, WriteSnafu, LOG_TARGET,
};

/// Requests are small: they originate from us, so we bound them tightly.
const MAX_REQUEST_SIZE: u32 = 64 * 1024;
/// Responses can carry whole event batches; bounded generously but not
/// unboundedly, to cap a misbehaving server's memory footprint on us.
const MAX_RESPONSE_SIZE: u32 = 32 * 1024 * 1024;

pub struct Connection(iroh::endpoint::Connection);

impl From<iroh::endpoint::Connection> for Connection {
    fn from(conn: iroh::endpoint::Connection) -> Self {
        Self(conn)
    }
}

#[repr(u16)]
#[derive(Clone, Copy, Encode, Decode)]
pub enum RpcId {
    Append,
    Query,
    CheckExists,
    Subscribe,
}

pub trait RpcRequest: bincode::Encode {
    const RPC_ID: RpcId;
    type Response: bincode::Decode<()>;
}

#[derive(Clone, Encode, Decode)]
pub struct AppendRequest {
    pub stream: String,
    /// Each element is one canonically-encoded [`spaces_core::Event`]
    /// (spec §4.2 "append(events[])").
    pub events: Vec<Vec<u8>>,
}

#[derive(Clone, Encode, Decode)]
pub struct AppendResponse {
    /// `Err` carries the server's rejection reason (spec §4.2 "fails if
    /// the server rejects").
    pub result: Result<u64, String>,
}

impl RpcRequest for AppendRequest {
    const RPC_ID: RpcId = RpcId::Append;
    type Response = AppendResponse;
}

#[derive(Clone, Encode, Decode)]
pub struct QueryRequest {
    pub stream: String,
    pub named_query: String,
    pub params: Vec<u8>,
    pub limit: u32,
    pub start: u64,
}

#[derive(Clone, Encode, Decode)]
pub struct QueryResponse {
    pub rows: Vec<Vec<u8>>,
}

impl RpcRequest for QueryRequest {
    const RPC_ID: RpcId = RpcId::Query;
    type Response = QueryResponse;
}

#[derive(Clone, Encode, Decode)]
pub struct CheckExistsRequest {
    pub stream: String,
}

#[derive(Clone, Encode, Decode)]
pub struct CheckExistsResponse(pub bool);

impl RpcRequest for CheckExistsRequest {
    const RPC_ID: RpcId = RpcId::CheckExists;
    type Response = CheckExistsResponse;
}

#[derive(Clone, Encode, Decode)]
pub struct SubscribeRequest {
    pub stream: String,
    pub start_index: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode)]
pub enum BatchPriority {
    Priority,
    Background,
}

#[derive(Clone, Encode, Decode)]
pub struct Batch {
    pub batch_id: Ulid,
    pub events: Vec<Vec<u8>>,
    pub is_backfill: bool,
    pub priority_hint: BatchPriority,
}

/// One frame on a live `subscribe` stream: either an event batch, or the
/// server's one-time "you are caught up" marker (spec §4.2: "after the
/// server signals caught up, the stream continues delivering live
/// appends").
#[derive(Clone, Encode, Decode)]
pub enum BatchFrame {
    Batch(Batch),
    CaughtUp,
}

fn write_framed<T: bincode::Encode>(rpc_id: RpcId, v: &T) -> RpcResult<Vec<u8>> {
    let mut body = Vec::with_capacity(128);
    bincode::encode_into_std_write(v, &mut body, STD_BINCODE_CONFIG).context(EncodingSnafu)?;

    ensure!(
        body.len() <= MAX_REQUEST_SIZE as usize,
        RequestTooLargeSnafu {
            len: body.len() as u32,
            limit: MAX_REQUEST_SIZE,
        }
    );

    let mut framed = Vec::with_capacity(body.len() + 6);
    bincode::encode_into_std_write(rpc_id, &mut framed, STD_BINCODE_CONFIG).context(EncodingSnafu)?;
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

async fn read_framed<T: bincode::Decode<()>>(
    recv: &mut iroh::endpoint::RecvStream,
    limit: u32,
) -> RpcResult<T> {
    let mut len_bytes = [0u8; 4];
    recv.read_exact(&mut len_bytes).await.boxed().context(ReadSnafu)?;
    let len = u32::from_be_bytes(len_bytes);
    ensure!(len <= limit, ResponseTooLargeSnafu { len, limit });

    let mut body = vec![0u8; len.cast_into()];
    recv.read_exact(&mut body).await.boxed().context(ReadSnafu)?;

    Ok(bincode::decode_from_slice(&body, STD_BINCODE_CONFIG)
        .context(DecodingSnafu)?
        .0)
}

impl Connection {
    /// One request, one response, over a fresh bidirectional stream.
    #[instrument(skip_all)]
    pub async fn rpc<R: RpcRequest>(&self, rpc: &R) -> RpcResult<R::Response> {
        let (mut send, mut recv) = self.0.open_bi().await.context(ConnectionSnafu)?;

        send.write_all(&write_framed(R::RPC_ID, rpc)?)
            .await
            .context(WriteSnafu)?;
        send.finish().context(WriteSnafu)?;

        read_framed(&mut recv, MAX_RESPONSE_SIZE).await
    }

    pub async fn append(&self, stream: String, events: Vec<Vec<u8>>) -> RpcResult<u64> {
        let resp = self.rpc(&AppendRequest { stream, events }).await?;
        resp.result.map_err(|reason| crate::RpcError::Rejected { reason })
    }

    pub async fn check_exists(&self, stream: String) -> RpcResult<bool> {
        Ok(self.rpc(&CheckExistsRequest { stream }).await?.0)
    }

    pub async fn query(
        &self,
        stream: String,
        named_query: String,
        params: Vec<u8>,
        limit: u32,
        start: u64,
    ) -> RpcResult<Vec<Vec<u8>>> {
        Ok(self
            .rpc(&QueryRequest {
                stream,
                named_query,
                params,
                limit,
                start,
            })
            .await?
            .rows)
    }

    /// Opens a long-lived subscription from `start_index` (spec §4.2
    /// "subscribe"). The returned stream yields backfill batches, then the
    /// `CaughtUp` marker, then live batches, until the server closes the
    /// stream or it errors.
    pub fn subscribe(
        self: std::sync::Arc<Self>,
        stream: String,
        start_index: u64,
    ) -> impl Stream<Item = RpcResult<BatchFrame>> + 'static {
        async_stream::stream! {
            let (mut send, mut recv) = match self.0.open_bi().await.context(ConnectionSnafu) {
                Ok(pair) => pair,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let req = SubscribeRequest { stream, start_index };
            match write_framed(RpcId::Subscribe, &req) {
                Ok(framed) => {
                    if let Err(e) = send.write_all(&framed).await.context(WriteSnafu) {
                        yield Err(e);
                        return;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
            if let Err(e) = send.finish().context(WriteSnafu) {
                yield Err(e);
                return;
            }

            loop {
                match read_framed::<BatchFrame>(&mut recv, MAX_RESPONSE_SIZE).await {
                    Ok(frame) => {
                        trace!(target: LOG_TARGET, "subscribe frame received");
                        yield Ok(frame);
                    }
                    Err(crate::RpcError::Read { .. }) => {
                        // Stream closed cleanly by the peer: end of
                        // subscription, not an error to surface upward.
                        break;
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

pub fn rejected(reason: impl Into<String>) -> crate::RpcError {
    RejectedSnafu { reason: reason.into() }.build()
}
