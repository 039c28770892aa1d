mod cli;

use std::io;
use std::sync::Arc;

use clap::Parser;
use cli::{DevCmd, Opts, OptsCmd};
use futures::future::pending;
use spaces_core::event::{CreateMessage, Event, EventVariant};
use spaces_core::extension::ExtensionMap;
use spaces_core::Ulid;
use spaces_peer::error::{AuthError, InitError, SendEventError};
use spaces_peer::identity::{FileIdentityProvider, FileSessionStore};
use spaces_peer::rpc::{Request, Response};
use spaces_peer::{Config, Peer, PeerPort};
use snafu::{FromString, ResultExt, Snafu, Whatever};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const PROJECT_NAME: &str = "spaces";
pub const LOG_TARGET: &str = "spaces::cli";

type WhateverResult<T> = std::result::Result<T, snafu::Whatever>;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("initialization error: {source}"))]
    Init { source: InitError },
    #[snafu(display("auth error: {source}"))]
    Auth { source: AuthError },
    #[snafu(display("send event error: {source}"))]
    SendEvent { source: SendEventError },
    #[snafu(display("miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    match handle_cmd(opts).await {
        Ok(v) => {
            println!("{}", serde_json::to_string_pretty(&v).expect("Can't fail"));
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn build_peer(global: &cli::GlobalOpts) -> CliResult<Arc<Peer>> {
    let mut config = Config::new(global.leaf_url.clone());
    config.testing_handle = global.testing_handle.clone();
    config.testing_app_password = global.testing_app_password.clone();

    let identity_provider = Arc::new(FileIdentityProvider::new(global.data_dir().to_owned()));
    let session_store = Arc::new(FileSessionStore::new(global.data_dir().to_owned()));

    let peer = Peer::builder(config)
        .identity_provider(identity_provider)
        .session_store(session_store)
        .build()
        .await
        .context(InitSnafu)?;
    peer.initialize().await.context(AuthSnafu)?;
    Ok(peer)
}

async fn handle_cmd(opts: Opts) -> CliResult<serde_json::Value> {
    Ok(match opts.cmd {
        OptsCmd::Serve => {
            let peer = build_peer(&opts.global).await?;
            peer.connect_pending_spaces().await.context(AuthSnafu)?;
            info!(target: LOG_TARGET, "peer running, backfilling roster in the background");
            pending().await
        }
        OptsCmd::Dev(cmd) => match cmd {
            DevCmd::DbDump { table } => {
                let peer = build_peer(&opts.global).await?;
                let port = PeerPort::spawn(peer);
                match port.call(Request::DumpTable { name: table }).await {
                    Response::TableDump(rows) => serde_json::json!({ "rows_dumped": rows }),
                    Response::Error { message } => {
                        return Err(CliError::Whatever { source: Whatever::without_source(message) });
                    }
                    other => serde_json::json!({ "unexpected_response": format!("{other:?}") }),
                }
            }
            DevCmd::Ping => {
                let peer = build_peer(&opts.global).await?;
                let port = PeerPort::spawn(peer);
                let start = tokio::time::Instant::now();
                let response = port.call(Request::Ping).await;
                let elapsed = start.elapsed();
                info!(target: LOG_TARGET, elapsed_usecs = elapsed.as_micros(), response = ?response, "ping");
                serde_json::json!({ "elapsed_usecs": elapsed.as_micros() })
            }
            DevCmd::ResolveSpace { handle } => {
                let peer = build_peer(&opts.global).await?;
                let stream = peer.resolve_space_id(&handle).await.context(AuthSnafu)?;
                serde_json::json!({ "stream": stream.map(|s| s.to_string()) })
            }
            DevCmd::SendMessage { stream, room, body } => {
                let peer = build_peer(&opts.global).await?;
                let event = Event::new(
                    Ulid::generate(),
                    Some(room),
                    EventVariant::CreateMessage(CreateMessage {
                        body,
                        body_mime: "text/plain".to_owned(),
                        extensions: ExtensionMap::default(),
                    }),
                );
                peer.send_event(&stream, event).await.context(SendEventSnafu)?;
                serde_json::json!({ "sent": true })
            }
        },
    })
}

pub fn init_logging() -> WhateverResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy())
        .try_init()
        .map_err(|_| Whatever::without_source("Failed to initialize logging".to_string()))?;

    Ok(())
}
