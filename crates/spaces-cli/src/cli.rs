//! Command line surface for the `spaces-cli` binary: the peer-daemon and
//! diagnostics commands mirroring the teacher's `rostra`/`rostra-cli`
//! binaries' `Opts`/`OptsCmd`/`DevCmd` shape.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use clap::{Args, Parser, Subcommand};
use spaces_core::id::{Handle, StreamDid};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Log server base URL (spec §6 `leafUrl`).
    #[arg(long, env = "SPACES_LEAF_URL", default_value = "https://leaf.example.invalid")]
    pub leaf_url: String,

    /// Directory to store the local event log + relational store in.
    #[arg(long, env = "SPACES_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// App-password test credentials (spec §6 `testingHandle`/`testingAppPassword`).
    #[arg(long, env = "SPACES_TESTING_HANDLE")]
    pub testing_handle: Option<String>,
    #[arg(long, env = "SPACES_TESTING_APP_PASSWORD")]
    pub testing_app_password: Option<String>,
}

static PROJECT_DIRS: LazyLock<directories::ProjectDirs> = LazyLock::new(|| {
    directories::ProjectDirs::from("org", "Roomy", "spaces").expect("Unable to determine project's dir")
});

impl GlobalOpts {
    pub fn data_dir(&self) -> &Path {
        self.data_dir
            .as_deref()
            .unwrap_or_else(|| PROJECT_DIRS.state_dir().unwrap_or_else(|| PROJECT_DIRS.data_local_dir()))
    }
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Run the peer daemon: authenticate, backfill the personal stream and
    /// joined-space roster, and idle while background tasks keep syncing.
    Serve,

    /// Development and debugging commands.
    #[command(subcommand)]
    Dev(DevCmd),
}

#[derive(Debug, Subcommand)]
pub enum DevCmd {
    /// Dump a relational projection table as JSON lines.
    DbDump {
        /// Table name (spec §3, e.g. `entities`, `comp_room`, `edges`).
        table: String,
    },
    /// Round-trip a `ping` RPC call against a freshly built peer.
    Ping,
    /// Resolve a space handle to its stream id via the identity provider.
    ResolveSpace { handle: Handle },
    /// Send a `createMessage` event to a room and wait for it to
    /// materialize locally.
    SendMessage {
        stream: StreamDid,
        room: spaces_core::Ulid,
        body: String,
    },
}
