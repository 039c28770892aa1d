//! Recognized configuration (spec §6 "Configuration").

use spaces_core::id::StreamDid;

/// Options mirror spec §6 names verbatim so a deployment's env/CLI surface
/// reads the same as the spec that describes it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Log server base URL. Required, no default.
    pub leaf_url: String,
    /// Identity directory URL (PLC-style resolver for DIDs).
    pub plc_directory: String,
    /// Fixed string embedded in the personal-stream rkey.
    pub stream_schema_version: String,
    /// NSID used for the personal-stream identity record.
    pub stream_nsid: String,
    /// NSID used for the space-handle identity record.
    pub stream_handle_nsid: String,
    /// Enables the app-password auth path in tests.
    pub testing_handle: Option<String>,
    pub testing_app_password: Option<String>,

    pub threads_list: bool,
    pub discord_import: bool,
    pub discord_bridge: bool,
    pub shared_worker: bool,
}

impl Config {
    pub fn new(leaf_url: impl Into<String>) -> Self {
        Self {
            leaf_url: leaf_url.into(),
            plc_directory: "https://plc.directory".to_owned(),
            stream_schema_version: "v0".to_owned(),
            stream_nsid: "space.roomy.stream".to_owned(),
            stream_handle_nsid: "space.roomy.handle".to_owned(),
            testing_handle: None,
            testing_app_password: None,
            threads_list: true,
            discord_import: false,
            discord_bridge: false,
            shared_worker: false,
        }
    }

    /// `leafServerDid` (spec §6): derived deterministically from `leafUrl`
    /// so callers never have to configure it separately.
    pub fn leaf_server_did(&self) -> StreamDid {
        let digest = blake3::hash(self.leaf_url.as_bytes());
        StreamDid::new(
            format!("did:web:leaf-{}", &digest.to_hex()[..16])
                .parse()
                .expect("ascii, non-empty"),
        )
    }

    pub fn is_test_credential_mode(&self) -> bool {
        self.testing_handle.is_some() && self.testing_app_password.is_some()
    }
}
