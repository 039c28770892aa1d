//! The identity provider is an external collaborator (spec §1 Non-goals:
//! "does not perform identity issuance"); this module names the interface
//! the Peer Session needs from it and nothing more — OAuth flow internals,
//! PLC directory wire format, and record storage all live outside the core.

use async_trait::async_trait;
use spaces_core::id::{Handle, StreamDid, UserDid};

/// Parameters handed to the peer after the identity provider's OAuth
/// redirect lands back in the client (spec §4.6 "Authentication").
#[derive(Clone, Debug)]
pub struct OAuthCallback {
    pub user: UserDid,
    /// Opaque session token the provider issued; the peer does not
    /// interpret it, only stores and replays it on provider calls.
    pub session_token: String,
}

/// The "personal stream" identity record: a pointer from a user DID to
/// that user's personal stream id (spec §4.6 "Personal stream").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersonalStreamRecord {
    pub stream: StreamDid,
}

/// The "space handle" identity record: a pointer from a human-readable
/// handle to a space's stream id (spec §6 "Identity provider").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceHandleRecord {
    pub stream: StreamDid,
}

#[derive(Debug, snafu::Snafu)]
pub enum IdentityProviderError {
    #[snafu(display("identity provider request failed: {message}"))]
    Request { message: String },
    NotFound,
}
pub type IdentityProviderResult<T> = std::result::Result<T, IdentityProviderError>;

/// Everything the Peer Session needs from the OAuth-style identity
/// provider, named per spec §6 "Identity provider". Only two record kinds
/// are read/written through it; OAuth authorize/callback/restore are the
/// only auth-lifecycle operations it performs.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Restore a session for a previously-authenticated user, e.g. reading
    /// back a refresh token from local storage (spec §4.6 "restore from
    /// the persisted DID").
    async fn restore(&self, user: &UserDid) -> IdentityProviderResult<()>;

    /// App-password based login, used only when `testingHandle` /
    /// `testingAppPassword` are configured (spec §6).
    async fn login_with_test_credentials(
        &self,
        handle: &str,
        app_password: &str,
    ) -> IdentityProviderResult<UserDid>;

    async fn read_personal_stream_record(
        &self,
        user: &UserDid,
    ) -> IdentityProviderResult<Option<PersonalStreamRecord>>;

    async fn write_personal_stream_record(
        &self,
        user: &UserDid,
        record: &PersonalStreamRecord,
    ) -> IdentityProviderResult<()>;

    async fn read_space_handle_record(
        &self,
        handle: &Handle,
    ) -> IdentityProviderResult<Option<SpaceHandleRecord>>;

    async fn write_space_handle_record(
        &self,
        handle: &Handle,
        record: &SpaceHandleRecord,
    ) -> IdentityProviderResult<()>;
}

/// Local persistence for "which user DID was last logged in", so the peer
/// can restore a session across restarts without a fresh OAuth round-trip
/// (spec §4.6 "(b) restore from the persisted DID"). Kept separate from
/// [`IdentityProvider`] because it is purely local state, not a provider
/// call.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn load(&self) -> std::io::Result<Option<UserDid>>;
    async fn save(&self, user: &UserDid) -> std::io::Result<()>;
    async fn clear(&self) -> std::io::Result<()>;
}

/// An in-memory [`SessionStore`], useful for tests and for a "light" peer
/// that never persists across restarts.
#[derive(Default)]
pub struct InMemorySessionStore(tokio::sync::Mutex<Option<UserDid>>);

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> std::io::Result<Option<UserDid>> {
        Ok(self.0.lock().await.clone())
    }

    async fn save(&self, user: &UserDid) -> std::io::Result<()> {
        *self.0.lock().await = Some(user.clone());
        Ok(())
    }

    async fn clear(&self) -> std::io::Result<()> {
        *self.0.lock().await = None;
        Ok(())
    }
}

/// A [`SessionStore`] that persists the logged-in DID as a single file
/// under a data directory, so unattended processes (the CLI, the sync
/// bridge) survive a restart without a fresh OAuth round-trip. Grounded
/// on the teacher CLI's `directories::ProjectDirs`-rooted data directory
/// (`rostra/src/cli.rs`).
pub struct FileSessionStore {
    path: std::path::PathBuf,
}

impl FileSessionStore {
    pub fn new(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { path: data_dir.into().join("session.json") }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> std::io::Result<Option<UserDid>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(contents.trim().parse::<UserDid>().ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        })
        .await
        .expect("blocking task panicked")
    }

    async fn save(&self, user: &UserDid) -> std::io::Result<()> {
        let path = self.path.clone();
        let user = user.to_string();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, user)
        })
        .await
        .expect("blocking task panicked")
    }

    async fn clear(&self) -> std::io::Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        })
        .await
        .expect("blocking task panicked")
    }
}

/// A minimal [`IdentityProvider`] for unattended processes: it never
/// performs a real OAuth exchange (that's the excluded "identity
/// issuance" concern, spec §1 Non-goals), only test-credential login and
/// local JSON-file caching of the two record kinds the Peer Session
/// reads/writes through this trait.
pub struct FileIdentityProvider {
    data_dir: std::path::PathBuf,
}

impl FileIdentityProvider {
    pub fn new(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn personal_stream_path(&self, user: &UserDid) -> std::path::PathBuf {
        self.data_dir.join("personal-stream").join(format!("{}.json", blake3::hash(user.to_string().as_bytes()).to_hex()))
    }

    fn space_handle_path(&self, handle: &Handle) -> std::path::PathBuf {
        self.data_dir.join("space-handle").join(format!("{handle}.json"))
    }

    async fn read_json<T: serde::de::DeserializeOwned + Send + 'static>(
        path: std::path::PathBuf,
    ) -> IdentityProviderResult<Option<T>> {
        tokio::task::spawn_blocking(move || match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|err| IdentityProviderError::Request { message: err.to_string() }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(IdentityProviderError::Request { message: err.to_string() }),
        })
        .await
        .expect("blocking task panicked")
    }

    async fn write_json<T: serde::Serialize + Send + 'static>(path: std::path::PathBuf, value: &T) -> IdentityProviderResult<()> {
        let json = serde_json::to_string(value).map_err(|err| IdentityProviderError::Request { message: err.to_string() })?;
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| IdentityProviderError::Request { message: err.to_string() })?;
            }
            std::fs::write(&path, json).map_err(|err| IdentityProviderError::Request { message: err.to_string() })
        })
        .await
        .expect("blocking task panicked")
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersonalStreamRecordDoc {
    stream: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SpaceHandleRecordDoc {
    stream: String,
}

#[async_trait]
impl IdentityProvider for FileIdentityProvider {
    async fn restore(&self, _user: &UserDid) -> IdentityProviderResult<()> {
        Ok(())
    }

    /// Test-credential login derives a deterministic `UserDid` from the
    /// handle, mirroring `Peer::personal_stream_did`'s derive-by-hash
    /// style rather than contacting a real OAuth provider.
    async fn login_with_test_credentials(&self, handle: &str, _app_password: &str) -> IdentityProviderResult<UserDid> {
        format!("did:web:test-{}", &blake3::hash(handle.as_bytes()).to_hex()[..24])
            .parse()
            .map_err(|_| IdentityProviderError::Request { message: "derived DID was malformed".to_string() })
    }

    async fn read_personal_stream_record(&self, user: &UserDid) -> IdentityProviderResult<Option<PersonalStreamRecord>> {
        let doc: Option<PersonalStreamRecordDoc> = Self::read_json(self.personal_stream_path(user)).await?;
        doc.map(|doc| {
            doc.stream
                .parse()
                .map(|stream| PersonalStreamRecord { stream })
                .map_err(|_| IdentityProviderError::Request { message: "malformed stream did on disk".to_string() })
        })
        .transpose()
    }

    async fn write_personal_stream_record(&self, user: &UserDid, record: &PersonalStreamRecord) -> IdentityProviderResult<()> {
        Self::write_json(self.personal_stream_path(user), &PersonalStreamRecordDoc { stream: record.stream.to_string() }).await
    }

    async fn read_space_handle_record(&self, handle: &Handle) -> IdentityProviderResult<Option<SpaceHandleRecord>> {
        let doc: Option<SpaceHandleRecordDoc> = Self::read_json(self.space_handle_path(handle)).await?;
        doc.map(|doc| {
            doc.stream
                .parse()
                .map(|stream| SpaceHandleRecord { stream })
                .map_err(|_| IdentityProviderError::Request { message: "malformed stream did on disk".to_string() })
        })
        .transpose()
    }

    async fn write_space_handle_record(&self, handle: &Handle, record: &SpaceHandleRecord) -> IdentityProviderResult<()> {
        Self::write_json(self.space_handle_path(handle), &SpaceHandleRecordDoc { stream: record.stream.to_string() }).await
    }
}
