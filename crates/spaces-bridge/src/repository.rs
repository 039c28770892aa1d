//! The bridge's own redb-bincode store: the identifier mapping, dedup
//! index, webhook cache, backfill cursors, and per-guild configuration
//! defined in [`crate::tables`].
//!
//! This is deliberately a separate database file from the space's own
//! `spaces_store::Database` (opened by the embedded [`spaces_peer::Peer`]):
//! the bridge's bookkeeping is Discord-side state, not part of the space's
//! replicated log, and must survive independently of which spaces the
//! bridge happens to be connected to at a given moment. Grounded on the
//! teacher's `BotDatabase` (`rostra-bot/src/database.rs`), which wraps its
//! own `ClientDatabase` the same way rather than reusing the client's.

use std::path::PathBuf;

use snafu::{Location, ResultExt as _, Snafu};
use spaces_core::{ContentHash, Ulid};

use crate::tables::{self, BridgeMode, GuildBridgeConfig, WebhookRecord};

#[derive(Debug, Snafu)]
pub enum RepositoryError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table { source: redb::TableError },
    #[snafu(transparent)]
    Storage { source: redb::StorageError },
    Join {
        source: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

pub struct Repository {
    inner: redb_bincode::Database,
}

impl Repository {
    pub async fn open(path: impl Into<PathBuf>) -> RepositoryResult<Self> {
        let path = path.into();
        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;
        Self::from_raw(inner).await
    }

    pub async fn new_in_memory() -> RepositoryResult<Self> {
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::from_raw(inner).await
    }

    async fn from_raw(inner: redb::Database) -> RepositoryResult<Self> {
        let inner = redb_bincode::Database::from(inner);
        let this = Self { inner };
        this.write_with(|tx| {
            tx.open_table(&tables::id_map_forward::TABLE)?;
            tx.open_table(&tables::id_map_reverse::TABLE)?;
            tx.open_table(&tables::webhook_by_channel::TABLE)?;
            tx.open_table(&tables::content_hash_index::TABLE)?;
            tx.open_table(&tables::backfill_cursor::TABLE)?;
            tx.open_table(&tables::guild_bridge::TABLE)?;
            Ok(())
        })
        .await?;
        Ok(this)
    }

    async fn write_with<T: Send + 'static>(
        &self,
        f: impl FnOnce(&redb_bincode::WriteTransaction) -> RepositoryResult<T> + Send + 'static,
    ) -> RepositoryResult<T>
    where
        T: 'static,
    {
        tokio::task::block_in_place(|| {
            let tx = self.inner.begin_write().context(TransactionSnafu)?;
            let res = f(&tx)?;
            tx.commit().context(CommitSnafu)?;
            Ok(res)
        })
    }

    async fn read_with<T>(
        &self,
        f: impl FnOnce(&redb_bincode::ReadTransaction) -> RepositoryResult<T>,
    ) -> RepositoryResult<T> {
        tokio::task::block_in_place(|| {
            let tx = self.inner.begin_read().context(TransactionSnafu)?;
            f(&tx)
        })
    }

    // -- identifier mapping (spec §4.7 "Identifier mapping") -----------

    /// Looks up the Roomy id already mapped to a Discord-side key, if any.
    pub async fn mapped_id(&self, discord_key: String) -> RepositoryResult<Option<Ulid>> {
        self.read_with(move |tx| {
            let table = tx.open_table(&tables::id_map_forward::TABLE)?;
            Ok(table.get(&discord_key)?.map(|g| g.value()))
        })
        .await
    }

    /// Looks up the Discord-side key already mapped to a Roomy id, if any.
    pub async fn mapped_discord_key(&self, roomy_id: Ulid) -> RepositoryResult<Option<String>> {
        self.read_with(move |tx| {
            let table = tx.open_table(&tables::id_map_reverse::TABLE)?;
            Ok(table.get(&roomy_id)?.map(|g| g.value()))
        })
        .await
    }

    /// Registers a new Discord-id <-> Roomy-id pair. Idempotent: re-inserting
    /// the same pair is a no-op other than overwriting with an identical
    /// value (spec §4.7: "Each translation is idempotent via the mapping
    /// table").
    pub async fn insert_mapping(&self, discord_key: String, roomy_id: Ulid) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut forward = tx.open_table(&tables::id_map_forward::TABLE)?;
            forward.insert(&discord_key, &roomy_id)?;
            let mut reverse = tx.open_table(&tables::id_map_reverse::TABLE)?;
            reverse.insert(&roomy_id, &discord_key)?;
            Ok(())
        })
        .await
    }

    // -- webhook cache (spec §4.7 "Egress") -----------------------------

    pub async fn webhook_for_channel(&self, channel_id: u64) -> RepositoryResult<Option<WebhookRecord>> {
        self.read_with(move |tx| {
            let table = tx.open_table(&tables::webhook_by_channel::TABLE)?;
            Ok(table.get(&channel_id)?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_webhook_for_channel(&self, channel_id: u64, record: WebhookRecord) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&tables::webhook_by_channel::TABLE)?;
            table.insert(&channel_id, &record)?;
            Ok(())
        })
        .await
    }

    pub async fn clear_webhook_for_channel(&self, channel_id: u64) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&tables::webhook_by_channel::TABLE)?;
            table.remove(&channel_id)?;
            Ok(())
        })
        .await
    }

    // -- content-hash dedup index (spec §4.7 "Egress" step 3) -----------

    pub async fn discord_message_for_hash(
        &self,
        channel_id: u64,
        hash: ContentHash,
    ) -> RepositoryResult<Option<u64>> {
        self.read_with(move |tx| {
            let table = tx.open_table(&tables::content_hash_index::TABLE)?;
            Ok(table.get(&(channel_id, hash))?.map(|g| g.value()))
        })
        .await
    }

    pub async fn index_content_hash(
        &self,
        channel_id: u64,
        hash: ContentHash,
        discord_message_id: u64,
    ) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&tables::content_hash_index::TABLE)?;
            table.insert(&(channel_id, hash), &discord_message_id)?;
            Ok(())
        })
        .await
    }

    // -- backfill cursor --------------------------------------------------

    pub async fn backfill_cursor(&self, channel_id: u64) -> RepositoryResult<Option<u64>> {
        self.read_with(move |tx| {
            let table = tx.open_table(&tables::backfill_cursor::TABLE)?;
            Ok(table.get(&channel_id)?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_backfill_cursor(&self, channel_id: u64, last_message_id: u64) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&tables::backfill_cursor::TABLE)?;
            table.insert(&channel_id, &last_message_id)?;
            Ok(())
        })
        .await
    }

    // -- per-guild bridge configuration ------------------------------------

    pub async fn guild_bridge(&self, guild_id: u64) -> RepositoryResult<Option<GuildBridgeConfig>> {
        self.read_with(move |tx| {
            let table = tx.open_table(&tables::guild_bridge::TABLE)?;
            Ok(table.get(&guild_id)?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_guild_bridge(&self, guild_id: u64, config: GuildBridgeConfig) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&tables::guild_bridge::TABLE)?;
            table.insert(&guild_id, &config)?;
            Ok(())
        })
        .await
    }

    pub async fn remove_guild_bridge(&self, guild_id: u64) -> RepositoryResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&tables::guild_bridge::TABLE)?;
            table.remove(&guild_id)?;
            Ok(())
        })
        .await
    }

    pub async fn all_guild_bridges(&self) -> RepositoryResult<Vec<(u64, GuildBridgeConfig)>> {
        self.read_with(|tx| {
            let table = tx.open_table(&tables::guild_bridge::TABLE)?;
            let mut out = Vec::new();
            for g in table.iter()? {
                let (k, v) = g?;
                out.push((k.value(), v.value()));
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::WebhookRecord;

    #[tokio::test]
    async fn mapping_round_trips_both_directions() {
        let repo = Repository::new_in_memory().await.unwrap();
        let id = Ulid::generate();
        repo.insert_mapping("msg:123".to_string(), id).await.unwrap();
        assert_eq!(repo.mapped_id("msg:123".to_string()).await.unwrap(), Some(id));
        assert_eq!(repo.mapped_discord_key(id).await.unwrap(), Some("msg:123".to_string()));
    }

    #[tokio::test]
    async fn mapping_insert_is_idempotent() {
        let repo = Repository::new_in_memory().await.unwrap();
        let id = Ulid::generate();
        repo.insert_mapping("msg:123".to_string(), id).await.unwrap();
        repo.insert_mapping("msg:123".to_string(), id).await.unwrap();
        assert_eq!(repo.mapped_id("msg:123".to_string()).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn webhook_cache_clears() {
        let repo = Repository::new_in_memory().await.unwrap();
        repo.set_webhook_for_channel(1, WebhookRecord { webhook_id: 9, token: "t".into() })
            .await
            .unwrap();
        assert!(repo.webhook_for_channel(1).await.unwrap().is_some());
        repo.clear_webhook_for_channel(1).await.unwrap();
        assert!(repo.webhook_for_channel(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_hash_index_round_trips() {
        let repo = Repository::new_in_memory().await.unwrap();
        let hash = ContentHash::of(b"hello");
        repo.index_content_hash(7, hash, 42).await.unwrap();
        assert_eq!(repo.discord_message_for_hash(7, hash).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn guild_bridge_config_round_trips() {
        let repo = Repository::new_in_memory().await.unwrap();
        repo.set_guild_bridge(
            555,
            GuildBridgeConfig { space_stream: "did:key:abc".into(), mode: BridgeMode::Full, subset_role_id: None },
        )
        .await
        .unwrap();
        let cfg = repo.guild_bridge(555).await.unwrap().unwrap();
        assert_eq!(cfg.space_stream, "did:key:abc");
        assert_eq!(repo.all_guild_bridges().await.unwrap().len(), 1);
    }
}
