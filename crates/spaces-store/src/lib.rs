mod content;
pub mod livequery;
pub mod materializer;
pub mod tables;

use std::ops;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{debug, instrument};

pub use self::content::{ContentDedupError, ContentDedupResult};
pub use self::materializer::{ApplyOutcome, BatchResult, Materializer, MaterializerError};
pub use self::tables::*;
pub use spaces_core::ContentHash;

const LOG_TARGET: &str = "spaces::store";

/// Current schema version string (spec §6 "Persistence layout"). Bumping
/// this triggers a full local rebuild rather than an in-place migration.
pub const SCHEMA_VERSION: &str = "v1";

/// A space's entity id equals its stream's root id (spec §3 "Lifecycle"):
/// there is no separate `createSpace` event, so every consumer that needs
/// to key a row in `comp_space`/`comp_info` off "the space itself" derives
/// the same id from the stream, rather than threading it through events.
pub fn space_entity_id(stream: &spaces_core::id::StreamDid) -> spaces_core::Ulid {
    spaces_core::Ulid::derive_from_bytes(stream.as_did().as_str().as_bytes())
}

/// Wraps a [`WriteTransaction`] with commit hooks, so notifications (touched
/// tables for the Live Query Engine, per-event/per-batch resolvers) fire
/// only once the savepoint is durable — never from inside the transaction
/// (spec §5 "Savepoints").
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;
        dbtx.commit()?;
        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
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
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("schema version too high: db={db_ver} code={code_ver}"))]
    SchemaVersionTooHigh { db_ver: String, code_ver: String },
}
pub type DbResult<T> = std::result::Result<T, DbError>;

/// The set of table names touched by a committed write, published to the
/// [`livequery`] engine so it can re-evaluate only affected queries (spec
/// §4.5).
pub type TouchedTables = Arc<Vec<&'static str>>;

/// Every table in the schema, in the same order [`Database::init_tables_tx`]
/// creates them — used to tell the Live Query Engine a full reset touched
/// everything (spec §3 `dangerousCompletelyDestroyDatabase`).
const ALL_TABLE_NAMES: &[&str] = &[
    "db_version",
    "events_raw",
    "events_by_stream",
    "pending_by_missing_id",
    "content_store",
    "content_rc",
    "entities",
    "comp_room",
    "comp_info",
    "comp_space",
    "comp_user",
    "edges",
    "comp_last_read",
    "comp_message",
    "comp_message_by_room",
    "comp_reaction",
    "comp_reaction_by_target",
    "comp_page",
    "comp_room_link",
    "ids_data_usage",
];

#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,

    reception_order_counter: AtomicU64,

    touched_tables_tx: broadcast::Sender<TouchedTables>,
    new_event_tx: broadcast::Sender<Arc<ApplyOutcome>>,
    /// De-duplicated notifications of "this id is now unparked" — a
    /// dependency id that some parked event was waiting on just resolved.
    /// Mirrors the teacher's `ids_with_missing_events_tx` dedup-channel
    /// pattern, generalized from per-author to per-dependency-id.
    dependency_resolved_tx: tokio::sync::Mutex<dedup_chan::Sender<spaces_core::Ulid>>,
}

impl Database {
    pub fn next_reception_order(&self) -> u64 {
        self.reception_order_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn new_in_memory() -> DbResult<Database> {
        debug!(target: LOG_TARGET, "opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "opening database");
        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    #[instrument(skip_all)]
    async fn open_inner(inner: redb::Database) -> DbResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::check_schema_version_tx(tx)?;
            Ok(())
        })
        .await?;

        let (touched_tables_tx, _) = broadcast::channel(256);
        let (new_event_tx, _) = broadcast::channel(256);

        Ok(Self {
            inner,
            reception_order_counter: AtomicU64::new(0),
            touched_tables_tx,
            new_event_tx,
            dependency_resolved_tx: tokio::sync::Mutex::new(dedup_chan::Sender::new()),
        })
    }

    fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        tx.open_table(&tables::db_version::TABLE)?;
        tx.open_table(&tables::events_raw::TABLE)?;
        tx.open_table(&tables::events_by_stream::TABLE)?;
        tx.open_table(&tables::pending_by_missing_id::TABLE)?;
        tx.open_table(&tables::content_store::TABLE)?;
        tx.open_table(&tables::content_rc::TABLE)?;
        tx.open_table(&tables::entities::TABLE)?;
        tx.open_table(&tables::comp_room::TABLE)?;
        tx.open_table(&tables::comp_info::TABLE)?;
        tx.open_table(&tables::comp_space::TABLE)?;
        tx.open_table(&tables::comp_user::TABLE)?;
        tx.open_table(&tables::edges::TABLE)?;
        tx.open_table(&tables::comp_last_read::TABLE)?;
        tx.open_table(&tables::comp_message::TABLE)?;
        tx.open_table(&tables::comp_message_by_room::TABLE)?;
        tx.open_table(&tables::comp_reaction::TABLE)?;
        tx.open_table(&tables::comp_reaction_by_target::TABLE)?;
        tx.open_table(&tables::comp_page::TABLE)?;
        tx.open_table(&tables::comp_room_link::TABLE)?;
        tx.open_table(&tables::ids_data_usage::TABLE)?;
        Ok(())
    }

    fn check_schema_version_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        let mut table = tx.open_table(&tables::db_version::TABLE)?;
        match table.get(&())? {
            None => {
                table.insert(&(), &SCHEMA_VERSION.to_string())?;
            }
            Some(existing) => {
                let existing = existing.value();
                if existing != SCHEMA_VERSION {
                    return SchemaVersionTooHighSnafu {
                        db_ver: existing,
                        code_ver: SCHEMA_VERSION.to_string(),
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    pub async fn compact(&mut self) -> Result<bool, redb::CompactionError> {
        tokio::task::block_in_place(|| self.inner.as_raw_mut().compact())
    }

    /// Resets the entire local store in place: the sole exception to "no
    /// automatic physical deletion of event history" (spec §3
    /// `dangerousCompletelyDestroyDatabase`). Drops every table the raw
    /// transaction knows about and rebuilds the empty schema, the same
    /// table-rebuild step the teacher's migration does when starting a
    /// schema over from scratch.
    #[instrument(skip_all)]
    pub async fn dangerous_destroy_all(&self) -> DbResult<()> {
        self.write_with(|tx| {
            let table_names: Vec<String> = tx.as_raw().list_tables()?.map(|h| h.name().to_string()).collect();
            for name in &table_names {
                let raw_def = redb::TableDefinition::<&[u8], &[u8]>::new(name);
                tx.as_raw().delete_table(raw_def)?;
            }
            Self::init_tables_tx(tx)?;
            Self::check_schema_version_tx(tx)?;
            self.publish_touched(tx, ALL_TABLE_NAMES.to_vec());
            Ok(())
        })
        .await?;
        self.reception_order_counter.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn touched_tables_subscribe(&self) -> broadcast::Receiver<TouchedTables> {
        self.touched_tables_tx.subscribe()
    }

    pub fn new_event_subscribe(&self) -> broadcast::Receiver<Arc<ApplyOutcome>> {
        self.new_event_tx.subscribe()
    }

    pub async fn dependency_resolved_subscribe(&self, capacity: usize) -> dedup_chan::Receiver<spaces_core::Ulid> {
        self.dependency_resolved_tx.lock().await.subscribe(capacity)
    }

    pub(crate) fn publish_touched(&self, tx: &WriteTransactionCtx, tables: Vec<&'static str>) {
        if tables.is_empty() {
            return;
        }
        let sender = self.touched_tables_tx.clone();
        let touched = Arc::new(tables);
        tx.on_commit(move || {
            let _ = sender.send(touched);
        });
    }

    pub(crate) fn publish_applied(self: &Arc<Self>, tx: &WriteTransactionCtx, outcome: ApplyOutcome) {
        let sender = self.new_event_tx.clone();
        let event_id = outcome.event_id;
        let was_applied = matches!(outcome.result, materializer::EventResult::Applied);
        let outcome = Arc::new(outcome);
        let this = self.clone();
        tx.on_commit(move || {
            let _ = sender.send(outcome);
            if was_applied {
                tokio::spawn(async move {
                    this.dependency_resolved_tx.lock().await.send(event_id).await;
                });
            }
        });
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;
            dbtx.commit().context(CommitSnafu)?;
            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;
            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }

    /// Debug introspection: dump a named table's row count (supplemented
    /// diagnostics feature, mirrors the teacher's `dump_table`).
    pub async fn dump_table(&self, name: &str) -> TableDumpResult<usize> {
        self.read_with(|tx| {
            macro_rules! count {
                ($t:path) => {
                    tx.open_table(&$t)?.len()? as usize
                };
            }
            let count = match name {
                "entities" => count!(tables::entities::TABLE),
                "comp_message" => count!(tables::comp_message::TABLE),
                "comp_room" => count!(tables::comp_room::TABLE),
                "comp_reaction" => count!(tables::comp_reaction::TABLE),
                "events_raw" => count!(tables::events_raw::TABLE),
                _ => return Ok(Err(UnknownTableSnafu { name: name.to_string() }.build())),
            };
            Ok(Ok(count))
        })
        .await
        .expect("storage error")
    }
}

#[derive(Debug, Snafu)]
pub enum TableDumpError {
    #[snafu(display("unknown table `{name}`"))]
    UnknownTable { name: String },
}
pub type TableDumpResult<T> = std::result::Result<T, TableDumpError>;
