//! Live Query Engine (spec §4.5): queries re-evaluated and pushed whenever
//! a table they reference is touched by a materialization commit.
//!
//! A query is any closure over a [`ReadTransaction`] that returns its
//! encoded result; the engine itself has no notion of SQL — it only knows
//! which table names a statement declares it reads, so it can skip
//! re-running queries unaffected by a given commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use redb_bincode::ReadTransaction;
use tokio::sync::mpsc;
use tracing::{instrument, trace, warn};

use crate::{Database, DbResult, TouchedTables};

const LOG_TARGET: &str = "spaces::store::livequery";

pub type QueryId = u64;

/// A registered query: the set of tables it reads, and how to run it.
pub trait LiveStatement: Send + Sync + 'static {
    fn tables(&self) -> &[&'static str];
    fn run(&self, tx: &ReadTransaction) -> DbResult<Vec<u8>>;
}

impl<F> LiveStatement for (Vec<&'static str>, F)
where
    F: Fn(&ReadTransaction) -> DbResult<Vec<u8>> + Send + Sync + 'static,
{
    fn tables(&self) -> &[&'static str] {
        &self.0
    }

    fn run(&self, tx: &ReadTransaction) -> DbResult<Vec<u8>> {
        (self.1)(tx)
    }
}

struct Registered {
    statement: Arc<dyn LiveStatement>,
    result_tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct Inner {
    db: Arc<Database>,
    queries: Mutex<HashMap<QueryId, Registered>>,
}

/// Runs on the storage worker alongside the [`crate::materializer::Materializer`];
/// `on_touched` is driven by [`Database::touched_tables_subscribe`].
#[derive(Clone)]
pub struct LiveQueryEngine {
    inner: Arc<Inner>,
}

impl LiveQueryEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                queries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawns the task that re-evaluates queries after each commit. Queries
    /// execute between materialization transactions, never inside one
    /// (spec §4.5, §5 "Savepoints").
    pub fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.inner.db.touched_tables_subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(touched) => engine.on_touched(&touched).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagging(n)) => {
                        warn!(target: LOG_TARGET, skipped = n, "live query dispatcher lagged, re-running all queries");
                        engine.reevaluate_all().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Registers `statement`, runs it once, and pushes the initial result.
    /// Returns a [`LiveQueryLease`]: the query lives only as long as the
    /// lease is held (spec §4.5 "scoped acquisition").
    #[instrument(skip_all, fields(id = id))]
    pub async fn create_live_query(
        &self,
        id: QueryId,
        statement: Arc<dyn LiveStatement>,
        result_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> DbResult<LiveQueryLease> {
        let initial = self.run_one(&statement).await?;
        let _ = result_tx.send(initial);

        self.inner.queries.lock().expect("poisoned").insert(
            id,
            Registered {
                statement,
                result_tx,
            },
        );

        Ok(LiveQueryLease {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Explicit teardown, in addition to the lease's `Drop` (idempotent:
    /// calling it twice, or letting the lease drop after, is a no-op).
    pub fn delete_live_query(&self, id: QueryId) {
        self.inner.queries.lock().expect("poisoned").remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.inner.queries.lock().expect("poisoned").len()
    }

    async fn on_touched(&self, touched: &TouchedTables) {
        let affected: Vec<(QueryId, Arc<dyn LiveStatement>, mpsc::UnboundedSender<Vec<u8>>)> = {
            let queries = self.inner.queries.lock().expect("poisoned");
            queries
                .iter()
                .filter(|(_, reg)| reg.statement.tables().iter().any(|t| touched.contains(t)))
                .map(|(id, reg)| (*id, reg.statement.clone(), reg.result_tx.clone()))
                .collect()
        };
        for (id, statement, result_tx) in affected {
            match self.run_one(&statement).await {
                Ok(result) => {
                    trace!(target: LOG_TARGET, id, "re-evaluated live query");
                    let _ = result_tx.send(result);
                }
                Err(err) => warn!(target: LOG_TARGET, id, %err, "live query re-evaluation failed"),
            }
        }
    }

    async fn reevaluate_all(&self) {
        let all: Vec<(Arc<dyn LiveStatement>, mpsc::UnboundedSender<Vec<u8>>)> = {
            let queries = self.inner.queries.lock().expect("poisoned");
            queries
                .values()
                .map(|reg| (reg.statement.clone(), reg.result_tx.clone()))
                .collect()
        };
        for (statement, result_tx) in all {
            if let Ok(result) = self.run_one(&statement).await {
                let _ = result_tx.send(result);
            }
        }
    }

    async fn run_one(&self, statement: &Arc<dyn LiveStatement>) -> DbResult<Vec<u8>> {
        let statement = statement.clone();
        self.inner.db.read_with(move |tx| statement.run(tx)).await
    }
}

/// Held by the subscriber. Dropping it tears down the query (spec §4.5,
/// §8 scenario 6 "Live query teardown") — the teacher's source polls leases
/// from a background task; a `Drop` impl gives the same guarantee
/// synchronously and without a poll loop, since redb/tokio state here is
/// plain owned data, not something a poll needs to reconcile against.
pub struct LiveQueryLease {
    inner: Arc<Inner>,
    id: QueryId,
}

impl Drop for LiveQueryLease {
    fn drop(&mut self) {
        self.inner.queries.lock().expect("poisoned").remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;

    #[tokio::test]
    async fn live_query_reruns_on_touched_table() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let engine = LiveQueryEngine::new(db.clone());
        let _dispatcher = engine.spawn_dispatcher();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let statement: Arc<dyn LiveStatement> = Arc::new((
            vec!["comp_room"],
            |tx: &ReadTransaction| -> DbResult<Vec<u8>> {
                let table = tx.open_table(&tables::comp_room::TABLE)?;
                Ok(vec![table.len()? as u8])
            },
        ));
        let lease = engine.create_live_query(1, statement, tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![0]);

        db.write_with(|wtx| {
            let mut t = wtx.open_table(&tables::comp_room::TABLE)?;
            t.insert(
                &spaces_core::Ulid::generate(),
                &tables::CompRoom {
                    kind: tables::RoomKind::Channel,
                    label: "general".into(),
                    deleted: false,
                },
            )?;
            db.publish_touched(wtx, vec!["comp_room"]);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![1]);
        drop(lease);
        assert_eq!(engine.active_count(), 0);
    }
}
