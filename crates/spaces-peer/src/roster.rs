//! The stream roster (spec §4.6 "Roster"): the set of streams the peer is
//! subscribed to, their per-stream connection status, and the backoff
//! state driving reconnection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use spaces_core::id::StreamDid;
use spaces_store::Database;
use tokio::sync::watch;
use tokio::time::Instant;

/// Per-space connection status (spec §4.6's stream-roster table,
/// specialized to one entry per joined space; the peer-wide
/// `connectingToServer` / `materializingPersonalSpace` states live on
/// [`crate::auth::AuthState`]'s sibling machine, tracked separately by
/// `Peer` since they describe the *personal* stream, not an arbitrary
/// joined one).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpaceStatus {
    Disconnected,
    Connecting,
    Backfilling,
    Connected,
    Error { message: String },
}

/// Exponential backoff for reconnection, 1s doubling to a 10 minute cap —
/// same shape the teacher's `NodeP2PState` uses for per-node connection
/// backoff, generalized from "per network peer" to "per stream".
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

impl Backoff {
    pub fn duration(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let shift = self.consecutive_failures.saturating_sub(1).min(63);
        let multiplier = 1u64 << shift;
        Duration::from_secs(INITIAL_BACKOFF.as_secs().saturating_mul(multiplier)).min(MAX_BACKOFF)
    }

    pub fn is_in_backoff(&self) -> bool {
        self.backoff_until.is_some_and(|until| Instant::now() < until)
    }

    pub fn remaining(&self) -> Option<Duration> {
        let until = self.backoff_until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.backoff_until = Some(Instant::now() + self.duration());
    }
}

pub struct RosterEntry {
    pub stream: StreamDid,
    status_tx: watch::Sender<SpaceStatus>,
    pub backoff: std::sync::Mutex<Backoff>,
    /// Set once this entry's subscription task should stop (spec §4.2
    /// "unsubscribe").
    pub unsubscribed: std::sync::atomic::AtomicBool,
}

impl RosterEntry {
    pub fn status(&self) -> SpaceStatus {
        self.status_tx.borrow().clone()
    }

    pub fn set_status(&self, status: SpaceStatus) {
        let _ = self.status_tx.send(status);
    }

    pub fn status_subscribe(&self) -> watch::Receiver<SpaceStatus> {
        self.status_tx.subscribe()
    }
}

/// Owned by the peer task (spec §5 "the peer's stream roster is owned by
/// the peer task"). Readers elsewhere get a cloned snapshot or a
/// `watch::Receiver`, never the map itself.
#[derive(Default)]
pub struct StreamRoster {
    entries: RwLock<HashMap<StreamDid, Arc<RosterEntry>>>,
}

impl StreamRoster {
    pub fn entry(&self, stream: &StreamDid) -> Arc<RosterEntry> {
        if let Some(existing) = self.entries.read().expect("poisoned").get(stream) {
            return existing.clone();
        }
        let mut entries = self.entries.write().expect("poisoned");
        entries
            .entry(stream.clone())
            .or_insert_with(|| {
                let (status_tx, _rx) = watch::channel(SpaceStatus::Disconnected);
                Arc::new(RosterEntry {
                    stream: stream.clone(),
                    status_tx,
                    backoff: std::sync::Mutex::new(Backoff::default()),
                    unsubscribed: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .clone()
    }

    pub fn remove(&self, stream: &StreamDid) {
        self.entries.write().expect("poisoned").remove(stream);
    }

    pub fn contains(&self, stream: &StreamDid) -> bool {
        self.entries.read().expect("poisoned").contains_key(stream)
    }

    pub fn statuses(&self) -> HashMap<StreamDid, SpaceStatus> {
        self.entries
            .read()
            .expect("poisoned")
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status()))
            .collect()
    }
}

/// Scans a stream's raw event log for `joinSpace`/`leaveSpace` and returns
/// the set currently joined (last event per referenced space wins). Used
/// only against the *personal* stream (spec §4.6 "Roster": "the peer
/// queries the local store for the set of joined spaces (derived from
/// `joinSpace` events applied there)"). `joinSpace`/`leaveSpace` are
/// deliberately not materialized into any relational table (see
/// `spaces_store::materializer`), so this reads the raw per-stream event
/// log directly rather than a projection.
pub async fn joined_spaces(db: &Database, personal_stream: &StreamDid) -> spaces_store::DbResult<Vec<StreamDid>> {
    use spaces_core::event::EventVariant;

    let stream_key = spaces_store::stream_key(personal_stream);
    let raw_events: Vec<Vec<u8>> = db
        .read_with(move |tx| {
            let by_stream = tx.open_table(&spaces_store::events_by_stream::TABLE)?;
            let events_raw = tx.open_table(&spaces_store::events_raw::TABLE)?;
            let mut out = Vec::new();
            let lower = (stream_key.clone(), spaces_core::Ulid::ZERO);
            let upper = (stream_key.clone(), spaces_core::Ulid::from_bytes([0xffu8; 16]));
            for row in by_stream.range(lower..=upper)? {
                let (key, _) = row?;
                let (_, event_id) = key.value();
                if let Some(raw) = events_raw.get(&event_id)? {
                    out.push(raw.value().encoded);
                }
            }
            Ok(out)
        })
        .await?;

    let mut joined: HashMap<StreamDid, bool> = HashMap::new();
    for raw in raw_events {
        let Ok(event) = spaces_core::parse(&raw) else {
            continue;
        };
        match event.variant {
            EventVariant::JoinSpace(p) => {
                joined.insert(p.space, true);
            }
            EventVariant::LeaveSpace(p) => {
                joined.insert(p.space, false);
            }
            _ => {}
        }
    }

    Ok(joined
        .into_iter()
        .filter_map(|(stream, is_joined)| is_joined.then_some(stream))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::default();
        assert_eq!(b.duration(), Duration::ZERO);
        b.record_failure();
        assert_eq!(b.duration(), Duration::from_secs(1));
        b.record_failure();
        assert_eq!(b.duration(), Duration::from_secs(2));
        for _ in 0..20 {
            b.record_failure();
        }
        assert_eq!(b.duration(), MAX_BACKOFF);
        b.record_success();
        assert_eq!(b.duration(), Duration::ZERO);
        assert!(!b.is_in_backoff());
    }

    #[tokio::test]
    async fn joined_spaces_respects_leave_after_join() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let personal: StreamDid = "did:plc:alice".parse().unwrap();
        let space_a: StreamDid = "did:plc:space-a".parse().unwrap();
        let space_b: StreamDid = "did:plc:space-b".parse().unwrap();

        let materializer = spaces_store::Materializer::new(db.clone());
        let join_a = spaces_core::Event::new(
            spaces_core::Ulid::generate(),
            None,
            spaces_core::event::EventVariant::JoinSpace(spaces_core::event::JoinSpace {
                space: space_a.clone(),
            }),
        );
        let join_b = spaces_core::Event::new(
            spaces_core::Ulid::generate(),
            None,
            spaces_core::event::EventVariant::JoinSpace(spaces_core::event::JoinSpace {
                space: space_b.clone(),
            }),
        );
        let leave_b = spaces_core::Event::new(
            spaces_core::Ulid::generate(),
            None,
            spaces_core::event::EventVariant::LeaveSpace(spaces_core::event::LeaveSpace {
                space: space_b.clone(),
            }),
        );
        materializer
            .apply_batch(&personal, vec![join_a, join_b, leave_b])
            .await
            .unwrap();

        let joined = joined_spaces(&db, &personal).await.unwrap();
        assert_eq!(joined, vec![space_a]);
    }
}
