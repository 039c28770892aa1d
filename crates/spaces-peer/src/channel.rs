//! The Event Channel (spec §4.3): an unbounded, multi-producer,
//! single-consumer queue of decoded batches. FIFO within a priority level;
//! `priority` batches pre-empt `background` ones at batch boundaries only
//! (never mid-batch, since the consumer always pulls one whole batch per
//! `recv`).

use spaces_core::id::StreamDid;
use spaces_core::{Event, Ulid};
use spaces_transport::connection::BatchPriority;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct ChannelBatch {
    pub stream: StreamDid,
    pub batch_id: Ulid,
    pub events: Vec<Event>,
    pub is_backfill: bool,
    pub priority: BatchPriority,
}

#[derive(Clone)]
pub struct EventChannelSender {
    priority: mpsc::UnboundedSender<ChannelBatch>,
    background: mpsc::UnboundedSender<ChannelBatch>,
}

impl EventChannelSender {
    /// Enqueues a batch; never blocks (spec §4.3 "no size cap; backpressure
    /// is achieved by the consumer pacing itself").
    pub fn send(&self, batch: ChannelBatch) {
        let tx = match batch.priority {
            BatchPriority::Priority => &self.priority,
            BatchPriority::Background => &self.background,
        };
        // Closed only once the Materializer's drain task has shut down,
        // which only happens alongside the whole peer; dropping the batch
        // at that point is correct, not a bug to propagate.
        let _ = tx.send(batch);
    }
}

pub struct EventChannelReceiver {
    priority: mpsc::UnboundedReceiver<ChannelBatch>,
    background: mpsc::UnboundedReceiver<ChannelBatch>,
}

impl EventChannelReceiver {
    /// Pulls the next batch. Checks the priority queue first on every call
    /// so a priority batch that arrives while background batches are
    /// queued is observed before the next background batch, without ever
    /// interrupting a background batch already being applied.
    pub async fn recv(&mut self) -> Option<ChannelBatch> {
        if let Ok(batch) = self.priority.try_recv() {
            return Some(batch);
        }
        tokio::select! {
            biased;
            batch = self.priority.recv() => batch,
            batch = self.background.recv() => batch,
        }
    }
}

pub fn channel() -> (EventChannelSender, EventChannelReceiver) {
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    let (background_tx, background_rx) = mpsc::unbounded_channel();
    (
        EventChannelSender {
            priority: priority_tx,
            background: background_tx,
        },
        EventChannelReceiver {
            priority: priority_rx,
            background: background_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(priority: BatchPriority) -> ChannelBatch {
        ChannelBatch {
            stream: "did:plc:stream".parse().unwrap(),
            batch_id: Ulid::generate(),
            events: vec![],
            is_backfill: false,
            priority,
        }
    }

    #[tokio::test]
    async fn priority_batch_is_observed_before_queued_background_batches() {
        let (tx, mut rx) = channel();
        tx.send(batch(BatchPriority::Background));
        tx.send(batch(BatchPriority::Background));
        tx.send(batch(BatchPriority::Priority));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.priority, BatchPriority::Priority);
    }

    #[tokio::test]
    async fn background_batches_stay_fifo_among_themselves() {
        let (tx, mut rx) = channel();
        let b1 = batch(BatchPriority::Background);
        let b2 = batch(BatchPriority::Background);
        let id1 = b1.batch_id;
        tx.send(b1);
        tx.send(b2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.batch_id, id1);
    }
}
