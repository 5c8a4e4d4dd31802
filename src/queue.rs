// ===============================
// src/queue.rs
// ===============================
//
// Bounded FIFO antara ingestor (producer) dan notifier worker (consumer).
// - put()  : tunggu kapasitas (backpressure), tidak pernah drop data.
// - get()  : tunggu item dengan batas waktu, supaya worker bisa cek shutdown.
// - join() : selesai saat semua item yang diterima sudah ditandai done().
//
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::domain::WorkBatch;
use crate::metrics::QUEUE_DEPTH;

pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue closed")]
    Closed,
}

/// Hitungan item yang sudah diterima tapi belum done().
#[derive(Debug)]
struct Pending(watch::Sender<usize>);

impl Pending {
    fn add(&self) {
        self.0.send_modify(|n| *n += 1);
        QUEUE_DEPTH.set(self.get() as i64);
    }
    fn done(&self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
        QUEUE_DEPTH.set(self.get() as i64);
    }
    fn get(&self) -> usize {
        *self.0.borrow()
    }
}

#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<WorkBatch>,
    pending: Arc<Pending>,
}

pub struct QueueReceiver {
    rx: mpsc::Receiver<WorkBatch>,
    pending: Arc<Pending>,
}

/// Handle untuk menunggu queue kosong (semua item done).
#[derive(Clone)]
pub struct QueueJoin {
    pending: Arc<Pending>,
}

pub enum Dequeued {
    Item(WorkItem),
    Timeout,
    Closed,
}

/// Item yang sedang diproses; wajib `done()` setelah selesai.
pub struct WorkItem {
    pub batch: WorkBatch,
    pending: Arc<Pending>,
}

impl WorkItem {
    pub fn done(self) {
        self.pending.done();
    }
}

pub fn work_queue(capacity: usize) -> (QueueSender, QueueReceiver, QueueJoin) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (count_tx, _) = watch::channel(0usize);
    let pending = Arc::new(Pending(count_tx));
    (
        QueueSender { tx, pending: pending.clone() },
        QueueReceiver { rx, pending: pending.clone() },
        QueueJoin { pending },
    )
}

impl QueueSender {
    /// Blocks (async) while the queue is full. Cancel-safe: nothing is counted
    /// until a slot has been reserved.
    pub async fn put(&self, batch: WorkBatch) -> Result<(), QueueError> {
        let permit = self.tx.reserve().await.map_err(|_| QueueError::Closed)?;
        self.pending.add();
        permit.send(batch);
        Ok(())
    }
}

impl QueueReceiver {
    pub async fn get(&mut self, wait: Duration) -> Dequeued {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(batch)) => Dequeued::Item(WorkItem { batch, pending: self.pending.clone() }),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::Timeout,
        }
    }
}

impl QueueJoin {
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    pub async fn join(&self) {
        let mut rx = self.pending.0.subscribe();
        // Sender hidup selama `self` hidup, jadi wait_for tidak bisa error di sini.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
