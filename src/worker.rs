// ===============================
// src/worker.rs
// ===============================
//
// Notifier worker (satu-satunya consumer queue):
//
//   NotStarted -> Starting -> Running -> Draining -> Stopped
//
// - Starting : buka sesi kolaborator (geo + messenger). Sukses => kirim ready
//              ke launcher lalu Running. Gagal => lapor lewat ready, tidak pernah Running.
// - Running  : get() dengan timeout pendek; tiap item: find_or_fetch -> merge_accesses
//              -> format summary -> kirim -> done().
// - Draining : shutdown sudah di-trigger; tetap proses sampai queue kosong dan
//              producer (ingestor) sudah tutup.
// - Stopped  : sesi ditutup di semua jalur keluar, termasuk error.
//
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::WorkBatch;
use crate::geo::GeoLookup;
use crate::lifecycle::Shutdown;
use crate::messenger::Messenger;
use crate::metrics::NOTIFICATIONS;
use crate::queue::{Dequeued, QueueReceiver};
use crate::store::{AddressStore, EnrichmentCache};
use crate::summary::{format_summary, to_markdown_v2, TimestampWindow};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Apa yang terjadi kalau lookup / kirim pesan gagal untuk satu item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log + metric, item ditandai done, lanjut ke item berikutnya.
    Skip,
    /// Fail-fast: worker berhenti dengan error, sisa queue tidak diproses.
    Stop,
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub destination: String,
    pub poll_interval: Duration,
    pub failure_policy: FailurePolicy,
    pub window: TimestampWindow,
}

/// Sesi kolaborator yang dimiliki worker dari Starting sampai Stopped.
pub struct Sessions {
    pub geo: Arc<dyn GeoLookup>,
    pub messenger: Arc<dyn Messenger>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("worker failed to establish sessions: {0}")]
    Connect(String),
    #[error("worker not ready after {0:?}")]
    Timeout(Duration),
    #[error("worker exited during startup")]
    Exited,
    #[error("failed to read persisted state: {0}")]
    Store(String),
}

pub struct WorkerHandle {
    state: watch::Receiver<WorkerState>,
    ready: Option<oneshot::Receiver<Result<(), String>>>,
    task: Option<JoinHandle<Result<()>>>,
    // hasil akhir task yang gagal; join() berikutnya mengembalikan error yang sama
    failure: Option<String>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Block until the worker is Running, or fail after `timeout`.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), StartError> {
        let Some(ready) = self.ready.take() else {
            return match self.state() {
                WorkerState::Running | WorkerState::Draining => Ok(()),
                _ => Err(StartError::Exited),
            };
        };
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(StartError::Connect(reason)),
            Ok(Err(_)) => Err(StartError::Exited),
            Err(_) => Err(StartError::Timeout(timeout)),
        }
    }

    /// Wait for the worker task to finish. Cancel-safe; once joined, every later
    /// call repeats the same outcome.
    pub async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return match &self.failure {
                Some(reason) => Err(anyhow!("worker already failed: {reason}")),
                None => Ok(()),
            };
        };
        let res = task.await;
        self.task = None;
        let res = match res {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(anyhow!("worker task panicked: {e}")),
        };
        if let Err(e) = &res {
            self.failure = Some(format!("{e:#}"));
        }
        res
    }

    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct NotifierWorker {
    settings: WorkerSettings,
    queue: QueueReceiver,
    store: AddressStore,
    shutdown: Shutdown,
    state: watch::Sender<WorkerState>,
}

impl NotifierWorker {
    /// Spawn the worker task. `connect` runs inside the task (state Starting).
    pub fn spawn<F>(
        settings: WorkerSettings,
        queue: QueueReceiver,
        store: AddressStore,
        shutdown: Shutdown,
        connect: F,
    ) -> WorkerHandle
    where
        F: Future<Output = Result<Sessions>> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(WorkerState::NotStarted);
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = NotifierWorker { settings, queue, store, shutdown, state: state_tx };
        let task = tokio::spawn(worker.run(connect, ready_tx));
        WorkerHandle { state: state_rx, ready: Some(ready_rx), task: Some(task), failure: None }
    }

    fn set_state(&self, state: WorkerState) {
        debug!(?state, "worker state");
        self.state.send_replace(state);
    }

    async fn run<F>(mut self, connect: F, ready: oneshot::Sender<Result<(), String>>) -> Result<()>
    where
        F: Future<Output = Result<Sessions>>,
    {
        self.set_state(WorkerState::Starting);
        let sessions = match connect.await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %format!("{e:#}"), "worker: session establishment failed");
                let _ = ready.send(Err(format!("{e:#}")));
                self.set_state(WorkerState::Stopped);
                return Err(e.context("session establishment failed"));
            }
        };

        let cache = EnrichmentCache::new(self.store.clone(), sessions.geo.clone());
        self.set_state(WorkerState::Running);
        let _ = ready.send(Ok(()));
        info!(policy = ?self.settings.failure_policy, "worker: running");

        let result = self.process_queue(&cache, sessions.messenger.as_ref()).await;

        // Tutup sesi di semua jalur keluar.
        sessions.messenger.close().await;
        sessions.geo.close().await;
        self.set_state(WorkerState::Stopped);
        match &result {
            Ok(()) => info!("worker: stopped"),
            Err(e) => error!(error = %format!("{e:#}"), "worker: stopped on error"),
        }
        result
    }

    async fn process_queue(
        &mut self,
        cache: &EnrichmentCache,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        loop {
            if self.shutdown.is_triggered() && *self.state.borrow() == WorkerState::Running {
                self.set_state(WorkerState::Draining);
                info!("worker: draining queue");
            }

            let item = match self.queue.get(self.settings.poll_interval).await {
                Dequeued::Item(item) => item,
                Dequeued::Timeout => continue,
                Dequeued::Closed => {
                    if !self.shutdown.is_triggered() {
                        warn!("worker: queue closed without shutdown");
                    }
                    return Ok(());
                }
            };

            match self.notify(cache, messenger, &item.batch).await {
                Ok(()) => {
                    NOTIFICATIONS.with_label_values(&["sent"]).inc();
                }
                Err(e) => {
                    NOTIFICATIONS.with_label_values(&["failed"]).inc();
                    match self.settings.failure_policy {
                        FailurePolicy::Skip => {
                            error!(
                                address = %item.batch.address,
                                error = %format!("{e:#}"),
                                "notification failed; skipping batch"
                            );
                        }
                        FailurePolicy::Stop => return Err(e),
                    }
                }
            }
            item.done();
        }
    }

    async fn notify(
        &self,
        cache: &EnrichmentCache,
        messenger: &dyn Messenger,
        batch: &WorkBatch,
    ) -> Result<()> {
        cache.find_or_fetch(batch.address).await?;
        let record = cache
            .merge_accesses(batch.address, batch.records.clone())
            .await
            .with_context(|| format!("failed to store accesses for {}", batch.address))?;

        let text = to_markdown_v2(&format_summary(&record, self.settings.window));
        messenger
            .send(&self.settings.destination, &text)
            .await
            .with_context(|| format!("dispatch for {} failed", batch.address))?;
        debug!(address = %batch.address, records = batch.records.len(), "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{work_queue, QueueJoin, QueueSender};
    use crate::testutil::{batch, FakeGeo, FakeMessenger};
    use std::sync::atomic::Ordering;

    const READY: Duration = Duration::from_secs(1);

    fn settings(policy: FailurePolicy) -> WorkerSettings {
        WorkerSettings {
            destination: "42".into(),
            poll_interval: Duration::from_millis(20),
            failure_policy: policy,
            window: TimestampWindow::default(),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        tx: QueueSender,
        join: QueueJoin,
        shutdown: Shutdown,
        handle: WorkerHandle,
        geo: Arc<FakeGeo>,
        messenger: Arc<FakeMessenger>,
    }

    fn harness(policy: FailurePolicy, messenger: Arc<FakeMessenger>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = AddressStore::open(dir.path().join("db.sqlite3")).unwrap();
        let (tx, rx, join) = work_queue(16);
        let shutdown = Shutdown::new();
        let geo = FakeGeo::new();
        let sessions = Sessions { geo: geo.clone(), messenger: messenger.clone() };
        let handle = NotifierWorker::spawn(
            settings(policy),
            rx,
            store,
            shutdown.clone(),
            async move { Ok::<_, anyhow::Error>(sessions) },
        );
        Harness { _dir: dir, tx, join, shutdown, handle, geo, messenger }
    }

    #[tokio::test]
    async fn drains_every_accepted_item_before_stopping() {
        let mut h = harness(FailurePolicy::Skip, FakeMessenger::new());
        h.handle.wait_ready(READY).await.unwrap();
        assert_eq!(h.handle.state(), WorkerState::Running);

        for i in 1..=5 {
            h.tx.put(batch(&format!("192.0.2.{i}"), &[1_700_000_000 + i])).await.unwrap();
        }
        h.shutdown.trigger();
        drop(h.tx);

        h.handle.join().await.unwrap();
        assert_eq!(h.handle.state(), WorkerState::Stopped);
        assert_eq!(h.messenger.calls.load(Ordering::SeqCst), 5);
        assert_eq!(h.join.pending(), 0);
        assert!(h.geo.closed.load(Ordering::SeqCst));
        assert!(h.messenger.closed.load(Ordering::SeqCst));

        let sent = h.messenger.sent.lock().unwrap();
        assert!(sent.iter().all(|(dest, _)| dest == "42"));
        assert!(sent[0].1.starts_with("```\n192.0.2.1\n"));
    }

    #[tokio::test]
    async fn repeat_address_reuses_cached_geo_and_grows_history() {
        let mut h = harness(FailurePolicy::Skip, FakeMessenger::new());
        h.handle.wait_ready(READY).await.unwrap();

        h.tx.put(batch("198.51.100.4", &[1_700_000_000])).await.unwrap();
        h.tx.put(batch("198.51.100.4", &[1_700_000_060, 1_700_000_120])).await.unwrap();
        h.shutdown.trigger();
        drop(h.tx);
        h.handle.join().await.unwrap();

        assert_eq!(h.geo.calls.load(Ordering::SeqCst), 1);
        let texts = h.messenger.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].contains("2023-11-14 22:13:20\n2023-11-14 22:14:20\n2023-11-14 22:15:20"));
        assert!(texts[1].contains("city: Testville"));
    }

    #[tokio::test]
    async fn skip_policy_continues_after_failed_dispatch() {
        let mut h = harness(FailurePolicy::Skip, FakeMessenger::failing_on(&[2]));
        h.handle.wait_ready(READY).await.unwrap();

        for i in 1..=3 {
            h.tx.put(batch(&format!("192.0.2.{i}"), &[1_700_000_000 + i])).await.unwrap();
        }
        h.shutdown.trigger();
        drop(h.tx);

        h.handle.join().await.unwrap();
        assert_eq!(h.messenger.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.messenger.texts().len(), 2);
        assert_eq!(h.join.pending(), 0);
    }

    #[tokio::test]
    async fn stop_policy_terminates_and_still_closes_sessions() {
        let mut h = harness(FailurePolicy::Stop, FakeMessenger::failing_on(&[1]));
        // Isi queue dulu: setelah worker gagal, receiver ikut ter-drop.
        for i in 1..=3 {
            h.tx.put(batch(&format!("192.0.2.{i}"), &[1_700_000_000 + i])).await.unwrap();
        }
        h.handle.wait_ready(READY).await.unwrap();

        assert!(h.handle.join().await.is_err());
        // join kedua tidak boleh "lupa" kegagalannya
        assert!(h.handle.join().await.is_err());
        assert_eq!(h.handle.state(), WorkerState::Stopped);
        assert_eq!(h.messenger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.join.pending(), 3);
        assert!(h.geo.closed.load(Ordering::SeqCst));
        assert!(h.messenger.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn connect_failure_is_reported_to_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let store = AddressStore::open(dir.path().join("db.sqlite3")).unwrap();
        let (_tx, rx, _join) = work_queue(4);
        let mut handle = NotifierWorker::spawn(
            settings(FailurePolicy::Skip),
            rx,
            store,
            Shutdown::new(),
            async { Err::<Sessions, _>(anyhow!("401 Unauthorized")) },
        );

        match handle.wait_ready(READY).await {
            Err(StartError::Connect(reason)) => assert!(reason.contains("401")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handle.join().await.is_err());
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn slow_connect_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = AddressStore::open(dir.path().join("db.sqlite3")).unwrap();
        let (_tx, rx, _join) = work_queue(4);
        let mut handle = NotifierWorker::spawn(
            settings(FailurePolicy::Skip),
            rx,
            store,
            Shutdown::new(),
            std::future::pending::<Result<Sessions>>(),
        );

        let wait = Duration::from_millis(50);
        assert!(matches!(handle.wait_ready(wait).await, Err(StartError::Timeout(_))));
        assert_eq!(handle.state(), WorkerState::Starting);
        handle.abort();
        handle.join().await.unwrap();
    }
}
