// ===============================
// src/pipeline.rs
// ===============================
//
// Merakit ingestor + queue + worker dan mengatur siklus hidupnya:
// - start(): worker harus Running (batas waktu) sebelum ingestor dijalankan;
//            watermark di-seed dari store.
// - wait() : selesai kalau salah satu task keluar sendiri (error runtime).
// - stop() : trigger shutdown -> tunggu ingestor -> tunggu worker Stopped
//            -> tunggu queue kosong. Idempoten.
//
use anyhow::{anyhow, Result};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ingest::{Ingestor, ParsePolicy, Watermark};
use crate::lifecycle::Shutdown;
use crate::queue::{work_queue, QueueJoin};
use crate::store::AddressStore;
use crate::watcher::FileEvent;
use crate::worker::{NotifierWorker, Sessions, StartError, WorkerHandle, WorkerSettings};

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub log_path: PathBuf,
    pub queue_capacity: usize,
    pub startup_timeout: Duration,
    pub parse_policy: ParsePolicy,
    pub worker: WorkerSettings,
}

pub struct Pipeline {
    shutdown: Shutdown,
    ingest: Option<JoinHandle<Result<()>>>,
    worker: WorkerHandle,
    queue: QueueJoin,
}

enum Exited {
    Ingest(Result<()>),
    Worker(Result<()>),
}

fn flatten(res: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(res) => res,
        Err(e) => Err(anyhow!("task panicked: {e}")),
    }
}

impl Pipeline {
    pub async fn start<F>(
        settings: PipelineSettings,
        store: AddressStore,
        events: mpsc::Receiver<FileEvent>,
        connect: F,
    ) -> Result<Self, StartError>
    where
        F: Future<Output = Result<Sessions>> + Send + 'static,
    {
        let shutdown = Shutdown::new();
        let (tx, rx, queue) = work_queue(settings.queue_capacity);

        let mut worker =
            NotifierWorker::spawn(settings.worker.clone(), rx, store.clone(), shutdown.clone(), connect);
        if let Err(e) = worker.wait_ready(settings.startup_timeout).await {
            shutdown.trigger();
            worker.abort();
            return Err(e);
        }

        let seed = match store.latest_access_timestamp().await {
            Ok(ts) => ts,
            Err(e) => {
                shutdown.trigger();
                drop(tx);
                let _ = worker.join().await;
                return Err(StartError::Store(format!("{e:#}")));
            }
        };
        info!(watermark = %seed, "watermark seeded from store");

        let ingestor = Ingestor::new(
            settings.log_path.clone(),
            Watermark::new(seed),
            tx,
            settings.parse_policy,
            shutdown.clone(),
        );
        let ingest = tokio::spawn(ingestor.run(events));

        Ok(Self { shutdown, ingest: Some(ingest), worker, queue })
    }

    /// Resolves when the ingestor or the worker exits without being asked to.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(ingest) = self.ingest.as_mut() else {
            return self.worker.join().await;
        };
        let exited = tokio::select! {
            res = ingest => Exited::Ingest(flatten(res)),
            res = self.worker.join() => Exited::Worker(res),
        };
        match exited {
            Exited::Ingest(res) => {
                self.ingest = None;
                res.and(Err(anyhow!("ingestor exited unexpectedly")))
            }
            Exited::Worker(res) => res.and(Err(anyhow!("worker exited unexpectedly"))),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.trigger();

        let mut result = Ok(());
        if let Some(ingest) = self.ingest.take() {
            if let Err(e) = flatten(ingest.await) {
                error!(error = %format!("{e:#}"), "ingestor failed");
                result = Err(e);
            }
        }

        match self.worker.join().await {
            Ok(()) => {
                self.queue.join().await;
                info!("pipeline stopped; queue drained");
            }
            Err(e) => {
                warn!(abandoned = self.queue.pending(), "worker failed; queue not drained");
                result = result.and(Err(e));
            }
        }
        result
    }
}
