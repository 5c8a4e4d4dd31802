// ===============================
// src/ingest.rs
// ===============================
//
// Ingestor berbasis watermark:
// - Tiap event "file modified" => baca ulang SELURUH file (bukan tail per offset).
// - Record dengan timestamp <= watermark dibuang (satu-satunya mekanisme dedup).
// - Record baru dikelompokkan per alamat (urutan kedatangan dipertahankan).
// - Satu WorkBatch per alamat di-put ke queue (blocking saat queue penuh).
// - Watermark dimajukan SETELAH semua batch masuk queue, tidak pernah mundur.
//
use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{AccessRecord, WorkBatch};
use crate::lifecycle::Shutdown;
use crate::metrics::{
    BATCHES_ENQUEUED, LINES_PARSED, LINES_REJECTED, RECORDS_SEEN_BEFORE, WATERMARK,
};
use crate::parser::{parse_line, ParseError};
use crate::queue::{QueueError, QueueSender};
use crate::watcher::FileEvent;

/// Apa yang dilakukan saat satu baris tidak cocok dengan grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsePolicy {
    /// Batalkan seluruh siklus: tidak ada yang di-enqueue, watermark tetap.
    Abort,
    /// Lewati baris itu (log warn + metric), proses sisanya.
    Skip,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: ParseError,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("shutdown requested while enqueueing")]
    Cancelled,
}

/// Timestamp terakhir yang sudah di-enqueue. Monoton, tidak pernah mundur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn new(ts: DateTime<Utc>) -> Self {
        Self(ts)
    }

    pub fn get(&self) -> DateTime<Utc> {
        self.0
    }

    fn advance(&mut self, ts: DateTime<Utc>) {
        if ts > self.0 {
            self.0 = ts;
        }
    }
}

/// Hasil satu siklus parse: batch per alamat + timestamp maksimum yang selamat.
#[derive(Debug, Default)]
pub struct Cycle {
    pub batches: Vec<WorkBatch>,
    pub latest: Option<DateTime<Utc>>,
    pub rejected: usize,
}

/// Pure part of a cycle: parse, gate on the watermark, group by address.
pub fn collect_batches(
    content: &str,
    watermark: Watermark,
    policy: ParsePolicy,
) -> Result<Cycle, IngestError> {
    let mut order: Vec<IpAddr> = Vec::new();
    let mut groups: HashMap<IpAddr, Vec<AccessRecord>> = HashMap::new();
    let mut cycle = Cycle::default();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (address, record) = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(source) => {
                LINES_REJECTED.inc();
                match policy {
                    ParsePolicy::Abort => return Err(IngestError::Parse { line: idx + 1, source }),
                    ParsePolicy::Skip => {
                        warn!(line = idx + 1, error = %source, "skipping malformed log line");
                        cycle.rejected += 1;
                        continue;
                    }
                }
            }
        };
        LINES_PARSED.inc();

        if record.timestamp <= watermark.get() {
            RECORDS_SEEN_BEFORE.inc();
            continue;
        }
        cycle.latest = cycle.latest.max(Some(record.timestamp));
        groups
            .entry(address)
            .or_insert_with(|| {
                order.push(address);
                Vec::new()
            })
            .push(record);
    }

    cycle.batches = order
        .into_iter()
        .filter_map(|address| {
            groups.remove(&address).map(|records| WorkBatch { address, records })
        })
        .collect();
    Ok(cycle)
}

pub struct Ingestor {
    path: PathBuf,
    watermark: Watermark,
    queue: QueueSender,
    policy: ParsePolicy,
    shutdown: Shutdown,
}

impl Ingestor {
    pub fn new(
        path: PathBuf,
        watermark: Watermark,
        queue: QueueSender,
        policy: ParsePolicy,
        shutdown: Shutdown,
    ) -> Self {
        WATERMARK.set(watermark.get().timestamp());
        Self { path, watermark, queue, policy, shutdown }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Satu siklus ingest. Mengembalikan jumlah batch yang di-enqueue.
    pub async fn on_modified(&mut self, path: &Path) -> Result<usize, IngestError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| IngestError::Read { path: path.to_path_buf(), source })?;
        // Byte non-UTF-8 jadi U+FFFD; baris rusak jatuh ke parse policy, bukan seluruh file.
        let content = String::from_utf8_lossy(&bytes);

        let cycle = collect_batches(&content, self.watermark, self.policy)?;
        let Some(latest) = cycle.latest else {
            debug!(path = %path.display(), "no new records");
            return Ok(0);
        };

        let count = cycle.batches.len();
        for batch in cycle.batches {
            debug!(address = %batch.address, records = batch.records.len(), "enqueue batch");
            tokio::select! {
                res = self.queue.put(batch) => res?,
                _ = self.shutdown.cancelled() => return Err(IngestError::Cancelled),
            }
            BATCHES_ENQUEUED.inc();
        }

        self.watermark.advance(latest);
        WATERMARK.set(self.watermark.get().timestamp());
        info!(
            batches = count,
            rejected = cycle.rejected,
            watermark = %self.watermark.get(),
            "ingested new records"
        );
        Ok(count)
    }

    /// Loop ingest: konsumsi event file sampai shutdown atau sumber event tutup.
    pub async fn run(mut self, mut events: mpsc::Receiver<FileEvent>) -> Result<()> {
        info!(path = %self.path.display(), watermark = %self.watermark.get(), "ingestor started");
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                ev = events.recv() => ev,
            };
            let Some(FileEvent::Modified(changed)) = event else {
                bail!("file event source closed");
            };
            debug!(path = %changed.display(), "file modified");
            // Event yang menumpuk cukup ditangani sekali: file dibaca ulang penuh.
            while let Ok(FileEvent::Modified(_)) = events.try_recv() {}

            let path = self.path.clone();
            match self.on_modified(&path).await {
                Ok(_) => {}
                Err(IngestError::Cancelled) => break,
                Err(IngestError::Queue(e)) => {
                    return Err(e).context("work queue is gone");
                }
                Err(e) => error!(error = %e, "ingest cycle aborted"),
            }
        }
        info!(watermark = %self.watermark().get(), "ingestor stopped");
        Ok(())
    }
}
