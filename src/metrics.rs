// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingest --------
pub static LINES_PARSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("log_lines_parsed_total", "log lines parsed").unwrap());

pub static LINES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("log_lines_rejected_total", "log lines not matching the grammar").unwrap()
});

pub static RECORDS_SEEN_BEFORE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "records_below_watermark_total",
        "records dropped because they are at or before the watermark",
    )
    .unwrap()
});

pub static BATCHES_ENQUEUED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("batches_enqueued_total", "per-address batches enqueued").unwrap());

pub static WATERMARK: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("watermark_unix_seconds", "latest ingested access timestamp").unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("work_queue_pending", "batches accepted but not yet processed").unwrap()
});

// -------- Worker --------
pub static GEO_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("geo_lookups_total", "address lookups (label: outcome = hit|miss|error)"),
        &["outcome"],
    )
    .unwrap()
});

pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("notifications_total", "summaries dispatched (label: outcome = sent|failed)"),
        &["outcome"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(LINES_PARSED.clone())),
        REGISTRY.register(Box::new(LINES_REJECTED.clone())),
        REGISTRY.register(Box::new(RECORDS_SEEN_BEFORE.clone())),
        REGISTRY.register(Box::new(BATCHES_ENQUEUED.clone())),
        REGISTRY.register(Box::new(WATERMARK.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(GEO_LOOKUPS.clone())),
        REGISTRY.register(Box::new(NOTIFICATIONS.clone())),
    ] {
        let _ = m;
    }
}

fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        tracing::warn!(?e, "metrics encode failed");
        buf.clear();
    }
    buf
}

/// `GET /metrics` (atau `/`) dapat teks Prometheus; path lain 404.
fn respond(request_line: &str) -> (&'static str, Vec<u8>) {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/" | "/metrics" => ("200 OK", encode_metrics()),
        _ => ("404 Not Found", b"not found\n".to_vec()),
    }
}

fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let head = String::from_utf8_lossy(&req[..n]);
    let (status, body) = respond(head.lines().next().unwrap_or_default());

    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(e) = stream.write_all(header.as_bytes()).and_then(|_| stream.write_all(&body)) {
        tracing::debug!(?e, "metrics client went away");
    }
}

// Metrics server di OS thread terpisah (runtime Tokio tetap bersih)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening on /metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        NOTIFICATIONS.with_label_values(&["sent"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("notifications_total"));
    }

    #[test]
    fn only_metrics_paths_are_served() {
        init();
        assert_eq!(respond("GET /metrics HTTP/1.1").0, "200 OK");
        assert_eq!(respond("GET / HTTP/1.1").0, "200 OK");
        assert_eq!(respond("GET /admin HTTP/1.1").0, "404 Not Found");
    }
}
