// ===============================
// src/main.rs
// ===============================
/*
 # jalankan (kredensial dari .env)
 RUST_LOG=info cargo run --release -- /var/log/nginx/access.log

 # metrics (kalau METRICS_PORT di-set)
 curl -s localhost:9898/metrics | egrep '^(lines_|batches_|notifications_)'
*/
/*
=============================================================================
Project : access_notify_bot: access-log watcher with geolocation alerts
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Watches one access log, groups new requests per origin address,
          enriches each address once via ipinfo (cached in SQLite), and
          sends a per-address summary to a Telegram chat.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod parser;
mod ingest;
mod queue;
mod store;
mod geo;
mod messenger;
mod summary;
mod worker;
mod watcher;
mod lifecycle;
mod pipeline;
#[cfg(test)]
mod testutil;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};
use crate::geo::IpInfoClient;
use crate::messenger::TelegramClient;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::store::AddressStore;
use crate::worker::{Sessions, WorkerSettings};

const EXIT_USAGE: u8 = 1;
const EXIT_NOT_A_FILE: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_STARTUP: u8 = 4;
const EXIT_RUNTIME: u8 = 127;

#[derive(Parser, Debug)]
#[command(version, about = "Tail an access log and send geolocated per-address summaries to Telegram")]
struct Cli {
    /// Access log to watch (combined log format)
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Args ----
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let _ = e.print();
                return ExitCode::from(EXIT_USAGE);
            }
        },
    };
    let Some(file) = cli.file else {
        eprintln!("usage: access_notify_bot <FILE>");
        return ExitCode::from(EXIT_USAGE);
    };
    let log_path = match std::fs::metadata(&file) {
        Ok(meta) if meta.is_file() => file.canonicalize().unwrap_or(file),
        _ => {
            eprintln!("{} is not a regular file", file.display());
            return ExitCode::from(EXIT_NOT_A_FILE);
        }
    };

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(ConfigError::Missing(keys)) => {
            eprintln!("missing required settings:");
            for key in keys {
                eprintln!("  {key}");
            }
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = cfg.metrics_port {
        metrics::serve_metrics(port);
    }

    info!(
        file = %log_path.display(),
        db = %cfg.db_path.display(),
        ipinfo = %cfg.ipinfo_url,
        telegram = %cfg.telegram_url,
        queue_capacity = cfg.queue_capacity,
        parse_policy = ?cfg.parse_policy,
        failure_policy = ?cfg.failure_policy,
        window = ?cfg.window,
        metrics_port = ?cfg.metrics_port,
        "startup config"
    );

    match run(cfg, log_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(cfg: Config, log_path: PathBuf) -> Result<(), u8> {
    let store = AddressStore::open(&cfg.db_path).map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to open store");
        EXIT_STARTUP
    })?;

    // watcher harus tetap hidup selama pipeline jalan
    let (_watcher, events) = watcher::watch_file(&log_path).map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to watch file");
        EXIT_STARTUP
    })?;

    let settings = PipelineSettings {
        log_path,
        queue_capacity: cfg.queue_capacity,
        startup_timeout: cfg.startup_timeout,
        parse_policy: cfg.parse_policy,
        worker: WorkerSettings {
            destination: cfg.telegram_chat_id.clone(),
            poll_interval: cfg.poll_interval,
            failure_policy: cfg.failure_policy,
            window: cfg.window,
        },
    };

    let mut pipeline = Pipeline::start(settings, store, events, connect(cfg))
        .await
        .map_err(|e| {
            error!(error = %e, "startup failed");
            EXIT_STARTUP
        })?;
    info!("pipeline running");

    let outcome = tokio::select! {
        sig = lifecycle::termination_signal() => match sig {
            Ok(name) => {
                info!(signal = name, "termination signal received");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("signal handler failed")),
        },
        res = pipeline.wait() => res,
    };

    let stopped = pipeline.stop().await;
    match outcome.and(stopped) {
        Ok(()) => {
            info!("bye");
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "runtime failure");
            Err(EXIT_RUNTIME)
        }
    }
}

/// Buka kedua sesi HTTP; dijalankan di dalam task worker saat Starting.
async fn connect(cfg: Config) -> anyhow::Result<Sessions> {
    let geo = IpInfoClient::connect(&cfg.ipinfo_url, &cfg.ipinfo_api_key, cfg.http_timeout)
        .context("ipinfo client")?;
    let messenger = TelegramClient::connect(&cfg.telegram_url, &cfg.telegram_api_key, cfg.http_timeout)
        .await
        .context("telegram getMe")?;
    Ok(Sessions { geo: Arc::new(geo), messenger: Arc::new(messenger) })
}
