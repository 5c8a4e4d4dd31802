// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : access_notify_bot: access-log watcher with geolocation alerts
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Watches one access log, groups new requests per origin address,
          enriches each address once via ipinfo (cached in SQLite), and
          sends a per-address summary to a Telegram chat.
=============================================================================
*/
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::ingest::ParsePolicy;
use crate::queue::DEFAULT_CAPACITY;
use crate::summary::TimestampWindow;
use crate::worker::FailurePolicy;

pub const REQUIRED_KEYS: [&str; 3] = ["IPINFO_API_KEY", "TELEGRAM_API_KEY", "TELEGRAM_USER_ID"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: String, value: String },
}

impl ParsePolicy {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Some(ParsePolicy::Abort),
            "skip" => Some(ParsePolicy::Skip),
            _ => None,
        }
    }
}

impl FailurePolicy {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "continue" => Some(FailurePolicy::Skip),
            "stop" | "fail_fast" => Some(FailurePolicy::Stop),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // kredensial / tujuan
    pub ipinfo_api_key: String,
    pub telegram_api_key: String,
    pub telegram_chat_id: String,

    // endpoint
    pub ipinfo_url: String,
    pub telegram_url: String,
    pub http_timeout: Duration,

    // state
    pub db_path: PathBuf,

    // pipeline
    pub queue_capacity: usize,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub parse_policy: ParsePolicy,
    pub failure_policy: FailurePolicy,
    pub window: TimestampWindow,

    // metrics
    pub metrics_port: Option<u16>,
}

/// Baca `.env` (kalau ada) lalu environment proses.
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenv();
    from_lookup(|key| env::var(key).ok())
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn policy<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parse: fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => parse(&raw).ok_or_else(|| ConfigError::Invalid { key: key.to_string(), value: raw.clone() }),
    }
}

/// Pure loader over a key lookup so it can be tested without touching the process env.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    // ===== Wajib =====
    let required: Vec<Option<String>> = REQUIRED_KEYS
        .iter()
        .map(|k| lookup(k).filter(|v| !v.trim().is_empty()))
        .collect();
    let missing: Vec<String> = REQUIRED_KEYS
        .iter()
        .zip(&required)
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| k.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::Missing(missing));
    }
    let mut required = required.into_iter().flatten();
    let ipinfo_api_key = required.next().unwrap_or_default();
    let telegram_api_key = required.next().unwrap_or_default();
    let telegram_chat_id = required.next().unwrap_or_default();

    // ===== Endpoint =====
    let ipinfo_url = lookup("IPINFO_URL").unwrap_or_else(|| "https://ipinfo.io".to_string());
    let telegram_url =
        lookup("TELEGRAM_URL").unwrap_or_else(|| "https://api.telegram.org".to_string());
    let http_timeout = Duration::from_secs(parsed(&lookup, "HTTP_TIMEOUT_SECS", 10u64)?);

    let db_path = PathBuf::from(lookup("DB_PATH").unwrap_or_else(|| "db.sqlite3".to_string()));

    // ===== Pipeline =====
    let queue_capacity = parsed(&lookup, "QUEUE_CAPACITY", DEFAULT_CAPACITY)?;
    if queue_capacity == 0 {
        return Err(ConfigError::Invalid { key: "QUEUE_CAPACITY".into(), value: "0".into() });
    }
    let startup_timeout = Duration::from_millis(parsed(&lookup, "STARTUP_TIMEOUT_MS", 1000u64)?);
    let poll_interval = Duration::from_millis(parsed(&lookup, "POLL_INTERVAL_MS", 1000u64)?);
    let parse_policy = policy(&lookup, "ON_PARSE_ERROR", ParsePolicy::Skip, ParsePolicy::parse_one)?;
    let failure_policy =
        policy(&lookup, "ON_NOTIFY_ERROR", FailurePolicy::Skip, FailurePolicy::parse_one)?;

    let defaults = TimestampWindow::default();
    let window = TimestampWindow {
        older: parsed(&lookup, "SUMMARY_OLDER", defaults.older)?,
        newer: parsed(&lookup, "SUMMARY_NEWER", defaults.newer)?,
    };

    let metrics_port = match lookup("METRICS_PORT") {
        None => None,
        Some(_) => Some(parsed(&lookup, "METRICS_PORT", 0u16)?),
    };

    Ok(Config {
        ipinfo_api_key,
        telegram_api_key,
        telegram_chat_id,
        ipinfo_url,
        telegram_url,
        http_timeout,
        db_path,
        queue_capacity,
        startup_timeout,
        poll_interval,
        parse_policy,
        failure_policy,
        window,
        metrics_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("IPINFO_API_KEY", "ipinfo-token"),
        ("TELEGRAM_API_KEY", "123:abc"),
        ("TELEGRAM_USER_ID", "987654"),
    ];

    #[test]
    fn reports_every_missing_key() {
        let err = from_lookup(lookup_from(&[("TELEGRAM_API_KEY", "123:abc")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["IPINFO_API_KEY".into(), "TELEGRAM_USER_ID".into()])
        );
    }

    #[test]
    fn defaults_apply() {
        let cfg = from_lookup(lookup_from(&REQUIRED)).unwrap();
        assert_eq!(cfg.telegram_chat_id, "987654");
        assert_eq!(cfg.queue_capacity, 32);
        assert_eq!(cfg.startup_timeout, Duration::from_secs(1));
        assert_eq!(cfg.parse_policy, ParsePolicy::Skip);
        assert_eq!(cfg.failure_policy, FailurePolicy::Skip);
        assert_eq!(cfg.window, TimestampWindow { older: 1, newer: 2 });
        assert_eq!(cfg.db_path, PathBuf::from("db.sqlite3"));
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn overrides_and_invalid_values() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([("QUEUE_CAPACITY", "8"), ("ON_NOTIFY_ERROR", "stop"), ("METRICS_PORT", "9899")]);
        let cfg = from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.failure_policy, FailurePolicy::Stop);
        assert_eq!(cfg.metrics_port, Some(9899));

        let mut bad = REQUIRED.to_vec();
        bad.push(("ON_PARSE_ERROR", "ignore"));
        assert!(matches!(
            from_lookup(lookup_from(&bad)),
            Err(ConfigError::Invalid { key, .. }) if key == "ON_PARSE_ERROR"
        ));
    }
}
