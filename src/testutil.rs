// ===============================
// src/testutil.rs (test-only fakes)
// ===============================
use async_trait::async_trait;
use chrono::DateTime;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::{AccessRecord, GeoInfo, WorkBatch};
use crate::geo::{GeoLookup, LookupError};
use crate::messenger::{Messenger, SendError};

pub fn access(unix_secs: i64) -> AccessRecord {
    AccessRecord {
        timestamp: DateTime::from_timestamp(unix_secs, 0).unwrap(),
        request: "GET / HTTP/1.1".into(),
        status: 200,
        referrer: None,
        user_agent: "test/1.0".into(),
    }
}

pub fn batch(address: &str, times: &[i64]) -> WorkBatch {
    WorkBatch {
        address: address.parse().unwrap(),
        records: times.iter().map(|t| access(*t)).collect(),
    }
}

/// Combined log line for `address` at `unix_secs` (UTC).
pub fn log_line(address: &str, unix_secs: i64, path: &str) -> String {
    let ts = DateTime::from_timestamp(unix_secs, 0).unwrap();
    format!(
        r#"{address} - - [{}] "GET {path} HTTP/1.1" 200 512 "-" "test/1.0""#,
        ts.format("%d/%b/%Y:%H:%M:%S +0000")
    )
}

pub struct FakeGeo {
    pub calls: AtomicUsize,
    pub closed: AtomicBool,
    fail: bool,
}

impl FakeGeo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), closed: AtomicBool::new(false), fail: false })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), closed: AtomicBool::new(false), fail: true })
    }
}

#[async_trait]
impl GeoLookup for FakeGeo {
    async fn lookup(&self, _address: IpAddr) -> Result<GeoInfo, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LookupError::Status { status: 429, body: "rate limited".into() });
        }
        Ok(GeoInfo {
            city: Some("Testville".into()),
            country: Some("ZZ".into()),
            ..Default::default()
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records every message; fails the call numbers listed in `fail_on` (1-based).
pub struct FakeMessenger {
    pub sent: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
    pub closed: AtomicBool,
    fail_on: Vec<usize>,
}

impl FakeMessenger {
    pub fn new() -> Arc<Self> {
        Self::failing_on(&[])
    }

    pub fn failing_on(calls: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_on: calls.to_vec(),
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send(&self, destination: &str, text: &str) -> Result<(), SendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&n) {
            return Err(SendError::Rejected("chat not found".into()));
        }
        self.sent.lock().unwrap().push((destination.to_string(), text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
