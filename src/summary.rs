// ===============================
// src/summary.rs
// ===============================
use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::domain::AddressRecord;

/// Berapa timestamp terlama / terbaru yang ditampilkan sebelum diringkas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampWindow {
    pub older: usize,
    pub newer: usize,
}

impl Default for TimestampWindow {
    fn default() -> Self {
        Self { older: 1, newer: 2 }
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_access_times(record: &AddressRecord, window: TimestampWindow) -> String {
    let mut times: Vec<&DateTime<Utc>> = record.accesses.iter().map(|a| &a.timestamp).collect();
    times.sort();

    // Satu baris "... N more ..." hanya masuk akal kalau menyembunyikan >1 baris.
    if times.len() <= window.older + 1 + window.newer {
        return times.iter().map(|t| fmt_ts(t)).collect::<Vec<_>>().join("\n");
    }

    let hidden = times.len() - window.older - window.newer;
    let mut lines: Vec<String> = times[..window.older].iter().map(|t| fmt_ts(t)).collect();
    lines.push(format!("... {hidden} more ..."));
    lines.extend(times[times.len() - window.newer..].iter().map(|t| fmt_ts(t)));
    lines.join("\n")
}

pub fn format_info(record: &AddressRecord) -> String {
    let g = &record.geo;
    let fields = [
        ("city", &g.city),
        ("region", &g.region),
        ("country", &g.country),
        ("postal", &g.postal),
        ("loc", &g.loc),
        ("timezone", &g.timezone),
        ("org", &g.org),
        ("hostname", &g.hostname),
    ];
    let mut out = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{key}: {}", value.as_deref().unwrap_or("-"));
    }
    out
}

pub fn format_summary(record: &AddressRecord, window: TimestampWindow) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        record.address,
        format_access_times(record, window),
        format_info(record)
    )
}

/// Summary sebagai blok pre MarkdownV2; di dalam blok hanya ` dan \ yang perlu di-escape.
pub fn to_markdown_v2(summary: &str) -> String {
    let mut out = String::with_capacity(summary.len() + 8);
    out.push_str("```\n");
    for ch in summary.chars() {
        if ch == '`' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push_str("\n```");
    out
}
