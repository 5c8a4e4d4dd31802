// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// Satu baris access log yang sudah di-parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,
    pub request: String,
    pub status: u16,
    pub referrer: Option<String>,
    pub user_agent: String,
}

/// Metadata geolokasi; semua field opsional, placeholder "-" / kosong = None.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub hostname: Option<String>,
    pub org: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub postal: Option<String>,
    pub loc: Option<String>,
    pub timezone: Option<String>,
}

impl GeoInfo {
    /// Normalize placeholder values ("-" or blank) to absent.
    pub fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.filter(|s| {
                let t = s.trim();
                !t.is_empty() && t != "-"
            })
        }
        Self {
            hostname: clean(self.hostname),
            org: clean(self.org),
            country: clean(self.country),
            region: clean(self.region),
            city: clean(self.city),
            postal: clean(self.postal),
            loc: clean(self.loc),
            timezone: clean(self.timezone),
        }
    }
}

/// Entri per alamat asal: enrichment + riwayat akses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: IpAddr,
    pub geo: GeoInfo,
    pub accesses: Vec<AccessRecord>,
}

impl AddressRecord {
    pub fn new(address: IpAddr, geo: GeoInfo) -> Self {
        Self { address, geo, accesses: Vec::new() }
    }
}

/// Record baru untuk satu alamat dari satu siklus ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkBatch { pub address: IpAddr, pub records: Vec<AccessRecord> }

/// Sentinel "awal waktu" untuk watermark saat store masih kosong.
pub fn beginning_of_time() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}
