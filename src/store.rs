// ===============================
// src/store.rs
// ===============================
//
// Store alamat (SQLite) + cache enrichment di atasnya.
//
// Tabel:
//   addresses(address PK, hostname, org, country, region, city, postal, loc, timezone)
//   accesses(id, address FK, timestamp (unix detik, UTC), request, status, referrer, user_agent)
//
// Semua query jalan di spawn_blocking dengan koneksi per panggilan (mode WAL).
// Store hanya dipakai oleh notifier worker, plus satu query seed watermark saat startup.
//
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;
use tracing::debug;

use crate::domain::{beginning_of_time, AccessRecord, AddressRecord, GeoInfo};
use crate::geo::GeoLookup;
use crate::metrics::GEO_LOOKUPS;

#[derive(Debug, Clone)]
pub struct AddressStore {
    path: Arc<PathBuf>,
}

impl AddressStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        let conn = open_connection(&path)?;
        initialize_schema(&conn)?;

        Ok(Self { path: Arc::new(path) })
    }

    pub async fn get(&self, address: IpAddr) -> Result<Option<AddressRecord>> {
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            load_record(&conn, address)
        })
        .await
        .context("store get join error")?
    }

    pub async fn insert(&self, record: &AddressRecord) -> Result<()> {
        let db_path = self.path.clone();
        let record = record.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction().context("failed to begin insert transaction")?;
            let g = &record.geo;
            tx.execute(
                "
                INSERT INTO addresses (
                    address, hostname, org, country, region, city, postal, loc, timezone
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
                params![
                    record.address.to_string(),
                    g.hostname,
                    g.org,
                    g.country,
                    g.region,
                    g.city,
                    g.postal,
                    g.loc,
                    g.timezone
                ],
            )
            .with_context(|| format!("failed to insert address {}", record.address))?;
            insert_accesses(&tx, record.address, &record.accesses)?;
            tx.commit().context("failed to commit insert")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("store insert join error")??;

        Ok(())
    }

    /// Append access records and return the updated address record.
    pub async fn append_accesses(
        &self,
        address: IpAddr,
        records: Vec<AccessRecord>,
    ) -> Result<AddressRecord> {
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction().context("failed to begin append transaction")?;
            insert_accesses(&tx, address, &records)?;
            let record = load_record(&tx, address)?
                .ok_or_else(|| anyhow!("address {address} is not in the store"))?;
            tx.commit().context("failed to commit access records")?;
            Ok::<_, anyhow::Error>(record)
        })
        .await
        .context("store append join error")?
    }

    pub async fn latest_access_timestamp(&self) -> Result<DateTime<Utc>> {
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let latest: Option<i64> = conn
                .query_row("SELECT MAX(timestamp) FROM accesses", [], |row| row.get(0))
                .context("failed to query latest access")?;
            match latest {
                Some(secs) => from_unix(secs),
                None => Ok(beginning_of_time()),
            }
        })
        .await
        .context("store latest join error")?
    }
}

/// Cache enrichment: hit dari store, miss => satu kali panggil kolaborator geolokasi.
pub struct EnrichmentCache {
    store: AddressStore,
    geo: Arc<dyn GeoLookup>,
}

impl EnrichmentCache {
    pub fn new(store: AddressStore, geo: Arc<dyn GeoLookup>) -> Self {
        Self { store, geo }
    }

    pub async fn find_or_fetch(&self, address: IpAddr) -> Result<AddressRecord> {
        if let Some(record) = self.store.get(address).await? {
            GEO_LOOKUPS.with_label_values(&["hit"]).inc();
            return Ok(record);
        }

        let geo = match self.geo.lookup(address).await {
            Ok(g) => g,
            Err(e) => {
                GEO_LOOKUPS.with_label_values(&["error"]).inc();
                return Err(e).with_context(|| format!("lookup of {address} failed"));
            }
        };
        GEO_LOOKUPS.with_label_values(&["miss"]).inc();
        debug!(%address, "fetched geolocation");

        let record = AddressRecord::new(address, geo);
        self.store.insert(&record).await?;
        Ok(record)
    }

    pub async fn merge_accesses(
        &self,
        address: IpAddr,
        records: Vec<AccessRecord>,
    ) -> Result<AddressRecord> {
        self.store.append_accesses(address, records).await
    }
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp {secs} out of range"))
}

fn insert_accesses(conn: &Connection, address: IpAddr, records: &[AccessRecord]) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(
            "
            INSERT INTO accesses (address, timestamp, request, status, referrer, user_agent)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .context("failed to prepare access insert")?;
    let key = address.to_string();
    for r in records {
        stmt.execute(params![
            key,
            r.timestamp.timestamp(),
            r.request,
            r.status,
            r.referrer,
            r.user_agent
        ])
        .context("failed to insert access record")?;
    }
    Ok(())
}

fn geo_from_row(row: &Row<'_>) -> rusqlite::Result<GeoInfo> {
    Ok(GeoInfo {
        hostname: row.get(0)?,
        org: row.get(1)?,
        country: row.get(2)?,
        region: row.get(3)?,
        city: row.get(4)?,
        postal: row.get(5)?,
        loc: row.get(6)?,
        timezone: row.get(7)?,
    })
}

fn load_record(conn: &Connection, address: IpAddr) -> Result<Option<AddressRecord>> {
    let key = address.to_string();
    let geo = conn
        .query_row(
            "
            SELECT hostname, org, country, region, city, postal, loc, timezone
            FROM addresses
            WHERE address = ?1
            ",
            params![key],
            geo_from_row,
        )
        .optional()
        .context("failed to query addresses table")?;

    let Some(geo) = geo else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare_cached(
            "
            SELECT timestamp, request, status, referrer, user_agent
            FROM accesses
            WHERE address = ?1
            ORDER BY id
            ",
        )
        .context("failed to prepare access select")?;
    let rows = stmt
        .query_map(params![key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u16>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .context("failed to query accesses table")?;

    let mut accesses = Vec::new();
    for row in rows {
        let (secs, request, status, referrer, user_agent) = row.context("bad access row")?;
        accesses.push(AccessRecord {
            timestamp: from_unix(secs)?,
            request,
            status,
            referrer,
            user_agent,
        });
    }

    Ok(Some(AddressRecord { address, geo, accesses }))
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open store db {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL mode for store db")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set store db synchronous mode")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;

    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS addresses (
            address TEXT PRIMARY KEY NOT NULL,
            hostname TEXT,
            org TEXT,
            country TEXT,
            region TEXT,
            city TEXT,
            postal TEXT,
            loc TEXT,
            timezone TEXT
        );
        CREATE TABLE IF NOT EXISTS accesses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL REFERENCES addresses(address) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            request TEXT NOT NULL,
            status INTEGER NOT NULL,
            referrer TEXT,
            user_agent TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS accesses_timestamp ON accesses(timestamp);
        CREATE INDEX IF NOT EXISTS accesses_address ON accesses(address);
        ",
    )
    .context("failed to create store tables")?;

    Ok(())
}
