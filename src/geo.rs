// ===============================
// src/geo.rs
// ===============================
//
// Klien geolokasi (ipinfo.io):
//   GET {base}/{ip}
//   Authorization: Bearer <api key>
//   Accept: application/json
//
// Response non-2xx = error keras; tidak ada retry di sini (worker yang memutuskan).
//
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::GeoInfo;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation service answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, address: IpAddr) -> Result<GeoInfo, LookupError>;

    /// Release the session. Called once when the worker stops.
    async fn close(&self) {}
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    hostname: Option<String>,
    org: Option<String>,
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    postal: Option<String>,
    loc: Option<String>,
    timezone: Option<String>,
}

impl From<IpInfoResponse> for GeoInfo {
    fn from(r: IpInfoResponse) -> Self {
        GeoInfo {
            hostname: r.hostname,
            org: r.org,
            country: r.country,
            region: r.region,
            city: r.city,
            postal: r.postal,
            loc: r.loc,
            timezone: r.timezone,
        }
        .normalized()
    }
}

#[derive(Clone, Debug)]
pub struct IpInfoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl IpInfoClient {
    pub fn connect(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpInfoClient {
    async fn lookup(&self, address: IpAddr) -> Result<GeoInfo, LookupError> {
        let url = format!("{}/{}", self.base_url, address);
        let rsp = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if !rsp.status().is_success() {
            let status = rsp.status().as_u16();
            let body = rsp.text().await.unwrap_or_default();
            return Err(LookupError::Status { status, body });
        }
        let body: IpInfoResponse = rsp.json().await?;
        Ok(body.into())
    }
}
