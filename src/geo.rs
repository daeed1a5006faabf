//! Geolocation enrichment
//!
//! Resolves a source address to geo fields via an ipapi-style upstream.
//! Lookups are bounded (timeout + concurrency cap) and cached; failures
//! are absorbed into an `unresolved` result so enrichment can never stall
//! or fail the ingest path.

use std::net::IpAddr;
use std::time::Duration;

use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::GeoConfig;

/// How long excess callers wait for a lookup slot before giving up.
const ACQUIRE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeoStatus {
    Resolved,
    #[default]
    Unresolved,
    Private,
}

/// Enrichment result merged into the event before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoFields {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
    pub organization: Option<String>,
    pub timezone: Option<String>,
    pub is_private: bool,
    pub status: GeoStatus,
}

impl GeoFields {
    pub fn private() -> Self {
        Self { is_private: true, status: GeoStatus::Private, ..Default::default() }
    }

    pub fn unresolved() -> Self {
        Self { status: GeoStatus::Unresolved, ..Default::default() }
    }
}

/// Upstream response shape (ipapi.co). Everything is optional; a marked
/// error body counts as a failed lookup.
#[derive(Debug, Deserialize)]
struct LookupResponse {
    country_name: Option<String>,
    region: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    timezone: Option<String>,
    org: Option<String>,
    error: Option<bool>,
}

#[derive(Debug)]
enum LookupError {
    Upstream(reqwest::Error),
    Status(u16),
    Marked,
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        LookupError::Upstream(err)
    }
}

/// Negative entries expire quickly so a recovered upstream is retried;
/// resolved entries live for the configured positive TTL.
struct GeoExpiry {
    positive: Duration,
    negative: Duration,
}

impl Expiry<String, GeoFields> for GeoExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &GeoFields,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        match value.status {
            GeoStatus::Unresolved => Some(self.negative),
            _ => Some(self.positive),
        }
    }
}

pub struct GeoEnricher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    cache: Cache<String, GeoFields>,
    semaphore: Semaphore,
}

impl GeoEnricher {
    pub fn new(cfg: &GeoConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(cfg.cache_size)
            .expire_after(GeoExpiry {
                positive: Duration::from_secs(cfg.positive_ttl_secs),
                negative: Duration::from_secs(cfg.negative_ttl_secs),
            })
            .build();

        Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(cfg.timeout_ms),
            cache,
            semaphore: Semaphore::new(cfg.concurrency),
        }
    }

    /// Resolve geo fields for an address. Infallible: on any failure the
    /// event proceeds with an unresolved result.
    pub async fn enrich(&self, address: &str) -> GeoFields {
        match address.parse::<IpAddr>() {
            Ok(ip) if is_private_address(ip) => return GeoFields::private(),
            Ok(_) => {}
            // Not a routable address; nothing to look up.
            Err(_) => return GeoFields::unresolved(),
        }

        if self.base_url.is_empty() {
            return GeoFields::unresolved();
        }

        if let Some(hit) = self.cache.get(address) {
            return hit;
        }

        // Bounded upstream parallelism. Callers that cannot get a slot in
        // time proceed unresolved without poisoning the negative cache.
        let permit = tokio::time::timeout(ACQUIRE_WAIT, self.semaphore.acquire()).await;
        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            _ => return GeoFields::unresolved(),
        };

        let fields = match self.lookup(address).await {
            Ok(fields) => fields,
            Err(err) => {
                tracing::warn!(address, ?err, "geo lookup failed");
                GeoFields::unresolved()
            }
        };
        self.cache.insert(address.to_string(), fields.clone());
        fields
    }

    async fn lookup(&self, address: &str) -> Result<GeoFields, LookupError> {
        let url = format!("{}/{}/json/", self.base_url, address);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;

        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }

        let body: LookupResponse = response.json().await?;
        if body.error == Some(true) {
            return Err(LookupError::Marked);
        }

        Ok(GeoFields {
            country: body.country_name,
            region: body.region,
            city: body.city,
            latitude: body.latitude,
            longitude: body.longitude,
            isp: body.org.clone(),
            organization: body.org,
            timezone: body.timezone,
            is_private: false,
            status: GeoStatus::Resolved,
        })
    }

    pub fn cache_size(&self) -> u64 {
        self.cache.entry_count()
    }
}

/// Non-routable ranges never leave the process: RFC1918, loopback,
/// link-local, and IPv6 unique-local.
fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || (seg[0] & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || (seg[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}
