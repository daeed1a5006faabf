//! Event record: canonical form, content hash, and store access
//!
//! An event is created by ingest and immutable afterwards. Deduplication
//! is content-based: the SHA-256 of the canonical identity tuple is the
//! unique key, so producer retries collapse to one stored row.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::config::Bands;
use crate::error::{AppError, AppResult};
use crate::geo::GeoFields;

pub const MAX_ADDRESS_LEN: usize = 64;
pub const MAX_ACTION_LEN: usize = 64;
pub const MAX_USER_AGENT_LEN: usize = 1024;
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Hard cap on `limit` query parameters.
pub const MAX_QUERY_LIMIT: i64 = 10_000;

/// Wire format accepted by the ingest endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    pub observed_at: Option<String>,
    pub source_address: Option<String>,
    pub protocol: Option<String>,
    pub target_service: Option<String>,
    pub action: Option<String>,
    pub target_path: Option<String>,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub payload: Option<serde_json::Value>,
}

/// Canonical event. Produced by [`canonicalize`]; field values are
/// normalized (UTC timestamps, lowercased tags, trimmed strings) so the
/// content hash is stable across producer formatting differences.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub observed_at: DateTime<Utc>,
    pub source_address: String,
    pub protocol: String,
    pub target_service: String,
    pub action: String,
    pub target_path: Option<String>,
    pub session_id: String,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: serde_json::Value,
    /// Canonical serialization of `payload` (sorted keys), bounded.
    pub payload_json: String,
}

/// Timestamps are stored and emitted in this canonical form.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn required<'a>(value: &'a Option<String>, field: &str) -> AppResult<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::Schema(format!("missing required field: {field}"))),
    }
}

fn bounded(value: &str, field: &str, max: usize) -> AppResult<()> {
    if value.len() > max {
        return Err(AppError::Schema(format!("{field} exceeds {max} bytes")));
    }
    Ok(())
}

/// Validate and normalize a raw record into a canonical [`Event`].
pub fn canonicalize(raw: &RawEvent) -> AppResult<Event> {
    let observed_at = required(&raw.observed_at, "observed_at")?;
    let observed_at = DateTime::parse_from_rfc3339(observed_at)
        .map_err(|_| AppError::Schema("observed_at is not an ISO-8601 timestamp".into()))?
        .with_timezone(&Utc);

    let source_address = required(&raw.source_address, "source_address")?;
    bounded(source_address, "source_address", MAX_ADDRESS_LEN)?;

    let target_service = required(&raw.target_service, "target_service")?.to_lowercase();

    let action = required(&raw.action, "action")?.to_lowercase();
    bounded(&action, "action", MAX_ACTION_LEN)?;

    let session_id = required(&raw.session_id, "session_id")?;

    let protocol = raw
        .protocol
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or("HTTP")
        .to_string();

    let target_path = raw
        .target_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let user_agent = raw
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|ua| !ua.is_empty())
        .map(str::to_string);
    if let Some(ua) = &user_agent {
        bounded(ua, "user_agent", MAX_USER_AGENT_LEN)?;
    }

    let payload = raw.payload.clone().unwrap_or_else(|| serde_json::json!({}));
    // serde_json maps use sorted keys, so this serialization is canonical.
    let payload_json = serde_json::to_string(&payload)
        .map_err(|err| AppError::Internal(format!("payload serialization: {err}")))?;
    if payload_json.len() > MAX_PAYLOAD_BYTES {
        return Err(AppError::PayloadTooLarge);
    }

    Ok(Event {
        observed_at,
        source_address: source_address.to_string(),
        protocol,
        target_service,
        action,
        target_path,
        session_id: session_id.to_string(),
        user_agent,
        headers: raw.headers.clone().unwrap_or_default(),
        payload,
        payload_json,
    })
}

/// SHA-256 over the fixed-order identity tuple. Present fields are
/// length-delimited; a missing field contributes a single sentinel byte,
/// keeping the encoding injective.
pub fn content_hash(event: &Event) -> String {
    const MISSING: [u8; 1] = [0x00];

    let observed = format_ts(event.observed_at);
    let fields: [Option<&str>; 7] = [
        Some(observed.as_str()),
        Some(event.source_address.as_str()),
        Some(event.target_service.as_str()),
        Some(event.action.as_str()),
        event.target_path.as_deref(),
        Some(event.session_id.as_str()),
        Some(event.payload_json.as_str()),
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        match field {
            Some(value) => {
                hasher.update((value.len() as u64).to_be_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update(MISSING),
        }
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// SCORE TYPES
// ============================================================================

/// Discrete risk level derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Band {
    Minimal,
    Low,
    Medium,
    High,
}

impl Band {
    /// Total function of the score value over the configured cutoffs.
    pub fn from_value(value: f64, bands: &Bands) -> Band {
        if value >= bands.high {
            Band::High
        } else if value >= bands.medium {
            Band::Medium
        } else if value >= bands.low {
            Band::Low
        } else {
            Band::Minimal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Minimal => "MINIMAL",
            Band::Low => "LOW",
            Band::Medium => "MEDIUM",
            Band::High => "HIGH",
        }
    }
}

/// Attack taxonomy. Indicator-driven labels outrank model-only labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackClass {
    Exploit,
    CredentialAccess,
    DataExfil,
    Recon,
    KnownMalicious,
    UnknownAnomaly,
    Benign,
}

impl AttackClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackClass::Exploit => "EXPLOIT",
            AttackClass::CredentialAccess => "CREDENTIAL_ACCESS",
            AttackClass::DataExfil => "DATA_EXFIL",
            AttackClass::Recon => "RECON",
            AttackClass::KnownMalicious => "KNOWN_MALICIOUS",
            AttackClass::UnknownAnomaly => "UNKNOWN_ANOMALY",
            AttackClass::Benign => "BENIGN",
        }
    }
}

/// Ensemble output attached to an event. The serialized form is the
/// `score` block producers see; the bookkeeping fields are stored only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    pub value: f64,
    pub band: Band,
    pub is_anomaly: bool,
    pub predicted_class: AttackClass,
    pub traffic_class: Option<String>,
    #[serde(skip)]
    pub anomaly_component: Option<f64>,
    #[serde(skip)]
    pub degraded: bool,
}

// ============================================================================
// STORE ACCESS
// ============================================================================

/// A fully assembled record ready for insertion.
pub struct NewEvent<'a> {
    pub event: &'a Event,
    pub geo: &'a GeoFields,
    pub score: &'a Score,
    pub content_hash: &'a str,
    pub ingested_at: DateTime<Utc>,
}

impl NewEvent<'_> {
    /// Insert with first-writer-wins dedup. Returns whether a row was
    /// actually written; `false` means the hash already existed.
    pub async fn insert(&self, pool: &SqlitePool) -> Result<bool, sqlx::Error> {
        let headers_json =
            serde_json::to_string(&self.event.headers).unwrap_or_else(|_| "{}".to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO events (
                observed_at, ingested_at, source_address,
                geo_country, geo_region, geo_city, geo_latitude, geo_longitude,
                geo_isp, geo_org, geo_timezone, geo_is_private,
                protocol, target_service, action, target_path, session_id,
                user_agent, headers, payload,
                score, band, is_anomaly, predicted_class, traffic_class,
                anomaly_component, scoring_degraded, content_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(format_ts(self.event.observed_at))
        .bind(format_ts(self.ingested_at))
        .bind(&self.event.source_address)
        .bind(&self.geo.country)
        .bind(&self.geo.region)
        .bind(&self.geo.city)
        .bind(self.geo.latitude)
        .bind(self.geo.longitude)
        .bind(&self.geo.isp)
        .bind(&self.geo.organization)
        .bind(&self.geo.timezone)
        .bind(self.geo.is_private)
        .bind(&self.event.protocol)
        .bind(&self.event.target_service)
        .bind(&self.event.action)
        .bind(&self.event.target_path)
        .bind(&self.event.session_id)
        .bind(&self.event.user_agent)
        .bind(headers_json)
        .bind(&self.event.payload_json)
        .bind(self.score.value)
        .bind(self.score.band.as_str())
        .bind(self.score.is_anomaly)
        .bind(self.score.predicted_class.as_str())
        .bind(&self.score.traffic_class)
        .bind(self.score.anomaly_component)
        .bind(self.score.degraded)
        .bind(self.content_hash)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert, retrying once on an engine-transient failure.
    pub async fn insert_with_retry(&self, pool: &SqlitePool) -> AppResult<bool> {
        match self.insert(pool).await {
            Ok(inserted) => Ok(inserted),
            Err(err) => {
                let mapped = AppError::from(err);
                if !matches!(mapped, AppError::StoreTransient(_)) {
                    return Err(mapped);
                }
                tracing::warn!("transient store failure, retrying write once");
                self.insert(pool).await.map_err(AppError::from)
            }
        }
    }
}

/// A stored event as returned by the query endpoints.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub observed_at: String,
    pub ingested_at: String,
    pub source_address: String,
    pub geo_country: Option<String>,
    pub geo_region: Option<String>,
    pub geo_city: Option<String>,
    pub geo_latitude: Option<f64>,
    pub geo_longitude: Option<f64>,
    pub geo_isp: Option<String>,
    pub geo_org: Option<String>,
    pub geo_timezone: Option<String>,
    pub geo_is_private: bool,
    pub protocol: String,
    pub target_service: String,
    pub action: String,
    pub target_path: Option<String>,
    pub session_id: String,
    pub user_agent: Option<String>,
    pub headers: sqlx::types::Json<BTreeMap<String, String>>,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub score: f64,
    pub band: String,
    pub is_anomaly: bool,
    pub predicted_class: String,
    pub traffic_class: Option<String>,
    pub anomaly_component: Option<f64>,
    pub scoring_degraded: bool,
    pub content_hash: String,
}

impl EventRow {
    /// Most recent events, optionally filtered by source and score.
    pub async fn live(
        pool: &SqlitePool,
        limit: i64,
        source: Option<&str>,
        min_score: Option<f64>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM events
            WHERE (?1 IS NULL OR source_address = ?1)
              AND (?2 IS NULL OR score >= ?2)
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )
        .bind(source)
        .bind(min_score)
        .bind(limit.clamp(0, MAX_QUERY_LIMIT))
        .fetch_all(pool)
        .await
    }

    /// Paged raw listing with exact-match filters.
    pub async fn list(
        pool: &SqlitePool,
        limit: i64,
        offset: i64,
        source: Option<&str>,
        action: Option<&str>,
        target_service: Option<&str>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM events
            WHERE (?1 IS NULL OR source_address = ?1)
              AND (?2 IS NULL OR action = ?2)
              AND (?3 IS NULL OR target_service = ?3)
            ORDER BY id DESC
            LIMIT ?4 OFFSET ?5
            "#,
        )
        .bind(source)
        .bind(action)
        .bind(target_service)
        .bind(limit.clamp(0, MAX_QUERY_LIMIT))
        .bind(offset.max(0))
        .fetch_all(pool)
        .await
    }

    /// High-scoring events, best first.
    pub async fn alerts(
        pool: &SqlitePool,
        threshold: f64,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM events
            WHERE score >= ?1
            ORDER BY score DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(threshold)
        .bind(limit.clamp(0, MAX_QUERY_LIMIT))
        .fetch_all(pool)
        .await
    }

    /// Every stored event for one source, newest first.
    pub async fn for_source(
        pool: &SqlitePool,
        source: &str,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM events
            WHERE source_address = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(source)
        .bind(limit.clamp(0, MAX_QUERY_LIMIT))
        .fetch_all(pool)
        .await
    }
}
