//! Aggregation queries backing the dashboard endpoints
//!
//! All temporal aggregation buckets by hour in UTC. A 24-hour window is
//! the 24 consecutive hourly buckets ending at the current UTC hour; the
//! window is anchored at the wall clock, never at the newest row, so a
//! stalled pipeline shows up as empty buckets.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use super::event::format_ts;

const TOP_N: i64 = 10;
const WINDOW_HOURS: i64 = 24;

/// Truncate to the containing UTC hour.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Canonical bucket key: `YYYY-MM-DDTHH:00:00Z`.
pub fn bucket_key(ts: DateTime<Utc>) -> String {
    truncate_to_hour(ts).format("%Y-%m-%dT%H:00:00Z").to_string()
}

/// Start of the oldest bucket in the window ending at `now`'s hour.
fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_hour(now) - Duration::hours(WINDOW_HOURS - 1)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// One hourly bucket of the score series.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BucketPoint {
    pub time: String,
    pub avg_score: f64,
    pub count: i64,
}

/// One hourly bucket of a count-only series.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BucketCount {
    pub time: String,
    pub count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BucketRow {
    bucket: String,
    avg_score: f64,
    count: i64,
}

/// Hourly `(bucket, avg_score, count)` series over the last 24 hours,
/// optionally restricted to one source. Always exactly 24 buckets in
/// ascending order; hours without rows carry zeros.
pub async fn hourly_series(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    source: Option<&str>,
) -> Result<Vec<BucketPoint>, sqlx::Error> {
    let rows = sqlx::query_as::<_, BucketRow>(
        r#"
        SELECT strftime('%Y-%m-%dT%H:00:00', ingested_at) AS bucket,
               AVG(score) AS avg_score,
               COUNT(*) AS count
        FROM events
        WHERE datetime(ingested_at) >= datetime(?1)
          AND (?2 IS NULL OR source_address = ?2)
        GROUP BY bucket
        ORDER BY bucket ASC
        "#,
    )
    .bind(format_ts(window_start(now)))
    .bind(source)
    .fetch_all(pool)
    .await?;

    Ok(fill_series(now, &rows))
}

fn fill_series(now: DateTime<Utc>, rows: &[BucketRow]) -> Vec<BucketPoint> {
    let start = window_start(now);
    (0..WINDOW_HOURS)
        .map(|h| {
            let key = bucket_key(start + Duration::hours(h));
            // SQLite emits the bucket without the trailing designator.
            match rows.iter().find(|r| format!("{}Z", r.bucket) == key) {
                Some(row) => BucketPoint {
                    time: key,
                    avg_score: round4(row.avg_score),
                    count: row.count,
                },
                None => BucketPoint { time: key, avg_score: 0.0, count: 0 },
            }
        })
        .collect()
}

// ============================================================================
// TOP-N ROWS
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow, PartialEq)]
pub struct CountryCount {
    pub country: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActionCount {
    pub action: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceCount {
    pub service: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SourceCount {
    pub source: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProtocolCount {
    pub protocol: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BandCount {
    pub band: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrafficClassCount {
    pub traffic_class: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SourceScore {
    pub source: String,
    pub avg_score: f64,
    pub count: i64,
}

async fn top_countries(pool: &SqlitePool) -> Result<Vec<CountryCount>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT geo_country AS country, COUNT(*) AS count
        FROM events
        WHERE geo_country IS NOT NULL
        GROUP BY geo_country
        ORDER BY count DESC, country ASC
        LIMIT ?1
        "#,
    )
    .bind(TOP_N)
    .fetch_all(pool)
    .await
}

/// Histogram over all four bands, zero-filled in severity order.
async fn band_histogram(pool: &SqlitePool) -> Result<Vec<BandCount>, sqlx::Error> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT band, COUNT(*) FROM events GROUP BY band")
            .fetch_all(pool)
            .await?;

    Ok(["MINIMAL", "LOW", "MEDIUM", "HIGH"]
        .iter()
        .map(|band| BandCount {
            band: band.to_string(),
            count: rows.iter().find(|(b, _)| b == band).map_or(0, |(_, c)| *c),
        })
        .collect())
}

// ============================================================================
// DASHBOARD SUMMARY
// ============================================================================

#[derive(Debug, Serialize)]
pub struct Stats {
    pub total_events: i64,
    pub distinct_sources: i64,
    pub events_24h: i64,
    pub avg_score: f64,
    pub high_risk_count: i64,
    pub anomaly_count: i64,
    pub top_services: Vec<ServiceCount>,
    pub top_actions: Vec<ActionCount>,
    pub top_countries: Vec<CountryCount>,
    pub band_histogram: Vec<BandCount>,
    pub hourly: Vec<BucketPoint>,
}

impl Stats {
    pub async fn compute(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Self, sqlx::Error> {
        let total_events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(pool)
            .await?;
        let distinct_sources: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT source_address) FROM events")
                .fetch_one(pool)
                .await?;
        let events_24h: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE datetime(ingested_at) >= datetime(?1)",
        )
        .bind(format_ts(window_start(now)))
        .fetch_one(pool)
        .await?;
        let avg_score: Option<f64> = sqlx::query_scalar("SELECT AVG(score) FROM events")
            .fetch_one(pool)
            .await?;
        let high_risk_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE band = 'HIGH'")
                .fetch_one(pool)
                .await?;
        let anomaly_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE is_anomaly = 1")
                .fetch_one(pool)
                .await?;

        let top_services = sqlx::query_as(
            r#"
            SELECT target_service AS service, COUNT(*) AS count
            FROM events GROUP BY target_service
            ORDER BY count DESC, service ASC LIMIT ?1
            "#,
        )
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;

        let top_actions = sqlx::query_as(
            r#"
            SELECT action, COUNT(*) AS count
            FROM events GROUP BY action
            ORDER BY count DESC, action ASC LIMIT ?1
            "#,
        )
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;

        Ok(Self {
            total_events,
            distinct_sources,
            events_24h,
            avg_score: round4(avg_score.unwrap_or(0.0)),
            high_risk_count,
            anomaly_count,
            top_services,
            top_actions,
            top_countries: top_countries(pool).await?,
            band_histogram: band_histogram(pool).await?,
            hourly: hourly_series(pool, now, None).await?,
        })
    }
}

// ============================================================================
// ANALYTICS PAGE
// ============================================================================

#[derive(Debug, Serialize)]
pub struct Analytics {
    pub events_24h: i64,
    pub high_risk_count: i64,
    pub distinct_sources: i64,
    pub avg_score: f64,
    pub top_countries: Vec<CountryCount>,
    pub top_sources: Vec<SourceCount>,
    pub top_protocols: Vec<ProtocolCount>,
    pub time_series: Vec<BucketCount>,
}

impl Analytics {
    pub async fn compute(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Self, sqlx::Error> {
        let events_24h: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE datetime(ingested_at) >= datetime(?1)",
        )
        .bind(format_ts(window_start(now)))
        .fetch_one(pool)
        .await?;
        let high_risk_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE band = 'HIGH'")
                .fetch_one(pool)
                .await?;
        let distinct_sources: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT source_address) FROM events")
                .fetch_one(pool)
                .await?;
        let avg_score: Option<f64> = sqlx::query_scalar("SELECT AVG(score) FROM events")
            .fetch_one(pool)
            .await?;

        let top_sources = sqlx::query_as(
            r#"
            SELECT source_address AS source, COUNT(*) AS count
            FROM events GROUP BY source_address
            ORDER BY count DESC, source ASC LIMIT ?1
            "#,
        )
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;

        let top_protocols = sqlx::query_as(
            r#"
            SELECT protocol, COUNT(*) AS count
            FROM events GROUP BY protocol
            ORDER BY count DESC, protocol ASC LIMIT ?1
            "#,
        )
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;

        let time_series = hourly_series(pool, now, None)
            .await?
            .into_iter()
            .map(|p| BucketCount { time: p.time, count: p.count })
            .collect();

        Ok(Self {
            events_24h,
            high_risk_count,
            distinct_sources,
            avg_score: round4(avg_score.unwrap_or(0.0)),
            top_countries: top_countries(pool).await?,
            top_sources,
            top_protocols,
            time_series,
        })
    }
}

// ============================================================================
// MAP VIEW
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MapPoint {
    pub source: String,
    pub count: i64,
    pub avg_score: f64,
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CountryStat {
    pub country: String,
    pub count: i64,
    pub avg_score: f64,
}

#[derive(Debug, Serialize)]
pub struct MapData {
    pub points: Vec<MapPoint>,
    pub countries: Vec<CountryStat>,
}

impl MapData {
    pub async fn compute(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let points = sqlx::query_as(
            r#"
            SELECT source_address AS source, COUNT(*) AS count, AVG(score) AS avg_score,
                   geo_country AS country, geo_city AS city,
                   geo_latitude AS latitude, geo_longitude AS longitude
            FROM events
            WHERE geo_latitude IS NOT NULL AND geo_longitude IS NOT NULL
            GROUP BY source_address, geo_country, geo_city, geo_latitude, geo_longitude
            ORDER BY count DESC, source ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        let countries = sqlx::query_as(
            r#"
            SELECT geo_country AS country, COUNT(*) AS count, AVG(score) AS avg_score
            FROM events
            WHERE geo_country IS NOT NULL
            GROUP BY geo_country
            ORDER BY count DESC, country ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(Self { points, countries })
    }
}

// ============================================================================
// ML INSIGHTS
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MlInsights {
    pub avg_anomaly_component: f64,
    pub anomaly_count: i64,
    pub score_trend: Vec<BucketPoint>,
    pub high_score_sources: Vec<SourceScore>,
    pub band_histogram: Vec<BandCount>,
    pub traffic_class_histogram: Vec<TrafficClassCount>,
    pub suspicious_traffic_count: i64,
}

impl MlInsights {
    pub async fn compute(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Self, sqlx::Error> {
        let avg_anomaly_component: Option<f64> =
            sqlx::query_scalar("SELECT AVG(anomaly_component) FROM events")
                .fetch_one(pool)
                .await?;
        let anomaly_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE is_anomaly = 1")
                .fetch_one(pool)
                .await?;

        let high_score_sources = sqlx::query_as(
            r#"
            SELECT source_address AS source, AVG(score) AS avg_score, COUNT(*) AS count
            FROM events
            GROUP BY source_address
            HAVING AVG(score) >= 0.8
            ORDER BY avg_score DESC, source ASC
            LIMIT ?1
            "#,
        )
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;

        let traffic_class_histogram = sqlx::query_as(
            r#"
            SELECT traffic_class, COUNT(*) AS count
            FROM events
            WHERE traffic_class IS NOT NULL
            GROUP BY traffic_class
            ORDER BY count DESC, traffic_class ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        // Labels are stored verbatim from the artifact, so match them
        // case-insensitively, as the scoring policy does.
        let suspicious_traffic_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE UPPER(traffic_class) IN ('TOR', 'VPN')",
        )
        .fetch_one(pool)
        .await?;

        Ok(Self {
            avg_anomaly_component: round4(avg_anomaly_component.unwrap_or(0.0)),
            anomaly_count,
            score_trend: hourly_series(pool, now, None).await?,
            high_score_sources,
            band_histogram: band_histogram(pool).await?,
            traffic_class_histogram,
            suspicious_traffic_count,
        })
    }
}

// ============================================================================
// SOURCE INVESTIGATION
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SourceSummary {
    pub total_events: i64,
    pub avg_score: f64,
    pub max_score: f64,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub actions: Vec<String>,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SourceGeo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

impl SourceSummary {
    pub async fn compute(pool: &SqlitePool, source: &str) -> Result<Self, sqlx::Error> {
        let (total_events, avg_score, max_score): (i64, Option<f64>, Option<f64>) =
            sqlx::query_as(
                "SELECT COUNT(*), AVG(score), MAX(score) FROM events WHERE source_address = ?1",
            )
            .bind(source)
            .fetch_one(pool)
            .await?;

        let (first_seen, last_seen): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT MIN(ingested_at), MAX(ingested_at) FROM events WHERE source_address = ?1",
        )
        .bind(source)
        .fetch_one(pool)
        .await?;

        let actions: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT action FROM events WHERE source_address = ?1 ORDER BY action",
        )
        .bind(source)
        .fetch_all(pool)
        .await?;

        let services: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT target_service FROM events WHERE source_address = ?1 ORDER BY target_service",
        )
        .bind(source)
        .fetch_all(pool)
        .await?;

        Ok(Self {
            total_events,
            avg_score: round4(avg_score.unwrap_or(0.0)),
            max_score: round4(max_score.unwrap_or(0.0)),
            first_seen,
            last_seen,
            actions,
            services,
        })
    }
}

impl SourceGeo {
    /// Geo fields from the source's most recent row.
    pub async fn latest(pool: &SqlitePool, source: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT geo_country AS country, geo_region AS region, geo_city AS city,
                   geo_latitude AS latitude, geo_longitude AS longitude, geo_isp AS isp
            FROM events
            WHERE source_address = ?1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(source)
        .fetch_optional(pool)
        .await
    }
}
