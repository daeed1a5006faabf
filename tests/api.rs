//! End-to-end tests over the HTTP surface.
//!
//! Each test builds a collector with an in-memory store, small tree
//! artifacts written to a temp directory, and outbound geo lookups
//! disabled, then drives the router directly.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use hivetrap_collector::config::{Bands, Config, GeoConfig, ModelPaths, Weights};
use hivetrap_collector::db;
use hivetrap_collector::scoring::Ensemble;
use hivetrap_collector::{create_router, Collector};

fn supervised_artifact() -> serde_json::Value {
    serde_json::json!({
        "kind": "supervised",
        "columns": ["indicator_action", "payload_len"],
        "forest": [[
            {"feature": 0, "threshold": 0.5, "left": 1, "right": 2},
            {"feature": -1, "value": [9.0, 1.0]},
            {"feature": -1, "value": [1.0, 9.0]}
        ]],
        "threshold": 0.5
    })
}

fn anomaly_artifact() -> serde_json::Value {
    serde_json::json!({
        "kind": "anomaly",
        "columns": ["payload_len", "indicator_payload"],
        "trees": [[
            {"feature": 0, "threshold": 2000.0, "left": 1, "right": 2},
            {"feature": -1, "size": 64},
            {"feature": -1, "size": 1}
        ]],
        "sample_size": 128,
        "threshold": 0.75
    })
}

/// Anomaly artifact that fails at inference: the tree references a
/// feature past the vector length.
fn broken_anomaly_artifact() -> serde_json::Value {
    serde_json::json!({
        "kind": "anomaly",
        "columns": ["payload_len"],
        "trees": [[
            {"feature": 7, "threshold": 1.0, "left": 1, "right": 2},
            {"feature": -1, "size": 4},
            {"feature": -1, "size": 4}
        ]],
        "sample_size": 16,
        "threshold": 0.9
    })
}

fn secondary_artifact() -> serde_json::Value {
    serde_json::json!({
        "kind": "secondary",
        "columns": ["ua_len", "ua_automation", "is_encrypted"],
        "forest": [[
            {"feature": -1, "value": [8.0, 1.0, 1.0]}
        ]],
        "labels": ["NORMAL", "TOR", "VPN"],
        "threshold": 0.5
    })
}

struct TestApp {
    router: Router,
    state: Collector,
    _models: TempDir,
}

async fn spawn() -> TestApp {
    spawn_with(anomaly_artifact()).await
}

async fn spawn_with(anomaly: serde_json::Value) -> TestApp {
    let models = TempDir::new().unwrap();
    let path = |name: &str, body: &serde_json::Value| {
        let file = models.path().join(name);
        std::fs::write(&file, body.to_string()).unwrap();
        file.to_str().unwrap().to_string()
    };

    let config = Config {
        bind_address: "127.0.0.1:0".into(),
        db_path: ":memory:".into(),
        models: ModelPaths {
            supervised: path("supervised.json", &supervised_artifact()),
            unsupervised: path("anomaly.json", &anomaly),
            secondary: path("secondary.json", &secondary_artifact()),
        },
        weights: Weights { supervised: 0.60, unsupervised: 0.25, secondary: 0.15 },
        bands: Bands { low: 0.20, medium: 0.40, high: 0.70 },
        indicator_actions: vec!["git_push".into(), "cred_access".into()],
        indicator_paths: vec![
            ".env".into(),
            "secrets.yml".into(),
            "credentials".into(),
            "private.key".into(),
            "kubeconfig-".into(),
        ],
        score_floor: 0.65,
        geo: GeoConfig {
            base_url: String::new(),
            timeout_ms: 2000,
            concurrency: 16,
            cache_size: 1000,
            positive_ttl_secs: 3600,
            negative_ttl_secs: 300,
        },
        request_deadline_ms: 5000,
        backpressure_high_watermark: 1000,
    };
    config.validate().unwrap();

    let ensemble = Ensemble::load(&config).unwrap();
    let pool = db::create_memory_pool().await.unwrap();
    let state = Collector::new(pool, config, ensemble);
    TestApp { router: create_router(state.clone()), state, _models: models }
}

async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn post(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    request(app, "POST", uri, Some(body)).await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    request(app, "GET", uri, None).await
}

fn event_body(source: &str, action: &str, target_path: Option<&str>, session: &str) -> serde_json::Value {
    let mut body = serde_json::json!({
        "observed_at": "2024-06-01T10:15:00Z",
        "source_address": source,
        "target_service": "git",
        "action": action,
        "session_id": session,
    });
    if let Some(path) = target_path {
        body["target_path"] = serde_json::json!(path);
    }
    body
}

// ============================================================================
// INGEST
// ============================================================================

#[tokio::test]
async fn credential_file_access_triggers_score_floor() {
    let app = spawn().await;
    let (status, body) = post(
        &app.router,
        "/ingest",
        event_body("203.0.113.42", "file_access", Some("secrets.yml"), "s1"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["inserted"], true);
    assert_eq!(body["duplicate"], false);
    assert!(body["score"]["value"].as_f64().unwrap() >= 0.65);
    let band = body["score"]["band"].as_str().unwrap();
    assert!(band == "MEDIUM" || band == "HIGH", "{band}");
    assert_eq!(body["score"]["predicted_class"], "CREDENTIAL_ACCESS");
}

#[tokio::test]
async fn duplicate_submission_is_deduplicated() {
    let app = spawn().await;
    let body = event_body("203.0.113.42", "file_access", Some("secrets.yml"), "s1");

    let (status, first) = post(&app.router, "/ingest", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["inserted"], true);
    assert_eq!(first["duplicate"], false);

    let (status, second) = post(&app.router, "/ingest", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["inserted"], false);
    assert_eq!(second["duplicate"], true);

    let (_, stats) = get(&app.router, "/stats").await;
    assert_eq!(stats["total_events"], 1);
}

#[tokio::test]
async fn log_alias_accepts_events() {
    let app = spawn().await;
    let (status, body) = post(
        &app.router,
        "/log",
        event_body("203.0.113.42", "page_view", None, "s1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
}

#[tokio::test]
async fn private_address_skips_enrichment() {
    let app = spawn().await;
    let (status, _) = post(
        &app.router,
        "/ingest",
        event_body("10.1.2.3", "file_access", None, "s1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get(&app.router, "/events").await;
    let event = &body["events"][0];
    assert_eq!(event["geo_is_private"], true);
    assert_eq!(event["geo_country"], serde_json::Value::Null);
    // Nothing was attempted upstream, so nothing was cached.
    assert_eq!(app.state.geo.cache_size(), 0);
}

#[tokio::test]
async fn model_failure_degrades_gracefully() {
    let app = spawn_with(broken_anomaly_artifact()).await;
    let (status, body) = post(
        &app.router,
        "/ingest",
        event_body("203.0.113.42", "page_view", None, "s1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The failed model contributes zero: value = w_s*p_s + w_t*p_t.
    let expected = 0.60 * 0.1 + 0.15 * 0.2;
    let value = body["score"]["value"].as_f64().unwrap();
    assert!((value - expected).abs() < 1e-9, "{value}");

    let (_, events) = get(&app.router, "/events").await;
    assert_eq!(events["events"][0]["scoring_degraded"], true);
    assert_eq!(app.state.metrics.snapshot().scoring_degraded, 1);
}

#[tokio::test]
async fn returned_score_matches_stored_score() {
    let app = spawn().await;
    let (_, response) = post(
        &app.router,
        "/ingest",
        event_body("203.0.113.42", "git_push", None, "s1"),
    )
    .await;

    let (_, events) = get(&app.router, "/events").await;
    let stored = &events["events"][0];
    assert_eq!(stored["score"], response["score"]["value"]);
    assert_eq!(stored["band"], response["score"]["band"]);
    assert_eq!(stored["is_anomaly"], response["score"]["is_anomaly"]);
    assert_eq!(stored["predicted_class"], response["score"]["predicted_class"]);
    assert_eq!(stored["traffic_class"], response["score"]["traffic_class"]);
}

#[tokio::test]
async fn missing_field_is_schema_error() {
    let app = spawn().await;
    let mut body = event_body("203.0.113.42", "file_access", None, "s1");
    body.as_object_mut().unwrap().remove("session_id");

    let (status, error) = post(&app.router, "/ingest", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "schema_error");
    assert_eq!(app.state.metrics.snapshot().schema_errors, 1);
}

#[tokio::test]
async fn oversize_payload_is_rejected_without_write() {
    let app = spawn().await;
    let mut body = event_body("203.0.113.42", "file_access", None, "s1");
    body["payload"] = serde_json::json!({"blob": "x".repeat(64 * 1024)});

    let (status, error) = post(&app.router, "/ingest", body).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error["error"], "payload_too_large");

    let (_, stats) = get(&app.router, "/stats").await;
    assert_eq!(stats["total_events"], 0);
}

#[tokio::test]
async fn backpressure_returns_503_with_retry_after() {
    let app = spawn().await;
    // Saturate the watermark by hand.
    app.state
        .inflight_writes
        .store(1000, std::sync::atomic::Ordering::SeqCst);

    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .body(Body::from(
            event_body("203.0.113.42", "page_view", None, "s1").to_string(),
        ))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("retry-after").unwrap(), "1");
}

// ============================================================================
// QUERY API
// ============================================================================

#[tokio::test]
async fn empty_store_returns_empty_shapes() {
    let app = spawn().await;

    let (status, events) = get(&app.router, "/events").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events["count"], 0);

    let (_, alerts) = get(&app.router, "/alerts").await;
    assert_eq!(alerts["count"], 0);

    let (_, stats) = get(&app.router, "/stats").await;
    assert_eq!(stats["total_events"], 0);
    assert_eq!(stats["avg_score"], 0.0);
    assert_eq!(stats["hourly"].as_array().unwrap().len(), 24);

    let (_, analytics) = get(&app.router, "/analytics").await;
    let series = analytics["time_series"].as_array().unwrap();
    assert_eq!(series.len(), 24);
    assert!(series.iter().all(|b| b["count"] == 0));

    let (_, map) = get(&app.router, "/map").await;
    assert_eq!(map["points"].as_array().unwrap().len(), 0);

    let (_, insights) = get(&app.router, "/ml-insights").await;
    assert_eq!(insights["anomaly_count"], 0);
    assert_eq!(insights["score_trend"].as_array().unwrap().len(), 24);
}

#[tokio::test]
async fn time_series_buckets_are_ascending_and_hour_aligned() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.42", "git_push", None, "s1")).await;

    for uri in ["/stats", "/analytics", "/ml-insights"] {
        let (_, body) = get(&app.router, uri).await;
        let series = body["hourly"]
            .as_array()
            .or_else(|| body["time_series"].as_array())
            .or_else(|| body["score_trend"].as_array())
            .unwrap();
        assert_eq!(series.len(), 24, "{uri}");

        let times: Vec<&str> = series.iter().map(|b| b["time"].as_str().unwrap()).collect();
        for pair in times.windows(2) {
            assert!(pair[0] < pair[1], "{uri}");
        }
        assert!(times.iter().all(|t| t.ends_with(":00:00Z")), "{uri}");
    }
}

#[tokio::test]
async fn alerts_filter_and_order_by_score() {
    let app = spawn().await;
    // Three events: ~0.22 (below threshold), 0.65 (floored), ~0.70.
    post(&app.router, "/ingest", event_body("203.0.113.1", "page_view", None, "s1")).await;
    post(&app.router, "/ingest", event_body("203.0.113.2", "file_access", Some("secrets.yml"), "s2")).await;
    post(&app.router, "/ingest", event_body("203.0.113.3", "git_push", None, "s3")).await;

    let (status, body) = get(&app.router, "/alerts?threshold=0.5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let alerts = body["alerts"].as_array().unwrap();
    let first = alerts[0]["score"].as_f64().unwrap();
    let second = alerts[1]["score"].as_f64().unwrap();
    assert!(first >= second);
    assert!(second >= 0.5);
    assert_eq!(alerts[0]["source_address"], "203.0.113.3");
}

#[tokio::test]
async fn events_min_score_is_inclusive_bound() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.1", "git_push", None, "s1")).await;

    let (_, none) = get(&app.router, "/events?min_score=1.0").await;
    assert_eq!(none["count"], 0);

    let (_, all) = get(&app.router, "/events?min_score=0.0").await;
    assert_eq!(all["count"], 1);
}

#[tokio::test]
async fn events_filters_by_source() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.1", "page_view", None, "s1")).await;
    post(&app.router, "/ingest", event_body("203.0.113.2", "page_view", None, "s2")).await;

    let (_, body) = get(&app.router, "/events?source=203.0.113.2").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["events"][0]["source_address"], "203.0.113.2");
}

#[tokio::test]
async fn logs_listing_pages_and_filters() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.1", "page_view", None, "s1")).await;
    post(&app.router, "/ingest", event_body("203.0.113.1", "git_push", None, "s2")).await;

    let (_, by_action) = get(&app.router, "/logs?action=git_push").await;
    assert_eq!(by_action["count"], 1);

    let (_, page) = get(&app.router, "/logs?limit=1&offset=1").await;
    assert_eq!(page["count"], 1);
}

#[tokio::test]
async fn malformed_query_param_is_400() {
    let app = spawn().await;
    let (status, body) = get(&app.router, "/events?min_score=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "query_param_error");
    assert_eq!(app.state.metrics.snapshot().query_param_errors, 1);
}

#[tokio::test]
async fn investigate_unknown_source_is_404() {
    let app = spawn().await;
    let (status, body) = get(&app.router, "/investigate/203.0.113.99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn investigate_reports_source_detail() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.7", "git_push", None, "s1")).await;
    post(&app.router, "/ingest", event_body("203.0.113.7", "scan_attempt", None, "s2")).await;

    let (status, body) = get(&app.router, "/investigate/203.0.113.7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "203.0.113.7");
    assert_eq!(body["summary"]["total_events"], 2);
    assert_eq!(
        body["summary"]["actions"],
        serde_json::json!(["git_push", "scan_attempt"])
    );
    assert_eq!(body["score_trend"].as_array().unwrap().len(), 24);
    assert_eq!(body["events"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn stats_reflect_band_histogram() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.1", "page_view", None, "s1")).await;
    post(&app.router, "/ingest", event_body("203.0.113.2", "git_push", None, "s2")).await;

    let (_, stats) = get(&app.router, "/stats").await;
    let histogram = stats["band_histogram"].as_array().unwrap();
    assert_eq!(histogram.len(), 4);
    let total: i64 = histogram.iter().map(|b| b["count"].as_i64().unwrap()).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn ml_insights_carry_model_block() {
    let app = spawn().await;
    let (_, insights) = get(&app.router, "/ml-insights").await;
    assert_eq!(insights["models"]["supervised"]["weight"], 0.6);
    assert_eq!(insights["models"]["secondary"]["kind"], "secondary");
}

#[tokio::test]
async fn health_reports_components() {
    let app = spawn().await;
    post(&app.router, "/ingest", event_body("203.0.113.1", "page_view", None, "s1")).await;

    let (status, health) = get(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["database"], true);
    assert_eq!(health["total_events"], 1);
    assert_eq!(health["metrics"]["events_ingested"], 1);
    assert!(health["models"]["unsupervised"]["columns"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn index_lists_endpoints() {
    let app = spawn().await;
    let (status, body) = get(&app.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "hivetrap-collector");
}
