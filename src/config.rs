//! Configuration module
//!
//! All settings come from environment variables with spec defaults.
//! `validate` runs once at startup; a validation failure is a process-level
//! config error (exit code 1).

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {detail}")]
    Invalid { key: &'static str, detail: String },
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// host:port the HTTP surface binds to
    pub bind_address: String,

    /// Location of the SQLite store
    pub db_path: String,

    pub models: ModelPaths,

    /// Ensemble weights; must sum to 1
    pub weights: Weights,

    /// Risk band cutoffs
    pub bands: Bands,

    /// Action labels that trigger the score floor
    pub indicator_actions: Vec<String>,

    /// Target-path substrings that trigger the score floor
    pub indicator_paths: Vec<String>,

    /// Minimum score applied when an indicator matches
    pub score_floor: f64,

    pub geo: GeoConfig,

    /// Per-request deadline in milliseconds
    pub request_deadline_ms: u64,

    /// Ingest returns 503 when this many writes are in flight
    pub backpressure_high_watermark: usize,
}

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub supervised: String,
    pub unsupervised: String,
    pub secondary: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub supervised: f64,
    pub unsupervised: f64,
    pub secondary: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Bands {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

#[derive(Debug, Clone)]
pub struct GeoConfig {
    /// Upstream lookup base URL; empty string disables outbound lookups
    pub base_url: String,
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub cache_size: u64,
    pub positive_ttl_secs: u64,
    pub negative_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:5000"),
            db_path: env_or("DB_PATH", "hivetrap.db"),
            models: ModelPaths {
                supervised: env_or("MODEL_SUPERVISED_PATH", "models/supervised.json"),
                unsupervised: env_or("MODEL_UNSUPERVISED_PATH", "models/anomaly.json"),
                secondary: env_or("MODEL_SECONDARY_PATH", "models/secondary.json"),
            },
            weights: Weights {
                supervised: env_parse("WEIGHT_SUPERVISED", 0.60),
                unsupervised: env_parse("WEIGHT_UNSUPERVISED", 0.25),
                secondary: env_parse("WEIGHT_SECONDARY", 0.15),
            },
            bands: Bands {
                low: env_parse("BAND_LOW", 0.20),
                medium: env_parse("BAND_MEDIUM", 0.40),
                high: env_parse("BAND_HIGH", 0.70),
            },
            indicator_actions: env_list("INDICATOR_ACTIONS", &["git_push", "cred_access"]),
            indicator_paths: env_list(
                "INDICATOR_PATHS",
                &[".env", "secrets.yml", "credentials", "private.key", "kubeconfig-"],
            ),
            score_floor: env_parse("SCORE_FLOOR", 0.65),
            geo: GeoConfig {
                base_url: env_or("GEO_BASE_URL", "https://ipapi.co"),
                timeout_ms: env_parse("GEO_TIMEOUT_MS", 2000),
                concurrency: env_parse("GEO_CONCURRENCY", 16),
                cache_size: env_parse("GEO_CACHE_SIZE", 50_000),
                positive_ttl_secs: env_parse("GEO_CACHE_POSITIVE_TTL_SECS", 24 * 3600),
                negative_ttl_secs: env_parse("GEO_CACHE_NEGATIVE_TTL_SECS", 300),
            },
            request_deadline_ms: env_parse("REQUEST_DEADLINE_MS", 5000),
            backpressure_high_watermark: env_parse("BACKPRESSURE_HIGH_WATERMARK", 1000),
        }
    }

    /// Validate cross-field invariants. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.weights.supervised + self.weights.unsupervised + self.weights.secondary;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid {
                key: "WEIGHT_*",
                detail: format!("ensemble weights must sum to 1, got {sum}"),
            });
        }
        for (key, w) in [
            ("WEIGHT_SUPERVISED", self.weights.supervised),
            ("WEIGHT_UNSUPERVISED", self.weights.unsupervised),
            ("WEIGHT_SECONDARY", self.weights.secondary),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(ConfigError::Invalid {
                    key,
                    detail: format!("weight must be within [0, 1], got {w}"),
                });
            }
        }
        let Bands { low, medium, high } = self.bands;
        if !(0.0 < low && low < medium && medium < high && high <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "BAND_*",
                detail: format!("band cutoffs must satisfy 0 < low < medium < high <= 1, got {low}/{medium}/{high}"),
            });
        }
        if !(0.0..=1.0).contains(&self.score_floor) {
            return Err(ConfigError::Invalid {
                key: "SCORE_FLOOR",
                detail: format!("score floor must be within [0, 1], got {}", self.score_floor),
            });
        }
        if self.geo.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "GEO_CONCURRENCY",
                detail: "must be at least 1".into(),
            });
        }
        if self.backpressure_high_watermark == 0 {
            return Err(ConfigError::Invalid {
                key: "BACKPRESSURE_HIGH_WATERMARK",
                detail: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}
