//! Model ensemble
//!
//! Combines three models over one event: a supervised classifier, an
//! unsupervised anomaly model, and a secondary traffic classifier.
//! Scoring is pure over (event, artifacts) and never fails the ingest
//! path: a model that cannot run contributes zero and marks the event
//! as degraded.

pub mod artifact;
pub mod features;
pub mod forest;

use serde::Serialize;

use crate::config::{Bands, Config, Weights};
use crate::models::{AttackClass, Band, Event, Score};

use artifact::{Artifact, ArtifactKind, ModelError};
use features::{featurize, indicator_hits, IndicatorHits};

/// Secondary labels that count as evasive traffic.
const SUSPICIOUS_TRAFFIC: &[&str] = &["TOR", "VPN"];

/// File suffixes that mark non-credential sensitive material.
const SENSITIVE_SUFFIXES: &[&str] =
    &[".yml", ".yaml", ".json", ".conf", ".cfg", ".sql", ".bak", ".pem", ".db"];

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub kind: ArtifactKind,
    pub columns: usize,
    pub threshold: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsembleSummary {
    pub supervised: ModelSummary,
    pub unsupervised: ModelSummary,
    pub secondary: ModelSummary,
}

pub struct Ensemble {
    supervised: Artifact,
    anomaly: Artifact,
    secondary: Artifact,
    weights: Weights,
    bands: Bands,
    score_floor: f64,
    indicator_actions: Vec<String>,
    indicator_paths: Vec<String>,
}

impl Ensemble {
    /// Load all three artifacts. Any failure here aborts startup.
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            supervised: Artifact::load(&config.models.supervised, ArtifactKind::Supervised)?,
            anomaly: Artifact::load(&config.models.unsupervised, ArtifactKind::Anomaly)?,
            secondary: Artifact::load(&config.models.secondary, ArtifactKind::Secondary)?,
            weights: config.weights,
            bands: config.bands,
            score_floor: config.score_floor,
            indicator_actions: config.indicator_actions.clone(),
            indicator_paths: config.indicator_paths.clone(),
        })
    }

    /// Score one event. Infallible by design; per-model failures degrade
    /// the result instead of propagating.
    pub fn score(&self, event: &Event) -> Score {
        let hits = indicator_hits(event, &self.indicator_actions, &self.indicator_paths);

        let mut degraded = false;
        let mut absorb = |name: &str, err: ModelError| {
            tracing::warn!(model = name, %err, "model failed, scoring degraded");
            degraded = true;
        };

        let supervised = match self.run_supervised(event, &hits) {
            Ok(out) => Some(out),
            Err(err) => {
                absorb("supervised", err);
                None
            }
        };
        let anomaly = match self.run_anomaly(event, &hits) {
            Ok(out) => Some(out),
            Err(err) => {
                absorb("anomaly", err);
                None
            }
        };
        let secondary = match self.run_secondary(event, &hits) {
            Ok(out) => Some(out),
            Err(err) => {
                absorb("secondary", err);
                None
            }
        };

        let p_s = supervised.as_ref().map_or(0.0, |s| s.0);
        let flagged_s = supervised.as_ref().is_some_and(|s| s.1);
        let p_a = anomaly.as_ref().map_or(0.0, |a| a.0);
        let flagged_a = anomaly.as_ref().is_some_and(|a| a.1);
        let p_t = secondary.as_ref().map_or(0.0, |t| t.0);

        let mut value = self.weights.supervised * p_s
            + self.weights.unsupervised * p_a
            + self.weights.secondary * p_t;
        value = value.clamp(0.0, 1.0);

        // Policy floor: configured indicators guarantee a minimum score
        // regardless of what the models thought.
        if hits.floors() && value < self.score_floor {
            value = self.score_floor;
        }

        let band = Band::from_value(value, &self.bands);
        // The supervised flag alone is not allowed to mark low-scoring
        // events anomalous; the unsupervised flag is.
        let is_anomaly =
            flagged_a || value >= self.bands.high || (flagged_s && value >= self.bands.medium);

        Score {
            value,
            band,
            is_anomaly,
            predicted_class: self.classify(event, &hits, flagged_s, flagged_a),
            traffic_class: secondary.map(|t| t.1),
            anomaly_component: anomaly.map(|a| a.0),
            degraded,
        }
    }

    fn run_supervised(
        &self,
        event: &Event,
        hits: &IndicatorHits,
    ) -> Result<(f64, bool), ModelError> {
        let x = featurize(event, hits, &self.supervised);
        let forest = self
            .supervised
            .forest
            .as_ref()
            .ok_or_else(|| ModelError::Execution("supervised forest missing".into()))?;
        let proba = forest::forest_proba(forest, &x)?;
        let p = *proba
            .get(1)
            .ok_or_else(|| ModelError::Execution("supervised model is not binary".into()))?;
        Ok((p, p >= self.supervised.threshold))
    }

    fn run_anomaly(&self, event: &Event, hits: &IndicatorHits) -> Result<(f64, bool), ModelError> {
        let x = featurize(event, hits, &self.anomaly);
        let trees = self
            .anomaly
            .trees
            .as_ref()
            .ok_or_else(|| ModelError::Execution("isolation trees missing".into()))?;
        let sample_size = self
            .anomaly
            .sample_size
            .ok_or_else(|| ModelError::Execution("sample size missing".into()))?;
        let s = forest::isolation_score(trees, sample_size, &x)?;
        Ok((s, s >= self.anomaly.threshold))
    }

    /// Secondary classifier: traffic-class label plus the probability
    /// mass assigned to evasive classes.
    fn run_secondary(
        &self,
        event: &Event,
        hits: &IndicatorHits,
    ) -> Result<(f64, String), ModelError> {
        let x = featurize(event, hits, &self.secondary);
        let forest = self
            .secondary
            .forest
            .as_ref()
            .ok_or_else(|| ModelError::Execution("secondary forest missing".into()))?;
        let labels = self
            .secondary
            .labels
            .as_ref()
            .ok_or_else(|| ModelError::Execution("secondary labels missing".into()))?;

        let proba = forest::forest_proba(forest, &x)?;
        if proba.len() != labels.len() {
            return Err(ModelError::Execution(format!(
                "secondary model emits {} classes for {} labels",
                proba.len(),
                labels.len()
            )));
        }

        let (best, _) = proba
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(|| ModelError::Execution("secondary model emitted no classes".into()))?;

        let suspicion: f64 = labels
            .iter()
            .zip(&proba)
            .filter(|(label, _)| {
                SUSPICIOUS_TRAFFIC.iter().any(|s| label.eq_ignore_ascii_case(s))
            })
            .map(|(_, p)| p)
            .sum();

        Ok((suspicion, labels[best].clone()))
    }

    /// Attack taxonomy. Indicator rules outrank model-only labels.
    fn classify(
        &self,
        event: &Event,
        hits: &IndicatorHits,
        flagged_s: bool,
        flagged_a: bool,
    ) -> AttackClass {
        let path = event.target_path.as_deref().map(str::to_lowercase);

        if event.action.contains("push") || event.action.contains("commit") {
            AttackClass::Exploit
        } else if event.action == "cred_access" || hits.path {
            AttackClass::CredentialAccess
        } else if path
            .as_deref()
            .is_some_and(|p| SENSITIVE_SUFFIXES.iter().any(|s| p.ends_with(s)))
        {
            AttackClass::DataExfil
        } else if event.action.contains("scan") || event.action.contains("probe") {
            AttackClass::Recon
        } else if flagged_s {
            AttackClass::KnownMalicious
        } else if flagged_a {
            AttackClass::UnknownAnomaly
        } else {
            AttackClass::Benign
        }
    }

    /// Static model block for `/health` and `/ml-insights`.
    pub fn summary(&self) -> EnsembleSummary {
        let summarize = |artifact: &Artifact, weight: f64| ModelSummary {
            kind: artifact.kind,
            columns: artifact.columns.len(),
            threshold: artifact.threshold,
            weight,
        };
        EnsembleSummary {
            supervised: summarize(&self.supervised, self.weights.supervised),
            unsupervised: summarize(&self.anomaly, self.weights.unsupervised),
            secondary: summarize(&self.secondary, self.weights.secondary),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::models::{canonicalize, RawEvent};

    fn event(action: &str, path: Option<&str>) -> Event {
        canonicalize(&RawEvent {
            observed_at: Some("2024-06-01T10:15:00Z".into()),
            source_address: Some("203.0.113.42".into()),
            protocol: Some("HTTP".into()),
            target_service: Some("git".into()),
            action: Some(action.into()),
            target_path: path.map(String::from),
            session_id: Some("s1".into()),
            user_agent: Some("curl/7.68.0".into()),
            headers: None,
            payload: None,
        })
        .unwrap()
    }

    #[test]
    fn credential_path_triggers_floor_and_class() {
        let ensemble = test_ensemble();
        let score = ensemble.score(&event("file_access", Some("secrets.yml")));

        assert!(score.value >= 0.65, "{}", score.value);
        assert!(matches!(score.band, Band::Medium | Band::High));
        assert_eq!(score.predicted_class, AttackClass::CredentialAccess);
        assert!(!score.degraded);
    }

    #[test]
    fn indicator_action_triggers_floor() {
        let ensemble = test_ensemble();
        let score = ensemble.score(&event("git_push", None));
        assert!(score.value >= 0.65);
        assert_eq!(score.predicted_class, AttackClass::Exploit);
    }

    #[test]
    fn benign_event_scores_low() {
        let ensemble = test_ensemble();
        let score = ensemble.score(&event("page_view", None));
        assert!(score.value < 0.65);
        assert_eq!(score.predicted_class, AttackClass::Benign);
        assert!(!score.is_anomaly);
        assert_eq!(score.traffic_class.as_deref(), Some("NORMAL"));
    }

    #[test]
    fn band_follows_value() {
        let ensemble = test_ensemble();
        for action in ["page_view", "git_push", "scan_attempt", "file_access"] {
            let score = ensemble.score(&event(action, None));
            assert_eq!(score.band, Band::from_value(score.value, &ensemble.bands));
        }
    }

    #[test]
    fn scan_actions_are_recon() {
        let ensemble = test_ensemble();
        let score = ensemble.score(&event("scan_attempt", None));
        assert_eq!(score.predicted_class, AttackClass::Recon);
    }

    #[test]
    fn sensitive_non_credential_file_is_exfil() {
        let ensemble = test_ensemble();
        let score = ensemble.score(&event("file_access", Some("deploy/config.json")));
        assert_eq!(score.predicted_class, AttackClass::DataExfil);
    }

    #[test]
    fn model_failure_degrades_not_fails() {
        let ensemble = ensemble_with_broken_anomaly();
        let e = event("git_push", None);
        let score = ensemble.score(&e);
        assert!(score.degraded);
        assert!(score.anomaly_component.is_none());

        // The failed component contributes zero to the weighted sum;
        // the floor then lifts the indicator event.
        let reference = test_ensemble();
        let healthy = reference.score(&e);
        assert!(score.value <= healthy.value + 1e-9);
        assert!(score.value >= 0.65);
    }

    #[test]
    fn degraded_weighted_sum_drops_failed_term() {
        let ensemble = ensemble_with_broken_anomaly();
        // No indicator, so no floor interferes with the arithmetic.
        let score = ensemble.score(&event("page_view", None));
        assert!(score.degraded);

        // p_s = 0.1 (indicator column is 0), p_t = 0.2 suspicious mass.
        let expected = 0.60 * 0.1 + 0.15 * 0.2;
        assert!((score.value - expected).abs() < 1e-9, "{}", score.value);
    }

    #[test]
    fn scoring_is_pure() {
        let ensemble = test_ensemble();
        let e = event("bruteforce", Some(".env"));
        let a = ensemble.score(&e);
        let b = ensemble.score(&e);
        assert_eq!(a.value.to_bits(), b.value.to_bits());
        assert_eq!(a, b);
    }

    #[test]
    fn anomaly_invariant_holds() {
        // is_anomaly with a sub-medium score requires the unsupervised flag.
        let ensemble = test_ensemble();
        for action in ["page_view", "git_push", "file_access", "scan_attempt", "bruteforce"] {
            for path in [None, Some("secrets.yml"), Some("index.html")] {
                let score = ensemble.score(&event(action, path));
                if score.is_anomaly && score.value < 0.40 {
                    // Only the unsupervised flag may justify this.
                    let unsup_flagged = score
                        .anomaly_component
                        .is_some_and(|s| s >= 0.75);
                    assert!(unsup_flagged, "{action} {:?}", path);
                }
            }
        }
    }

    #[test]
    fn summary_reports_weights() {
        let summary = test_ensemble().summary();
        assert_eq!(summary.supervised.weight, 0.60);
        assert_eq!(summary.unsupervised.columns, 2);
        assert_eq!(summary.secondary.threshold, 0.5);
    }
}
