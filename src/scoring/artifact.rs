//! Model artifacts
//!
//! Trained models ship as portable JSON documents: the feature column
//! list, preprocessing state (scaler, categorical encoder tables, feature
//! selector), and a tree dump. Artifacts are opaque to the rest of the
//! collector; they are loaded once at startup and held immutably for the
//! process lifetime.

use std::collections::HashMap;
use std::fs;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot read model artifact {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse model artifact {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid model artifact {path}: {detail}")]
    Invalid { path: String, detail: String },

    #[error("model execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Supervised,
    Anomaly,
    Secondary,
}

/// Standardization parameters, one entry per feature column.
#[derive(Debug, Clone, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// One node of a classifier tree. Leaves carry `feature = -1` and the
/// per-class vote counts observed at training time.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeNode {
    pub feature: i64,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub left: usize,
    #[serde(default)]
    pub right: usize,
    #[serde(default)]
    pub value: Vec<f64>,
}

/// One node of an isolation tree. Leaves carry the training sample count
/// used to extrapolate the remaining path length.
#[derive(Debug, Clone, Deserialize)]
pub struct IsoNode {
    pub feature: i64,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub left: usize,
    #[serde(default)]
    pub right: usize,
    #[serde(default)]
    pub size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,

    /// Feature columns in model input order.
    pub columns: Vec<String>,

    #[serde(default)]
    pub scaler: Option<Scaler>,

    /// Categorical column -> label table. Unknown values map to the
    /// reserved code one past the table.
    #[serde(default)]
    pub encoders: HashMap<String, HashMap<String, f64>>,

    /// Optional feature selector: indices kept after scaling.
    #[serde(default)]
    pub selected: Option<Vec<usize>>,

    /// Classifier tree dump (supervised / secondary).
    #[serde(default)]
    pub forest: Option<Vec<Vec<TreeNode>>>,

    /// Class labels emitted by the secondary classifier.
    #[serde(default)]
    pub labels: Option<Vec<String>>,

    /// Isolation tree dump (anomaly).
    #[serde(default)]
    pub trees: Option<Vec<Vec<IsoNode>>>,

    /// Subsample size the isolation forest was trained with.
    #[serde(default)]
    pub sample_size: Option<usize>,

    /// Decision threshold: supervised flag cutoff on p, anomaly flag
    /// cutoff on the normalized score.
    pub threshold: f64,
}

impl Artifact {
    pub fn load(path: &str, expected: ArtifactKind) -> Result<Self, ModelError> {
        let bytes = fs::read(path).map_err(|source| ModelError::Read {
            path: path.to_string(),
            source,
        })?;
        let artifact: Artifact =
            serde_json::from_slice(&bytes).map_err(|source| ModelError::Parse {
                path: path.to_string(),
                source,
            })?;
        artifact.validate(path, expected)?;
        tracing::info!(
            path,
            kind = ?artifact.kind,
            columns = artifact.columns.len(),
            "model artifact loaded"
        );
        Ok(artifact)
    }

    fn validate(&self, path: &str, expected: ArtifactKind) -> Result<(), ModelError> {
        let invalid = |detail: String| ModelError::Invalid { path: path.to_string(), detail };

        if self.kind != expected {
            return Err(invalid(format!("expected {:?} artifact, found {:?}", expected, self.kind)));
        }
        if self.columns.is_empty() {
            return Err(invalid("no feature columns".into()));
        }
        if !self.threshold.is_finite() {
            return Err(invalid("threshold is not finite".into()));
        }
        if let Some(scaler) = &self.scaler {
            if scaler.mean.len() != self.columns.len() || scaler.scale.len() != self.columns.len() {
                return Err(invalid("scaler length does not match columns".into()));
            }
        }
        if let Some(selected) = &self.selected {
            if selected.iter().any(|&i| i >= self.columns.len()) {
                return Err(invalid("feature selector index out of range".into()));
            }
        }

        match self.kind {
            ArtifactKind::Supervised | ArtifactKind::Secondary => {
                let forest = self
                    .forest
                    .as_ref()
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| invalid("classifier artifact without forest".into()))?;
                for tree in forest {
                    for node in tree {
                        if node.feature >= 0
                            && (node.left >= tree.len() || node.right >= tree.len())
                        {
                            return Err(invalid("tree child index out of range".into()));
                        }
                    }
                }
                if self.kind == ArtifactKind::Secondary
                    && self.labels.as_ref().map_or(true, |l| l.is_empty())
                {
                    return Err(invalid("secondary artifact without class labels".into()));
                }
            }
            ArtifactKind::Anomaly => {
                let trees = self
                    .trees
                    .as_ref()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| invalid("anomaly artifact without isolation trees".into()))?;
                for tree in trees {
                    for node in tree {
                        if node.feature >= 0
                            && (node.left >= tree.len() || node.right >= tree.len())
                        {
                            return Err(invalid("tree child index out of range".into()));
                        }
                    }
                }
                if self.sample_size.map_or(true, |n| n < 2) {
                    return Err(invalid("anomaly artifact needs a sample size of at least 2".into()));
                }
            }
        }
        Ok(())
    }

    /// Reserved encoder code for values missing from a label table.
    pub fn unknown_code(table: &HashMap<String, f64>) -> f64 {
        table.len() as f64
    }
}
