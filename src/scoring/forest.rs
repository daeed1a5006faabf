//! Tree evaluation
//!
//! Walks the tree dumps carried by model artifacts. Classifier forests
//! return an averaged class distribution; isolation forests return the
//! normalized anomaly score `2^(-E[h(x)]/c(n))`, higher = more anomalous.

use super::artifact::{IsoNode, ModelError, TreeNode};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average over the forest of per-leaf class distributions.
pub fn forest_proba(forest: &[Vec<TreeNode>], x: &[f64]) -> Result<Vec<f64>, ModelError> {
    if forest.is_empty() {
        return Err(ModelError::Execution("empty forest".into()));
    }

    let mut sums: Vec<f64> = Vec::new();
    for tree in forest {
        let leaf = walk_classifier(tree, x)?;
        if sums.is_empty() {
            sums = vec![0.0; leaf.len()];
        } else if sums.len() != leaf.len() {
            return Err(ModelError::Execution("inconsistent class count across trees".into()));
        }
        for (sum, v) in sums.iter_mut().zip(leaf) {
            *sum += v;
        }
    }

    let n = forest.len() as f64;
    Ok(sums.into_iter().map(|s| s / n).collect())
}

/// Follow one classifier tree down to its leaf distribution.
fn walk_classifier(tree: &[TreeNode], x: &[f64]) -> Result<Vec<f64>, ModelError> {
    let mut index = 0usize;
    // A well-formed tree terminates well before this.
    for _ in 0..=tree.len() {
        let node = tree
            .get(index)
            .ok_or_else(|| ModelError::Execution(format!("node index {index} out of range")))?;
        if node.feature < 0 {
            let total: f64 = node.value.iter().sum();
            if node.value.is_empty() || total <= 0.0 {
                return Err(ModelError::Execution("leaf without class votes".into()));
            }
            return Ok(node.value.iter().map(|v| v / total).collect());
        }
        let feature = node.feature as usize;
        let value = *x.get(feature).ok_or_else(|| {
            ModelError::Execution(format!(
                "feature index {feature} exceeds vector length {}",
                x.len()
            ))
        })?;
        index = if value <= node.threshold { node.left } else { node.right };
    }
    Err(ModelError::Execution("cycle detected in tree".into()))
}

/// Normalized isolation-forest anomaly score for one vector.
pub fn isolation_score(
    trees: &[Vec<IsoNode>],
    sample_size: usize,
    x: &[f64],
) -> Result<f64, ModelError> {
    if trees.is_empty() {
        return Err(ModelError::Execution("empty isolation forest".into()));
    }

    let mut total_path = 0.0;
    for tree in trees {
        total_path += path_length(tree, x)?;
    }
    let mean_path = total_path / trees.len() as f64;

    let c = average_path_length(sample_size);
    if c <= 0.0 {
        return Err(ModelError::Execution("degenerate sample size".into()));
    }

    Ok((2.0_f64).powf(-mean_path / c))
}

fn path_length(tree: &[IsoNode], x: &[f64]) -> Result<f64, ModelError> {
    let mut index = 0usize;
    let mut depth = 0.0;
    for _ in 0..=tree.len() {
        let node = tree
            .get(index)
            .ok_or_else(|| ModelError::Execution(format!("node index {index} out of range")))?;
        if node.feature < 0 {
            // Unresolved subtree depth is estimated from the leaf size.
            return Ok(depth + average_path_length(node.size));
        }
        let feature = node.feature as usize;
        let value = *x.get(feature).ok_or_else(|| {
            ModelError::Execution(format!(
                "feature index {feature} exceeds vector length {}",
                x.len()
            ))
        })?;
        index = if value <= node.threshold { node.left } else { node.right };
        depth += 1.0;
    }
    Err(ModelError::Execution("cycle detected in tree".into()))
}

/// Expected path length of an unsuccessful BST search over `n` samples.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(feature: i64, threshold: f64, left: usize, right: usize) -> TreeNode {
        TreeNode { feature, threshold, left, right, value: Vec::new() }
    }

    fn leaf(value: Vec<f64>) -> TreeNode {
        TreeNode { feature: -1, threshold: 0.0, left: 0, right: 0, value }
    }

    fn stump() -> Vec<TreeNode> {
        vec![split(0, 0.5, 1, 2), leaf(vec![9.0, 1.0]), leaf(vec![1.0, 9.0])]
    }

    #[test]
    fn classifier_routes_by_threshold() {
        let forest = vec![stump()];
        let low = forest_proba(&forest, &[0.0, 0.0]).unwrap();
        assert!((low[1] - 0.1).abs() < 1e-9);

        let high = forest_proba(&forest, &[1.0, 0.0]).unwrap();
        assert!((high[1] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn forest_averages_trees() {
        let all_benign = vec![leaf(vec![1.0, 0.0])];
        let all_malicious = vec![leaf(vec![0.0, 1.0])];
        let proba = forest_proba(&[all_benign, all_malicious], &[0.0]).unwrap();
        assert!((proba[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn classifier_rejects_short_vector() {
        let forest = vec![vec![split(5, 0.5, 1, 2), leaf(vec![1.0]), leaf(vec![1.0])]];
        assert!(forest_proba(&forest, &[0.0]).is_err());
    }

    #[test]
    fn classifier_detects_cycles() {
        let forest = vec![vec![split(0, 0.5, 0, 0)]];
        assert!(forest_proba(&forest, &[0.0]).is_err());
    }

    fn iso_split(feature: i64, threshold: f64, left: usize, right: usize) -> IsoNode {
        IsoNode { feature, threshold, left, right, size: 0 }
    }

    fn iso_leaf(size: usize) -> IsoNode {
        IsoNode { feature: -1, threshold: 0.0, left: 0, right: 0, size }
    }

    #[test]
    fn isolated_points_score_higher() {
        // Left branch is a deep, populated region; right isolates fast.
        let tree = vec![
            iso_split(0, 0.5, 1, 2),
            iso_split(1, 0.5, 3, 4),
            iso_leaf(1),
            iso_leaf(64),
            iso_leaf(64),
        ];
        let trees = vec![tree];

        let common = isolation_score(&trees, 256, &[0.0, 0.0]).unwrap();
        let outlier = isolation_score(&trees, 256, &[1.0, 0.0]).unwrap();
        assert!(outlier > common, "{outlier} vs {common}");
        assert!(outlier > 0.0 && outlier < 1.0);
        assert!(common > 0.0 && common < 1.0);
    }

    #[test]
    fn isolation_score_is_deterministic() {
        let trees = vec![vec![iso_split(0, 0.5, 1, 2), iso_leaf(4), iso_leaf(32)]];
        let a = isolation_score(&trees, 128, &[0.3]).unwrap();
        let b = isolation_score(&trees, 128, &[0.3]).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn average_path_length_grows_with_n() {
        assert_eq!(average_path_length(1), 0.0);
        assert!(average_path_length(16) < average_path_length(256));
    }
}
