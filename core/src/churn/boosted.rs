//! Gradient-boosted tree ensemble for binary classification.
//!
//! Depth-limited regression trees fit to the logistic-loss gradient, with
//! Newton leaf values and per-sample weights. Small feature spaces (the
//! churn model sees three ordinal scores) keep the exact split search cheap.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// L2 regularization on leaf values.
const REG_LAMBDA: f64 = 1.0;
/// Minimum samples a node needs before a split is considered.
const MIN_SPLIT: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature:   usize,
        threshold: f64,
        left:      Box<Node>,
        right:     Box<Node>,
    },
}

impl Node {
    fn value_for(&self, row: ArrayView1<'_, f64>) -> f64 {
        match self {
            Node::Leaf { value } => *value,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.value_for(row)
                } else {
                    right.value_for(row)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    pub base_score:    f64,
    pub learning_rate: f64,
    pub trees:         Vec<Node>,
}

impl GradientBoostedTrees {
    /// Fit `iterations` trees of at most `depth` levels to the weighted
    /// logistic loss. `weights` carries the class-balancing sample weights.
    pub fn fit(
        x: &Array2<f64>,
        y: &[u8],
        weights: &[f64],
        iterations: usize,
        depth: usize,
        learning_rate: f64,
    ) -> Self {
        let n = x.nrows();
        debug_assert_eq!(n, y.len());
        debug_assert_eq!(n, weights.len());

        // Weighted prior log-odds.
        let w_pos: f64 = y
            .iter()
            .zip(weights)
            .filter(|(label, _)| **label == 1)
            .map(|(_, w)| *w)
            .sum();
        let w_neg: f64 = weights.iter().sum::<f64>() - w_pos;
        let base_score = ((w_pos + 1e-9) / (w_neg + 1e-9)).ln();

        let mut margin = vec![base_score; n];
        let mut trees = Vec::with_capacity(iterations);
        let all_indices: Vec<usize> = (0..n).collect();

        for _ in 0..iterations {
            let mut gradient = Vec::with_capacity(n);
            let mut hessian = Vec::with_capacity(n);
            for i in 0..n {
                let p = sigmoid(margin[i]);
                gradient.push(weights[i] * (f64::from(y[i]) - p));
                hessian.push(weights[i] * p * (1.0 - p));
            }

            let tree = build_tree(x, &gradient, &hessian, &all_indices, depth);
            for i in 0..n {
                margin[i] += learning_rate * tree.value_for(x.row(i));
            }
            trees.push(tree);
        }

        Self {
            base_score,
            learning_rate,
            trees,
        }
    }

    /// Positive-class probability for one feature row.
    pub fn predict_proba(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut score = self.base_score;
        for tree in &self.trees {
            score += self.learning_rate * tree.value_for(row);
        }
        sigmoid(score)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn leaf_value(gradient: &[f64], hessian: &[f64], indices: &[usize]) -> f64 {
    let g: f64 = indices.iter().map(|&i| gradient[i]).sum();
    let h: f64 = indices.iter().map(|&i| hessian[i]).sum();
    g / (h + REG_LAMBDA)
}

/// Gain score of a node under the Newton objective.
fn node_score(gradient: &[f64], hessian: &[f64], indices: &[usize]) -> f64 {
    let g: f64 = indices.iter().map(|&i| gradient[i]).sum();
    let h: f64 = indices.iter().map(|&i| hessian[i]).sum();
    g * g / (h + REG_LAMBDA)
}

fn build_tree(
    x: &Array2<f64>,
    gradient: &[f64],
    hessian: &[f64],
    indices: &[usize],
    depth: usize,
) -> Node {
    if depth == 0 || indices.len() < MIN_SPLIT {
        return Node::Leaf {
            value: leaf_value(gradient, hessian, indices),
        };
    }

    let parent_score = node_score(gradient, hessian, indices);
    let mut best: Option<(usize, f64, f64)> = None; // (feature, threshold, gain)

    for feature in 0..x.ncols() {
        let mut values: Vec<f64> = indices.iter().map(|&i| x[[i, feature]]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();

        for pair in values.windows(2) {
            let threshold = (pair[0] + pair[1]) / 2.0;
            let (left, right): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .copied()
                .partition(|&i| x[[i, feature]] <= threshold);
            if left.is_empty() || right.is_empty() {
                continue;
            }
            let gain = node_score(gradient, hessian, &left)
                + node_score(gradient, hessian, &right)
                - parent_score;
            if gain > best.map_or(1e-12, |(_, _, g)| g) {
                best = Some((feature, threshold, gain));
            }
        }
    }

    match best {
        None => Node::Leaf {
            value: leaf_value(gradient, hessian, indices),
        },
        Some((feature, threshold, _)) => {
            let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .copied()
                .partition(|&i| x[[i, feature]] <= threshold);
            Node::Split {
                feature,
                threshold,
                left:  Box::new(build_tree(x, gradient, hessian, &left_idx, depth - 1)),
                right: Box::new(build_tree(x, gradient, hessian, &right_idx, depth - 1)),
            }
        }
    }
}
