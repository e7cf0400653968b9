//! Model parameters: the log substitution matrix and the knobs steering
//! tiling, pruning and coverage filtering.

use crate::partition::MAX_PARTITION_DEPTH;
use crate::profile::ALPHABET_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Row-major `log P(derived | source)` over the nucleotide alphabet.
///
/// The matrix is plain data shared process-wide; HMMs keep a reference to
/// it and two HMMs can only be combined when they point at the same
/// matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionMatrix {
    log_probs: [f64; ALPHABET_SIZE * ALPHABET_SIZE],
}

impl SubstitutionMatrix {
    pub fn new(log_probs: [f64; ALPHABET_SIZE * ALPHABET_SIZE]) -> Self {
        Self { log_probs }
    }
    /// A symmetric matrix with a flat substitution rate: `ln(1 - rate)` on
    /// the diagonal and `ln(rate / 3)` elsewhere.
    pub fn with_substitution_rate(rate: f64) -> Self {
        assert!(0.0 < rate && rate < 1.0);
        let mut log_probs = [(rate / 3.0).ln(); ALPHABET_SIZE * ALPHABET_SIZE];
        for base in 0..ALPHABET_SIZE {
            log_probs[base * ALPHABET_SIZE + base] = (1.0 - rate).ln();
        }
        Self { log_probs }
    }
    /// Log probability of observing `derived` given haplotype character
    /// `source`.
    pub fn log_prob(&self, source: usize, derived: usize) -> f64 {
        self.log_probs[source * ALPHABET_SIZE + derived]
    }
}

/// Parameter bag for the phasing driver.
#[derive(Debug, Clone)]
pub struct PhaseParams {
    /// Cells and merge cells with a posterior below this are pruned.
    pub posterior_probability_threshold: f64,
    /// Columns and merge columns shallower than this are never pruned.
    pub min_column_depth_to_filter: usize,
    /// Hard cap on the tiling depth, at most [`MAX_PARTITION_DEPTH`].
    pub max_coverage_depth: usize,
    /// Shared log substitution matrix.
    pub substitution_matrix: Arc<SubstitutionMatrix>,
}

impl PhaseParams {
    pub fn new(substitution_matrix: SubstitutionMatrix) -> Self {
        Self {
            posterior_probability_threshold: 0.1,
            min_column_depth_to_filter: 10,
            max_coverage_depth: MAX_PARTITION_DEPTH,
            substitution_matrix: Arc::new(substitution_matrix),
        }
    }
    /// The enforced coverage cap: the configured maximum, clamped to what
    /// the partition encoding supports.
    pub fn coverage_cap(&self) -> usize {
        self.max_coverage_depth.min(MAX_PARTITION_DEPTH)
    }
}
