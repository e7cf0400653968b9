//! Log-space message passing over the column chain: forward, backward,
//! most-probable-path traceback, posteriors and pruning.

use super::column::{Cell, MergeCell};
use super::RpHmm;
use crate::emission::{emission_log_probability, log_add, BitCountVectors, LOG_ZERO};
use crate::error::{PhaseError, Result};
use crate::params::PhaseParams;
use crate::partition::seq_in_hap1;
use crate::profile::ProfileSeq;
use std::collections::HashSet;
use std::sync::Arc;

impl RpHmm {
    fn initialise_forward(&mut self) {
        self.forward_log_prob = LOG_ZERO;
        for column in &mut self.columns {
            column.forward_log_prob = LOG_ZERO;
            for cell in &mut column.cells {
                cell.forward_log_prob = LOG_ZERO;
            }
        }
        for merge in &mut self.merge_columns {
            for cell in merge.cells_mut() {
                cell.forward_log_prob = LOG_ZERO;
            }
        }
    }

    fn initialise_backward(&mut self) {
        self.backward_log_prob = LOG_ZERO;
        for column in &mut self.columns {
            column.backward_log_prob = LOG_ZERO;
            for cell in &mut column.cells {
                cell.backward_log_prob = LOG_ZERO;
            }
        }
        for merge in &mut self.merge_columns {
            for cell in merge.cells_mut() {
                cell.backward_log_prob = LOG_ZERO;
            }
        }
    }

    /// Forward pass, head to tail. Each cell is seeded from its previous
    /// merge cell (log-zero when that cell was pruned away, log-one in the
    /// first column), picks up the column emission, and feeds its next
    /// merge cell or the HMM total.
    pub fn forward(&mut self) {
        self.initialise_forward();
        for index in 0..self.columns.len() {
            let bit_count_vectors = BitCountVectors::new(&self.columns[index]);
            for cell_index in 0..self.columns[index].cells.len() {
                let cell = self.columns[index].cells[cell_index];
                let seed = if index == 0 {
                    0.0
                } else {
                    match self.merge_columns[index - 1].previous_merge_cell_of(&cell) {
                        Some(merge_cell) => merge_cell.forward_log_prob,
                        None => LOG_ZERO,
                    }
                };
                let emission = emission_log_probability(
                    &self.columns[index],
                    &cell,
                    &bit_count_vectors,
                    &self.substitution_matrix,
                );
                let forward = seed + emission;
                self.columns[index].cells[cell_index].forward_log_prob = forward;
                if index + 1 < self.columns.len() {
                    if let Some(merge_cell) =
                        self.merge_columns[index].next_merge_cell_of_mut(&cell)
                    {
                        merge_cell.forward_log_prob =
                            log_add(merge_cell.forward_log_prob, forward);
                    }
                } else {
                    self.forward_log_prob = log_add(self.forward_log_prob, forward);
                }
                let column = &mut self.columns[index];
                column.forward_log_prob = log_add(column.forward_log_prob, forward);
            }
        }
    }

    /// Backward pass, tail to head: the mirror image of the forward pass,
    /// with the column emission added to the quantity propagated into the
    /// previous merge cell or the HMM total.
    pub fn backward(&mut self) {
        self.initialise_backward();
        for index in (0..self.columns.len()).rev() {
            let bit_count_vectors = BitCountVectors::new(&self.columns[index]);
            for cell_index in 0..self.columns[index].cells.len() {
                let cell = self.columns[index].cells[cell_index];
                let seed = if index + 1 == self.columns.len() {
                    0.0
                } else {
                    match self.merge_columns[index].next_merge_cell_of(&cell) {
                        Some(merge_cell) => merge_cell.backward_log_prob,
                        None => LOG_ZERO,
                    }
                };
                self.columns[index].cells[cell_index].backward_log_prob = seed;
                let emission = emission_log_probability(
                    &self.columns[index],
                    &cell,
                    &bit_count_vectors,
                    &self.substitution_matrix,
                );
                let propagated = seed + emission;
                if index > 0 {
                    if let Some(merge_cell) =
                        self.merge_columns[index - 1].previous_merge_cell_of_mut(&cell)
                    {
                        merge_cell.backward_log_prob =
                            log_add(merge_cell.backward_log_prob, propagated);
                    }
                } else {
                    self.backward_log_prob = log_add(self.backward_log_prob, propagated);
                }
                let column = &mut self.columns[index];
                column.backward_log_prob = log_add(column.backward_log_prob, propagated);
            }
        }
    }

    /// Run both passes. Pruning and traceback require both to have run on
    /// the current structure, so this is the operation drivers use.
    pub fn forward_backward(&mut self) {
        self.forward();
        self.backward();
    }

    /// Posterior probability of a merge cell, normalized by its right
    /// column's total.
    pub fn merge_cell_posterior(&self, merge_index: usize, cell: &MergeCell) -> f64 {
        let total = self.columns[merge_index + 1].total_log_prob();
        (cell.forward_log_prob + cell.backward_log_prob - total)
            .exp()
            .clamp(0.0, 1.0)
    }

    /// Drop cells and merge cells whose posterior falls below the
    /// configured threshold, leaving columns shallower than
    /// `min_column_depth_to_filter` untouched. Columns and merge columns
    /// themselves always survive. Valid only after [`forward_backward`].
    ///
    /// [`forward_backward`]: RpHmm::forward_backward
    pub fn prune(&mut self, params: &PhaseParams) {
        let threshold = params.posterior_probability_threshold;
        let min_depth = params.min_column_depth_to_filter;
        // Posterior denominators are frozen before any cell is dropped.
        let totals: Vec<f64> = self.columns.iter().map(|c| c.total_log_prob()).collect();
        for (column, &total) in self.columns.iter_mut().zip(&totals) {
            if column.depth() < min_depth {
                continue;
            }
            column.cells.retain(|cell| {
                let posterior = (cell.forward_log_prob + cell.backward_log_prob - total).exp();
                posterior.clamp(0.0, 1.0) >= threshold
            });
        }
        for (index, merge) in self.merge_columns.iter_mut().enumerate() {
            if merge.depth() < min_depth {
                continue;
            }
            let total = totals[index + 1];
            merge.retain_cells(|cell| {
                let posterior = (cell.forward_log_prob + cell.backward_log_prob - total).exp();
                posterior.clamp(0.0, 1.0) >= threshold
            });
        }
    }

    /// Trace the most probable path back through the forward matrix,
    /// returning one cell per column, head to tail.
    pub fn forward_traceback(&self) -> Result<Vec<Cell>> {
        let last = self.columns.last().expect("hmm has at least one column");
        let mut current = *last
            .cells
            .iter()
            .max_by(|a, b| a.forward_log_prob.total_cmp(&b.forward_log_prob))
            .ok_or(PhaseError::TracebackInfeasible)?;
        let mut path = vec![current];
        for index in (0..self.merge_columns.len()).rev() {
            let merge = &self.merge_columns[index];
            let merge_cell = merge
                .previous_merge_cell_of(&current)
                .ok_or(PhaseError::TracebackInfeasible)?;
            // The highest-forward cell of the previous column feeding the
            // same merge cell.
            let mut best: Option<Cell> = None;
            for cell in &self.columns[index].cells {
                let feeds = merge
                    .next_merge_cell_of(cell)
                    .map_or(false, |m| m.from_partition == merge_cell.from_partition);
                if feeds && best.map_or(true, |b| cell.forward_log_prob > b.forward_log_prob) {
                    best = Some(*cell);
                }
            }
            current = best.ok_or(PhaseError::TracebackInfeasible)?;
            path.push(current);
        }
        path.reverse();
        Ok(path)
    }

    /// The set of profile sequences assigned to the given haplotype (0 or
    /// 1) by a state path, deduplicated by sequence identity.
    pub fn partition_sequences_by_state_path(
        &self,
        path: &[Cell],
        haplotype: usize,
    ) -> Vec<Arc<ProfileSeq>> {
        assert!(haplotype < 2);
        debug_assert_eq!(path.len(), self.column_number());
        let want = haplotype == 1;
        let mut seen = HashSet::new();
        let mut seqs = Vec::new();
        for (column, cell) in self.columns.iter().zip(path) {
            for (index, seq) in column.seqs.iter().enumerate() {
                if seq_in_hap1(cell.partition, index) == want
                    && seen.insert(Arc::as_ptr(&seq.header) as usize)
                {
                    seqs.push(Arc::clone(&seq.header));
                }
            }
        }
        seqs
    }
}
