//! Read-partitioning hidden Markov models for phasing noisy sequencing
//! reads into two haplotypes.
//!
//! Each read is a [`ProfileSeq`]: per-position emission probabilities over
//! the nucleotide alphabet, anchored on a reference. The engine builds one
//! tiny HMM per read, organizes the HMMs into non-overlapping tiling
//! paths, and merges the paths pairwise (fuse, column-align,
//! cross-product, forward/backward, prune) until one HMM covers each
//! contiguous region of the reference. The hidden states are bit-packed
//! bipartitions of the reads spanning a column, so a forward/backward
//! sweep plus a traceback over the final HMMs recovers the most probable
//! assignment of every read to one of the two haplotypes.
//!
//! ## Modules
//! - `partition`: operations on bit-packed read bipartitions
//! - `profile`: profile sequences
//! - `params`: substitution matrix and driver parameters
//! - `emission`: bit-count vectors and partition emission probabilities
//! - `hmm`: the column chain, its combination operations and inference
//! - `gen_seq`: read simulation for tests
//! - `error`: error types

pub mod emission;
pub mod error;
pub mod gen_seq;
pub mod hmm;
pub mod params;
pub mod partition;
pub mod profile;
mod tiling;

pub use error::{PhaseError, Result};
pub use hmm::column::{Cell, Column, MergeCell, MergeColumn};
pub use hmm::RpHmm;
pub use params::{PhaseParams, SubstitutionMatrix};
pub use profile::ProfileSeq;

use log::debug;
use std::sync::Arc;

fn singleton_hmms(profile_seqs: &[Arc<ProfileSeq>], params: &PhaseParams) -> Result<Vec<RpHmm>> {
    profile_seqs
        .iter()
        .map(|seq| {
            if seq.length == 0 {
                return Err(PhaseError::InvalidCoordinates);
            }
            Ok(RpHmm::from_profile_seq(
                Arc::clone(seq),
                Arc::clone(&params.substitution_matrix),
            ))
        })
        .collect()
}

/// Build the read-partitioning HMMs for a set of profile sequences.
///
/// Returns one HMM per contiguous covered region, sorted by reference
/// coordinate and pairwise non-overlapping, with every input sequence
/// contained in exactly one of them. Fails with
/// [`PhaseError::CoverageExceeded`] when the reads tile deeper than the
/// configured maximum; thin the input with
/// [`filter_reads_by_coverage_depth`] first to avoid that. The returned
/// HMMs have been pruned against per-sub-region posteriors during
/// merging; run [`RpHmm::forward_backward`] on each before traceback.
pub fn get_rp_hmms(profile_seqs: &[Arc<ProfileSeq>], params: &PhaseParams) -> Result<Vec<RpHmm>> {
    let hmms = singleton_hmms(profile_seqs, params)?;
    let paths = tiling::tiling_paths(hmms);
    let cap = params.coverage_cap();
    if paths.len() > cap {
        return Err(PhaseError::CoverageExceeded {
            depth: paths.len(),
            max: cap,
        });
    }
    debug!(
        "merging {} tiling paths over {} profile sequences",
        paths.len(),
        profile_seqs.len()
    );
    tiling::merge_tiling_paths(paths, params)
}

/// Split the profile sequences into a subset whose coverage depth fits
/// `params.max_coverage_depth` and the discarded remainder, dropping
/// whole tiling paths from the deepest end.
pub fn filter_reads_by_coverage_depth(
    profile_seqs: &[Arc<ProfileSeq>],
    params: &PhaseParams,
) -> Result<(Vec<Arc<ProfileSeq>>, Vec<Arc<ProfileSeq>>)> {
    let hmms = singleton_hmms(profile_seqs, params)?;
    let mut paths = tiling::tiling_paths(hmms);
    let mut discarded = Vec::new();
    while paths.len() > params.coverage_cap() {
        let path = paths.pop().expect("paths is non-empty");
        discarded.extend(path.into_iter().flat_map(|hmm| hmm.profile_seqs));
    }
    debug!(
        "kept {} tiling paths, discarded {} sequences",
        paths.len(),
        discarded.len()
    );
    let kept = paths
        .into_iter()
        .flatten()
        .flat_map(|hmm| hmm.profile_seqs)
        .collect();
    Ok((kept, discarded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emission::LOG_ZERO;
    use crate::partition::{seq_in_hap1, MAX_PARTITION_DEPTH};
    use crate::profile::ALPHABET_SIZE;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;
    use std::collections::HashSet;

    const HET_RATE: f64 = 0.02;
    const READ_ERROR_RATE: f64 = 0.01;

    fn default_params() -> PhaseParams {
        PhaseParams::new(SubstitutionMatrix::with_substitution_rate(READ_ERROR_RATE))
    }

    fn seq_key(seq: &Arc<ProfileSeq>) -> usize {
        Arc::as_ptr(seq) as usize
    }

    /// Universal structural invariants of an HMM.
    fn check_structure(hmm: &RpHmm) {
        assert!(hmm.ref_length > 0);
        assert_eq!(hmm.merge_columns().len() + 1, hmm.column_number());
        let seq_set: HashSet<usize> = hmm.profile_seqs.iter().map(seq_key).collect();
        let mut expected_start = hmm.ref_start;
        let mut max_depth = 0;
        for (index, column) in hmm.columns().iter().enumerate() {
            // Columns abut and tile the HMM interval.
            assert_eq!(column.ref_start, expected_start);
            assert!(column.length > 0);
            expected_start = column.ref_end();
            assert!(column.depth() <= MAX_PARTITION_DEPTH);
            max_depth = max_depth.max(column.depth());
            for seq in &column.seqs {
                // Column reads are known to the HMM and span the column,
                // and the emission offsets point at the right slice.
                assert!(seq_set.contains(&(Arc::as_ptr(&seq.header) as usize)));
                assert_eq!(seq.header.reference_name, hmm.reference_name);
                assert!(seq.header.ref_start <= column.ref_start);
                assert!(column.ref_end() <= seq.header.ref_end());
                assert_eq!(
                    seq.offset,
                    (column.ref_start - seq.header.ref_start) * ALPHABET_SIZE
                );
            }
            // No partition carries bits above the column depth.
            if column.depth() < MAX_PARTITION_DEPTH {
                for cell in &column.cells {
                    assert_eq!(cell.partition >> column.depth(), 0);
                }
            }
            if index < hmm.merge_columns().len() {
                let merge = &hmm.merge_columns()[index];
                // Mask bits mirror read continuation across the boundary.
                for (bit, seq) in column.seqs.iter().enumerate() {
                    let continues = seq.header.ref_end() != column.ref_end();
                    assert_eq!(seq_in_hap1(merge.mask_from, bit), continues);
                }
                let right = &hmm.columns()[index + 1];
                for (bit, seq) in right.seqs.iter().enumerate() {
                    let continues = seq.header.ref_start != right.ref_start;
                    assert_eq!(seq_in_hap1(merge.mask_to, bit), continues);
                }
                // The from and to indexes address the same cells, and
                // stored partitions respect the masks.
                for cell in merge.cells() {
                    let by_from = merge.find_from(cell.from_partition).unwrap();
                    let by_to = merge.find_to(cell.to_partition).unwrap();
                    assert_eq!(by_from.to_partition, cell.to_partition);
                    assert_eq!(by_to.from_partition, cell.from_partition);
                    assert_eq!(cell.from_partition & merge.mask_from, cell.from_partition);
                    assert_eq!(cell.to_partition & merge.mask_to, cell.to_partition);
                }
            }
        }
        assert_eq!(expected_start, hmm.ref_end());
        assert_eq!(hmm.max_depth, max_depth);
    }

    /// Output contract of `get_rp_hmms`: sorted, non-overlapping, every
    /// read wholly contained in exactly one HMM.
    fn check_output_properties(
        hmms: &[RpHmm],
        reads: &[Arc<ProfileSeq>],
        reference_number: usize,
    ) {
        assert!(hmms.len() >= reference_number);
        for pair in hmms.windows(2) {
            assert!(pair[0].coord_key() <= pair[1].coord_key());
        }
        for (index, hmm) in hmms.iter().enumerate() {
            check_structure(hmm);
            for other in &hmms[index + 1..] {
                assert!(!hmm.overlaps(other));
            }
            for seq in &hmm.profile_seqs {
                assert_eq!(seq.reference_name, hmm.reference_name);
            }
        }
        for read in reads {
            let mut containing = 0;
            for hmm in hmms {
                if hmm.profile_seqs.iter().any(|s| Arc::ptr_eq(s, read)) {
                    containing += 1;
                    assert!(hmm.ref_start <= read.ref_start);
                    assert!(read.ref_end() <= hmm.ref_end());
                }
            }
            assert_eq!(containing, 1, "read contained in {} hmms", containing);
        }
    }

    /// Forward/backward consistency after both passes have run: the two
    /// totals agree, every column total matches them, and cell and
    /// merge-cell posteriors are distributions.
    fn check_consistency(hmm: &RpHmm) {
        if hmm.forward_log_prob == LOG_ZERO {
            // Over-pruned HMMs have no surviving path and nothing to
            // normalize against.
            return;
        }
        assert!((hmm.forward_log_prob - hmm.backward_log_prob).abs() < 0.01);
        for column in hmm.columns() {
            assert!((column.total_log_prob() - hmm.forward_log_prob).abs() < 0.01);
            let sum: f64 = column.cells.iter().map(|c| column.posterior(c)).sum();
            assert!((sum - 1.0).abs() < 0.01, "cell posteriors sum to {}", sum);
        }
        for (index, merge) in hmm.merge_columns().iter().enumerate() {
            let sum: f64 = merge
                .cells()
                .iter()
                .map(|c| hmm.merge_cell_posterior(index, c))
                .sum();
            assert!((sum - 1.0).abs() < 0.01, "merge posteriors sum to {}", sum);
        }
    }

    /// A traceback path visits one cell of every column and successive
    /// cells share the intervening merge cell.
    fn check_traceback(hmm: &RpHmm, path: &[Cell]) {
        assert_eq!(path.len(), hmm.column_number());
        for (column, cell) in hmm.columns().iter().zip(path) {
            assert!(column.cells.iter().any(|c| c.partition == cell.partition));
        }
        for (index, pair) in path.windows(2).enumerate() {
            let merge = &hmm.merge_columns()[index];
            let next = merge.next_merge_cell_of(&pair[0]).unwrap();
            let previous = merge.previous_merge_cell_of(&pair[1]).unwrap();
            assert_eq!(next.from_partition, previous.from_partition);
            assert_eq!(next.to_partition, previous.to_partition);
        }
    }

    fn recall(predicted: &[Arc<ProfileSeq>], actual: &[Arc<ProfileSeq>]) -> f64 {
        if actual.is_empty() {
            return 1.0;
        }
        let predicted_keys: HashSet<usize> = predicted.iter().map(seq_key).collect();
        let hits = actual
            .iter()
            .filter(|seq| predicted_keys.contains(&seq_key(seq)))
            .count();
        hits as f64 / actual.len() as f64
    }

    /// Highest number of reads covering any single reference position.
    fn max_point_depth(reads: &[Arc<ProfileSeq>], reference_length: usize) -> usize {
        (0..reference_length)
            .map(|position| {
                reads
                    .iter()
                    .filter(|read| read.ref_start <= position && position < read.ref_end())
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    struct Scenario {
        reference_number: (usize, usize),
        reference_length: (usize, usize),
        coverage: (usize, usize),
        read_length: (usize, usize),
        iterations: u64,
    }

    /// System-level run mirroring the end-to-end driver: simulate two
    /// haplotypes per reference, sample reads, thin by coverage, build the
    /// HMMs, then score and inspect them.
    fn run_system_scenario(scenario: &Scenario, params: &PhaseParams, seed: u64) {
        for iteration in 0..scenario.iterations {
            let mut rng: Xoshiro256StarStar = SeedableRng::seed_from_u64(seed + iteration);
            let reference_number =
                rng.gen_range(scenario.reference_number.0..=scenario.reference_number.1);
            let mut all_reads = Vec::new();
            for reference_index in 0..reference_number {
                let name = format!("reference_{}", reference_index);
                let length =
                    rng.gen_range(scenario.reference_length.0..=scenario.reference_length.1);
                let reference = gen_seq::generate_reference(&mut rng, length);
                let hap1 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
                let hap2 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
                let coverage = rng.gen_range(scenario.coverage.0..=scenario.coverage.1);
                let (reads1, reads2) = gen_seq::simulate_reads(
                    &name,
                    &hap1,
                    &hap2,
                    coverage,
                    scenario.read_length,
                    READ_ERROR_RATE,
                    &mut rng,
                );
                all_reads.extend(reads1);
                all_reads.extend(reads2);
            }
            let (kept, discarded) =
                filter_reads_by_coverage_depth(&all_reads, params).unwrap();
            assert_eq!(kept.len() + discarded.len(), all_reads.len());
            let hmms = get_rp_hmms(&kept, params).unwrap();
            check_output_properties(&hmms, &kept, reference_number);
            for mut hmm in hmms {
                hmm.forward_backward();
                check_consistency(&hmm);
                if hmm.forward_log_prob > LOG_ZERO {
                    let path = hmm.forward_traceback().unwrap();
                    check_traceback(&hmm, &path);
                }
            }
        }
    }

    #[test]
    fn system_single_reference_full_length_reads() {
        let params = default_params();
        for seed in 0..3u64 {
            let mut rng: Xoshiro256StarStar = SeedableRng::seed_from_u64(100 + seed);
            let reference = gen_seq::generate_reference(&mut rng, 1000);
            let hap1 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
            let hap2 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
            let (reads1, reads2) = gen_seq::simulate_reads(
                "reference_0",
                &hap1,
                &hap2,
                20,
                (1000, 1000),
                READ_ERROR_RATE,
                &mut rng,
            );
            let all_reads: Vec<_> = reads1.iter().chain(&reads2).cloned().collect();
            let hmms = get_rp_hmms(&all_reads, &params).unwrap();
            assert_eq!(hmms.len(), 1);
            check_output_properties(&hmms, &all_reads, 1);
            let mut hmm = hmms.into_iter().next().unwrap();
            hmm.forward_backward();
            check_consistency(&hmm);
            let path = hmm.forward_traceback().unwrap();
            check_traceback(&hmm, &path);
            let predicted1 = hmm.partition_sequences_by_state_path(&path, 1);
            let predicted2 = hmm.partition_sequences_by_state_path(&path, 0);
            assert_eq!(predicted1.len() + predicted2.len(), all_reads.len());
            let score = recall(&predicted1, &reads1).max(recall(&predicted2, &reads1));
            assert!(score >= 0.8, "haplotype recall {}", score);
        }
    }

    #[test]
    fn system_single_reference_fixed_length_reads() {
        let mut params = default_params();
        params.min_column_depth_to_filter = 6;
        let scenario = Scenario {
            reference_number: (1, 1),
            reference_length: (1000, 1000),
            coverage: (20, 20),
            read_length: (100, 100),
            iterations: 2,
        };
        run_system_scenario(&scenario, &params, 200);
        // The short reads produce genuinely multi-column HMMs with depth
        // bounded by the deepest pileup.
        let mut rng: Xoshiro256StarStar = SeedableRng::seed_from_u64(250);
        let reference = gen_seq::generate_reference(&mut rng, 1000);
        let hap1 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
        let hap2 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
        let (reads1, reads2) = gen_seq::simulate_reads(
            "reference_0",
            &hap1,
            &hap2,
            20,
            (100, 100),
            READ_ERROR_RATE,
            &mut rng,
        );
        let all_reads: Vec<_> = reads1.iter().chain(&reads2).cloned().collect();
        let (kept, _) = filter_reads_by_coverage_depth(&all_reads, &params).unwrap();
        let depth_bound = max_point_depth(&kept, 1000);
        let hmms = get_rp_hmms(&kept, &params).unwrap();
        assert!(hmms.iter().any(|hmm| hmm.column_number() > 1));
        for hmm in &hmms {
            assert!(hmm.max_depth <= depth_bound);
        }
    }

    #[test]
    fn system_single_reference_variable_length_reads() {
        let mut params = default_params();
        params.min_column_depth_to_filter = 6;
        let scenario = Scenario {
            reference_number: (1, 1),
            reference_length: (1000, 1000),
            coverage: (20, 20),
            read_length: (10, 300),
            iterations: 2,
        };
        run_system_scenario(&scenario, &params, 300);
    }

    #[test]
    fn system_multiple_references() {
        let mut params = default_params();
        params.min_column_depth_to_filter = 6;
        let scenario = Scenario {
            reference_number: (2, 5),
            reference_length: (1000, 2000),
            coverage: (5, 20),
            read_length: (10, 300),
            iterations: 2,
        };
        run_system_scenario(&scenario, &params, 400);
    }

    #[test]
    fn coverage_overflow_errors_directly_and_filters_cleanly() {
        let mut params = default_params();
        params.max_coverage_depth = 4;
        let mut rng: Xoshiro256StarStar = SeedableRng::seed_from_u64(500);
        let reference = gen_seq::generate_reference(&mut rng, 300);
        let hap1 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
        let hap2 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
        let (reads1, reads2) = gen_seq::simulate_reads(
            "reference_0",
            &hap1,
            &hap2,
            20,
            (300, 300),
            READ_ERROR_RATE,
            &mut rng,
        );
        let all_reads: Vec<_> = reads1.iter().chain(&reads2).cloned().collect();
        // Twenty full-length reads tile twenty deep: the direct call must
        // refuse.
        assert!(matches!(
            get_rp_hmms(&all_reads, &params),
            Err(PhaseError::CoverageExceeded { depth, max: 4 }) if depth == all_reads.len()
        ));
        // Thinning first yields a valid partitioning of the subset.
        let (kept, discarded) = filter_reads_by_coverage_depth(&all_reads, &params).unwrap();
        assert_eq!(kept.len() + discarded.len(), all_reads.len());
        assert!(kept.len() <= 4);
        let hmms = get_rp_hmms(&kept, &params).unwrap();
        assert_eq!(hmms.len(), 1);
        check_output_properties(&hmms, &kept, 1);
        let mut hmm = hmms.into_iter().next().unwrap();
        hmm.forward_backward();
        check_consistency(&hmm);
        let path = hmm.forward_traceback().unwrap();
        check_traceback(&hmm, &path);
        let hap1_set = hmm.partition_sequences_by_state_path(&path, 1);
        let hap2_set = hmm.partition_sequences_by_state_path(&path, 0);
        assert_eq!(hap1_set.len() + hap2_set.len(), kept.len());
        let keys1: HashSet<usize> = hap1_set.iter().map(seq_key).collect();
        assert!(hap2_set.iter().all(|seq| !keys1.contains(&seq_key(seq))));
    }

    #[test]
    fn over_pruning_never_yields_an_inconsistent_chain() {
        let mut params = default_params();
        params.posterior_probability_threshold = 0.99;
        params.min_column_depth_to_filter = 1;
        let mut rng: Xoshiro256StarStar = SeedableRng::seed_from_u64(600);
        let reference = gen_seq::generate_reference(&mut rng, 200);
        let hap1 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
        let hap2 = gen_seq::permute_sequence(&reference, HET_RATE, &mut rng);
        let (reads1, reads2) = gen_seq::simulate_reads(
            "reference_0",
            &hap1,
            &hap2,
            5,
            (100, 100),
            READ_ERROR_RATE,
            &mut rng,
        );
        let all_reads: Vec<_> = reads1.iter().chain(&reads2).cloned().collect();
        let hmms = get_rp_hmms(&all_reads, &params).unwrap();
        check_output_properties(&hmms, &all_reads, 1);
        for mut hmm in hmms {
            hmm.forward_backward();
            match hmm.forward_traceback() {
                Ok(path) => check_traceback(&hmm, &path),
                Err(PhaseError::TracebackInfeasible) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[test]
    fn zero_length_reads_are_rejected() {
        let params = default_params();
        let empty = Arc::new(ProfileSeq::new("reference_0", 0, 0));
        assert!(matches!(
            get_rp_hmms(&[empty.clone()], &params),
            Err(PhaseError::InvalidCoordinates)
        ));
        assert!(matches!(
            filter_reads_by_coverage_depth(&[empty], &params),
            Err(PhaseError::InvalidCoordinates)
        ));
    }
}
