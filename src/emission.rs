//! Emission probabilities of read partitions.
//!
//! The emission of a cell is computed from bit-count vectors: for each
//! position, character and bit plane of the quantized probability byte,
//! one `u64` whose bit `i` is the corresponding bit of read `i`'s byte.
//! Population counts of the vectors masked by a partition then recover the
//! expected number of observations of each character inside the partition
//! without touching the per-read tables again.

use crate::hmm::column::{Cell, Column};
use crate::params::SubstitutionMatrix;
use crate::partition::complement;
use crate::profile::{ALPHABET_SIZE, MAX_PROB, PROB_BITS};

/// Log of zero probability.
pub const LOG_ZERO: f64 = f64::NEG_INFINITY;

/// Add two probabilities in log space.
pub fn log_add(x: f64, y: f64) -> f64 {
    if x == LOG_ZERO {
        return y;
    }
    if y == LOG_ZERO {
        return x;
    }
    let (max, min) = if x > y { (x, y) } else { (y, x) };
    max + (min - max).exp().ln_1p()
}

/// The precomputed bit-count vectors of one column, laid out as
/// `[position][character][bit]`.
pub struct BitCountVectors {
    vectors: Vec<u64>,
}

impl BitCountVectors {
    pub fn new(column: &Column) -> Self {
        let mut vectors = vec![0u64; column.length * ALPHABET_SIZE * PROB_BITS];
        for position in 0..column.length {
            for base in 0..ALPHABET_SIZE {
                for bit in 0..PROB_BITS {
                    let mut vector = 0u64;
                    for (i, seq) in column.seqs.iter().enumerate() {
                        let byte = seq.prob_byte(position, base);
                        vector |= u64::from((byte >> bit) & 1) << i;
                    }
                    vectors[(position * ALPHABET_SIZE + base) * PROB_BITS + bit] = vector;
                }
            }
        }
        Self { vectors }
    }
    fn get(&self, position: usize, base: usize, bit: usize) -> u64 {
        self.vectors[(position * ALPHABET_SIZE + base) * PROB_BITS + bit]
    }
}

/// Expected number of observations of `base` at `position` among the reads
/// of `partition`, recovered from the bit-count vectors.
pub fn expected_instance_number(
    bit_count_vectors: &BitCountVectors,
    depth: usize,
    partition: u64,
    position: usize,
    base: usize,
) -> f64 {
    if depth == 0 {
        return 0.0;
    }
    let mut raw: u64 = 0;
    for bit in 0..PROB_BITS {
        let vector = bit_count_vectors.get(position, base, bit);
        raw += u64::from((vector & partition).count_ones()) << bit;
    }
    let expected = raw as f64 / (f64::from(MAX_PROB) * depth as f64);
    debug_assert!(expected >= 0.0);
    expected.min(depth as f64)
}

/// Log probability of the observed characters at one position of the
/// column under a partition: the log-sum over source characters of the
/// expected-count-weighted substitution scores.
fn position_log_probability(
    column: &Column,
    position: usize,
    partition: u64,
    bit_count_vectors: &BitCountVectors,
    matrix: &SubstitutionMatrix,
) -> f64 {
    let mut expected = [0.0; ALPHABET_SIZE];
    for (base, slot) in expected.iter_mut().enumerate() {
        *slot = expected_instance_number(
            bit_count_vectors,
            column.depth(),
            partition,
            position,
            base,
        );
    }
    let mut total = LOG_ZERO;
    for source in 0..ALPHABET_SIZE {
        let mut score = 0.0;
        for (base, &count) in expected.iter().enumerate() {
            score += matrix.log_prob(source, base) * count;
        }
        total = log_add(total, score);
    }
    total
}

/// Log probability of the reads of a partition over the whole column.
pub fn partition_log_probability(
    column: &Column,
    partition: u64,
    bit_count_vectors: &BitCountVectors,
    matrix: &SubstitutionMatrix,
) -> f64 {
    assert!(column.length > 0);
    (0..column.length)
        .map(|position| {
            position_log_probability(column, position, partition, bit_count_vectors, matrix)
        })
        .sum()
}

/// Emission log probability of a cell: the partition and its complement
/// each explained by one haplotype.
pub fn emission_log_probability(
    column: &Column,
    cell: &Cell,
    bit_count_vectors: &BitCountVectors,
    matrix: &SubstitutionMatrix,
) -> f64 {
    let hap2 = complement(cell.partition, column.depth());
    partition_log_probability(column, cell.partition, bit_count_vectors, matrix)
        + partition_log_probability(column, hap2, bit_count_vectors, matrix)
}
