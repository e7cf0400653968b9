//! Random references, haplotypes and profile reads for exercising the
//! engine in tests. Production callers build profile sequences from real
//! alignments instead.

use crate::profile::{ProfileSeq, ALPHABET_SIZE, MAX_PROB};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

const BASES: [u8; 4] = *b"ACGT";

const fn base_table() -> [usize; 256] {
    let mut slots = [0; 256];
    slots[b'A' as usize] = 0;
    slots[b'C' as usize] = 1;
    slots[b'G' as usize] = 2;
    slots[b'T' as usize] = 3;
    slots
}
const BASE_TABLE: [usize; 256] = base_table();

/// Generate a uniform random reference sequence.
pub fn generate_reference<R: Rng>(rng: &mut R, length: usize) -> Vec<u8> {
    (0..length)
        .filter_map(|_| BASES.choose(rng))
        .copied()
        .collect()
}

/// Copy a sequence, replacing each position with a random base at rate
/// `het_rate`.
pub fn permute_sequence<R: Rng>(seq: &[u8], het_rate: f64, rng: &mut R) -> Vec<u8> {
    seq.iter()
        .map(|&base| {
            if rng.gen_bool(het_rate) {
                *BASES.choose(rng).unwrap()
            } else {
                base
            }
        })
        .collect()
}

/// A read over a random subinterval of the haplotype: at each position the
/// haplotype base, or a uniform random base at rate `error_rate`, with the
/// full quantized mass on the observed base.
pub fn random_profile_seq<R: Rng>(
    reference_name: &str,
    hap_seq: &[u8],
    read_length: usize,
    error_rate: f64,
    rng: &mut R,
) -> ProfileSeq {
    assert!(read_length > 0 && read_length <= hap_seq.len());
    let start = rng.gen_range(0..=hap_seq.len() - read_length);
    let mut seq = ProfileSeq::new(reference_name, start, read_length);
    for position in 0..read_length {
        let base = if rng.gen_bool(error_rate) {
            *BASES.choose(rng).unwrap()
        } else {
            hap_seq[start + position]
        };
        seq.probs[position * ALPHABET_SIZE + BASE_TABLE[base as usize]] = MAX_PROB;
    }
    seq
}

/// Sample reads from two haplotypes, templating from either uniformly,
/// until `coverage * reference_length` bases are simulated. The reads of
/// each haplotype are returned separately so callers can score the
/// recovered partition.
pub fn simulate_reads<R: Rng>(
    reference_name: &str,
    hap1: &[u8],
    hap2: &[u8],
    coverage: usize,
    read_length_range: (usize, usize),
    error_rate: f64,
    rng: &mut R,
) -> (Vec<Arc<ProfileSeq>>, Vec<Arc<ProfileSeq>>) {
    assert_eq!(hap1.len(), hap2.len());
    let (min_length, max_length) = read_length_range;
    let mut hap1_reads = Vec::new();
    let mut hap2_reads = Vec::new();
    let mut bases_left = (coverage * hap1.len()) as i64;
    while bases_left > 0 {
        let read_length = rng.gen_range(min_length..=max_length);
        if rng.gen_bool(0.5) {
            hap1_reads.push(Arc::new(random_profile_seq(
                reference_name,
                hap1,
                read_length,
                error_rate,
                rng,
            )));
        } else {
            hap2_reads.push(Arc::new(random_profile_seq(
                reference_name,
                hap2,
                read_length,
                error_rate,
                rng,
            )));
        }
        bases_left -= read_length as i64;
    }
    (hap1_reads, hap2_reads)
}
