//! Organizing per-read HMMs into tiling paths and merging them.
//!
//! A tiling path is a maximal chain of HMMs that do not overlap on the
//! reference, ordered by coordinate. Overlapping reads therefore land in
//! different paths, and the paths are merged pairwise: overlapping
//! stretches are fused, column-aligned, cross-producted, scored and
//! pruned. The recursive halving over path sets is the only concurrency
//! seam of the engine; the two halves touch disjoint HMMs and run under
//! `rayon::join`.

use crate::error::Result;
use crate::hmm::RpHmm;
use crate::params::PhaseParams;
use log::{debug, warn};

fn sort_by_coordinate(hmms: &mut [RpHmm]) {
    hmms.sort_by(|a, b| a.coord_key().cmp(&b.coord_key()));
}

/// Decompose a set of HMMs into tiling paths: repeatedly take the
/// smallest remaining HMM and extend it with the closest remaining HMM
/// that starts at or after the chain end (a different reference always
/// qualifies), emitting one path per round.
pub(crate) fn tiling_paths(mut hmms: Vec<RpHmm>) -> Vec<Vec<RpHmm>> {
    sort_by_coordinate(&mut hmms);
    let mut slots: Vec<Option<RpHmm>> = hmms.into_iter().map(Some).collect();
    let mut remaining = slots.len();
    let mut paths = Vec::new();
    while remaining > 0 {
        let first = slots
            .iter()
            .position(|slot| slot.is_some())
            .expect("remaining hmm exists");
        let mut path = vec![slots[first].take().unwrap()];
        remaining -= 1;
        let mut scan = first + 1;
        while scan < slots.len() {
            let current = path.last().unwrap();
            let next = slots[scan..].iter().position(|slot| {
                slot.as_ref().map_or(false, |hmm| {
                    hmm.reference_name != current.reference_name
                        || hmm.ref_start >= current.ref_end()
                })
            });
            match next {
                Some(offset) => {
                    path.push(slots[scan + offset].take().unwrap());
                    remaining -= 1;
                    scan += offset + 1;
                }
                None => break,
            }
        }
        paths.push(path);
    }
    paths
}

/// Group the HMMs of two tiling paths into the connected components of
/// the transitive overlap relation. Both inputs are sorted and internally
/// non-overlapping, so a coordinate sweep over their union finds the
/// components; HMMs overlapping nothing become singletons.
fn overlapping_components(path1: Vec<RpHmm>, path2: Vec<RpHmm>) -> Vec<Vec<RpHmm>> {
    let mut hmms: Vec<RpHmm> = path1.into_iter().chain(path2).collect();
    sort_by_coordinate(&mut hmms);
    let mut components: Vec<Vec<RpHmm>> = Vec::new();
    let mut open_end = 0;
    for hmm in hmms {
        let joins = components.last().map_or(false, |component| {
            let last = component.last().unwrap();
            last.reference_name == hmm.reference_name && hmm.ref_start < open_end
        });
        if joins {
            open_end = open_end.max(hmm.ref_end());
            components.last_mut().unwrap().push(hmm);
        } else {
            open_end = hmm.ref_end();
            components.push(vec![hmm]);
        }
    }
    components
}

/// Fuse the HMMs of one tiling path into a single HMM.
fn fuse_tiling_path(path: Vec<RpHmm>) -> Result<RpHmm> {
    let mut hmms = path.into_iter();
    let mut fused = hmms.next().expect("tiling path is never empty");
    for hmm in hmms {
        fused = fused.fuse(hmm)?;
    }
    Ok(fused)
}

/// Merge two tiling paths into one. Each overlap component with two
/// sub-paths is fused, column-aligned, cross-producted, scored and
/// pruned; singleton components pass through unchanged.
fn merge_two_tiling_paths(
    path1: Vec<RpHmm>,
    path2: Vec<RpHmm>,
    params: &PhaseParams,
) -> Result<Vec<RpHmm>> {
    let mut merged = Vec::new();
    for component in overlapping_components(path1, path2) {
        if component.len() == 1 {
            merged.extend(component);
            continue;
        }
        let mut sub_paths = tiling_paths(component);
        // A connected component of two non-overlapping chains decomposes
        // into exactly two maximal chains.
        assert_eq!(sub_paths.len(), 2);
        let sub_path2 = sub_paths.pop().unwrap();
        let sub_path1 = sub_paths.pop().unwrap();
        let mut hmm1 = fuse_tiling_path(sub_path1)?;
        let mut hmm2 = fuse_tiling_path(sub_path2)?;
        RpHmm::align_columns(&mut hmm1, &mut hmm2)?;
        let mut hmm = hmm1.cross_product(&hmm2)?;
        hmm.forward_backward();
        hmm.prune(params);
        merged.push(hmm);
    }
    sort_by_coordinate(&mut merged);
    Ok(merged)
}

/// Merge a set of tiling paths into one, halving recursively; the two
/// halves operate on disjoint HMMs and run in parallel.
pub(crate) fn merge_tiling_paths(
    mut paths: Vec<Vec<RpHmm>>,
    params: &PhaseParams,
) -> Result<Vec<RpHmm>> {
    match paths.len() {
        0 => {
            warn!("zero tiling paths to merge");
            Ok(Vec::new())
        }
        1 => Ok(paths.pop().unwrap()),
        2 => {
            let path2 = paths.pop().unwrap();
            let path1 = paths.pop().unwrap();
            merge_two_tiling_paths(path1, path2, params)
        }
        n => {
            debug!("merging {} tiling paths by recursive halving", n);
            let tail = paths.split_off(n / 2);
            let (head, tail) = rayon::join(
                || merge_tiling_paths(paths, params),
                || merge_tiling_paths(tail, params),
            );
            merge_two_tiling_paths(head?, tail?, params)
        }
    }
}
