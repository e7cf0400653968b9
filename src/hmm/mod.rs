//! The read-partitioning HMM.
//!
//! An HMM covers one contiguous reference interval with a chain of
//! columns separated by merge columns. Both live in arenas owned by the
//! HMM (`columns[i]` is followed by `merge_columns[i]`, which is followed
//! by `columns[i + 1]`), so the doubly-linked chain of the model is plain
//! index arithmetic. Hidden states are bit-packed bipartitions of the
//! reads spanning each column; the passes over them live in
//! [`inference`](self::inference) and the emission model in
//! [`crate::emission`].

pub mod column;
mod inference;

use crate::emission::LOG_ZERO;
use crate::error::{PhaseError, Result};
use crate::params::SubstitutionMatrix;
use crate::partition::{merge_partitions, MAX_PARTITION_DEPTH};
use crate::profile::ProfileSeq;
use column::{Cell, Column, ColumnSeq, MergeColumn};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RpHmm {
    pub reference_name: String,
    pub ref_start: usize,
    pub ref_length: usize,
    /// The profile sequences this HMM covers.
    pub profile_seqs: Vec<Arc<ProfileSeq>>,
    pub substitution_matrix: Arc<SubstitutionMatrix>,
    pub(crate) columns: Vec<Column>,
    pub(crate) merge_columns: Vec<MergeColumn>,
    pub max_depth: usize,
    pub forward_log_prob: f64,
    pub backward_log_prob: f64,
}

impl RpHmm {
    /// The HMM representing a single profile sequence: one depth-1 column
    /// with the two possible assignments of the read.
    pub fn from_profile_seq(seq: Arc<ProfileSeq>, matrix: Arc<SubstitutionMatrix>) -> Self {
        let col_seq = ColumnSeq {
            header: Arc::clone(&seq),
            offset: 0,
        };
        let mut column = Column::new(seq.ref_start, seq.length, vec![col_seq]);
        column.cells.push(Cell::new(1));
        column.cells.push(Cell::new(0));
        Self {
            reference_name: seq.reference_name.clone(),
            ref_start: seq.ref_start,
            ref_length: seq.length,
            profile_seqs: vec![seq],
            substitution_matrix: matrix,
            columns: vec![column],
            merge_columns: Vec::new(),
            max_depth: 1,
            forward_log_prob: LOG_ZERO,
            backward_log_prob: LOG_ZERO,
        }
    }

    pub fn ref_end(&self) -> usize {
        self.ref_start + self.ref_length
    }
    pub fn column_number(&self) -> usize {
        self.columns.len()
    }
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
    pub fn merge_columns(&self) -> &[MergeColumn] {
        &self.merge_columns
    }
    /// Ordering key: HMMs compare lexicographically by reference name,
    /// start and length.
    pub fn coord_key(&self) -> (&str, usize, usize) {
        (&self.reference_name, self.ref_start, self.ref_length)
    }
    /// Whether the two HMMs cover overlapping reference intervals.
    pub fn overlaps(&self, other: &RpHmm) -> bool {
        assert!(self.ref_length > 0 && other.ref_length > 0);
        self.reference_name == other.reference_name
            && self.ref_start.max(other.ref_start) < self.ref_end().min(other.ref_end())
    }

    /// Split column `index` at offset `at`, splicing the right half and
    /// the identity merge column into the arenas.
    pub(crate) fn split_column(&mut self, index: usize, at: usize) {
        let (right, merge) = self.columns[index].split(at);
        self.columns.insert(index + 1, right);
        self.merge_columns.insert(index, merge);
    }

    /// Fuse two non-overlapping HMMs on the same reference into one,
    /// `self` preceding `right`. A trivial merge column joins the chains;
    /// a positive gap between them is covered by a depth-0 column holding
    /// the single empty partition.
    pub fn fuse(mut self, mut right: RpHmm) -> Result<RpHmm> {
        if self.reference_name != right.reference_name {
            return Err(PhaseError::mismatch(
                "fusing two hmms not on the same reference sequence",
            ));
        }
        if !Arc::ptr_eq(&self.substitution_matrix, &right.substitution_matrix) {
            return Err(PhaseError::mismatch(
                "fusing two hmms with different substitution matrices",
            ));
        }
        if self.ref_end() > right.ref_start {
            return Err(PhaseError::mismatch(
                "fusing two hmms that overlap or are out of order",
            ));
        }
        let gap = right.ref_start - self.ref_end();
        self.merge_columns.push(trivial_merge_column());
        if gap > 0 {
            let mut column = Column::new(self.ref_end(), gap, Vec::new());
            column.cells.push(Cell::new(0));
            self.columns.push(column);
            self.merge_columns.push(trivial_merge_column());
        }
        self.ref_length = right.ref_end() - self.ref_start;
        self.columns.append(&mut right.columns);
        self.merge_columns.append(&mut right.merge_columns);
        self.profile_seqs.append(&mut right.profile_seqs);
        self.max_depth = self.max_depth.max(right.max_depth);
        self.forward_log_prob = LOG_ZERO;
        self.backward_log_prob = LOG_ZERO;
        Ok(self)
    }

    /// Rework two overlapping HMMs in place until they span the same
    /// reference interval with identical column boundaries. Aligning
    /// already-aligned HMMs changes nothing.
    pub fn align_columns(hmm1: &mut RpHmm, hmm2: &mut RpHmm) -> Result<()> {
        if !hmm1.overlaps(hmm2) {
            return Err(PhaseError::mismatch(
                "aligning two hmms that do not overlap in reference coordinates",
            ));
        }
        // Orient so that hmm1 starts first, then extend hmm2 to the same
        // start coordinate.
        if hmm1.ref_start > hmm2.ref_start {
            return Self::align_columns(hmm2, hmm1);
        }
        if hmm1.ref_start < hmm2.ref_start {
            hmm2.prepend_empty_column(hmm1.ref_start);
        }
        // Same again for the end coordinate.
        if hmm1.ref_length < hmm2.ref_length {
            return Self::align_columns(hmm2, hmm1);
        }
        if hmm1.ref_length > hmm2.ref_length {
            hmm2.append_empty_column(hmm1.ref_end());
        }
        // Both cover the same interval; walk the chains in lockstep and
        // split whichever column is longer.
        let mut index = 0;
        while index < hmm1.columns.len() {
            debug_assert!(index < hmm2.columns.len());
            debug_assert_eq!(hmm1.columns[index].ref_start, hmm2.columns[index].ref_start);
            let length1 = hmm1.columns[index].length;
            let length2 = hmm2.columns[index].length;
            if length1 > length2 {
                hmm1.split_column(index, length2);
            } else if length2 > length1 {
                hmm2.split_column(index, length1);
            }
            index += 1;
        }
        debug_assert_eq!(hmm1.column_number(), hmm2.column_number());
        Ok(())
    }

    fn prepend_empty_column(&mut self, new_start: usize) {
        let mut column = Column::new(new_start, self.ref_start - new_start, Vec::new());
        column.cells.push(Cell::new(0));
        self.columns.insert(0, column);
        self.merge_columns.insert(0, trivial_merge_column());
        self.ref_length += self.ref_start - new_start;
        self.ref_start = new_start;
    }

    fn append_empty_column(&mut self, new_end: usize) {
        let mut column = Column::new(self.ref_end(), new_end - self.ref_end(), Vec::new());
        column.cells.push(Cell::new(0));
        self.merge_columns.push(trivial_merge_column());
        self.columns.push(column);
        self.ref_length = new_end - self.ref_start;
    }

    /// The HMM whose state spaces are the Cartesian products of the two
    /// column-aligned inputs.
    ///
    /// `merge_partitions` places the second operand's reads in the low
    /// bits, so every product column concatenates `other`'s reads before
    /// `self`'s to keep bit `i` owned by read `i`.
    pub fn cross_product(&self, other: &RpHmm) -> Result<RpHmm> {
        if !Arc::ptr_eq(&self.substitution_matrix, &other.substitution_matrix) {
            return Err(PhaseError::mismatch(
                "cross product of hmms with different substitution matrices",
            ));
        }
        if self.coord_key() != other.coord_key() || self.column_number() != other.column_number() {
            return Err(PhaseError::mismatch("cross product of two unaligned hmms"));
        }
        let mut columns = Vec::with_capacity(self.column_number());
        let mut max_depth = 0;
        for (column1, column2) in self.columns.iter().zip(&other.columns) {
            if (column1.ref_start, column1.length) != (column2.ref_start, column2.length) {
                return Err(PhaseError::mismatch("cross product of two unaligned hmms"));
            }
            let depth = column1.depth() + column2.depth();
            assert!(depth <= MAX_PARTITION_DEPTH);
            max_depth = max_depth.max(depth);
            let mut seqs = Vec::with_capacity(depth);
            seqs.extend(column2.seqs.iter().cloned());
            seqs.extend(column1.seqs.iter().cloned());
            let mut column = Column::new(column1.ref_start, column1.length, seqs);
            for cell1 in &column1.cells {
                for cell2 in &column2.cells {
                    column.cells.push(Cell::new(merge_partitions(
                        cell1.partition,
                        cell2.partition,
                        column1.depth(),
                        column2.depth(),
                    )));
                }
            }
            columns.push(column);
        }
        let mut merge_columns = Vec::with_capacity(self.merge_columns.len());
        for (index, (merge1, merge2)) in self
            .merge_columns
            .iter()
            .zip(&other.merge_columns)
            .enumerate()
        {
            let left_depth1 = self.columns[index].depth();
            let left_depth2 = other.columns[index].depth();
            let right_depth1 = self.columns[index + 1].depth();
            let right_depth2 = other.columns[index + 1].depth();
            let mask_from =
                merge_partitions(merge1.mask_from, merge2.mask_from, left_depth1, left_depth2);
            let mask_to =
                merge_partitions(merge1.mask_to, merge2.mask_to, right_depth1, right_depth2);
            let mut merge = MergeColumn::new(mask_from, mask_to);
            for cell1 in merge1.cells() {
                for cell2 in merge2.cells() {
                    let from = merge_partitions(
                        cell1.from_partition,
                        cell2.from_partition,
                        left_depth1,
                        left_depth2,
                    );
                    let to = merge_partitions(
                        cell1.to_partition,
                        cell2.to_partition,
                        right_depth1,
                        right_depth2,
                    );
                    merge.insert(from, to);
                }
            }
            merge_columns.push(merge);
        }
        let mut profile_seqs = self.profile_seqs.clone();
        profile_seqs.extend(other.profile_seqs.iter().cloned());
        Ok(RpHmm {
            reference_name: self.reference_name.clone(),
            ref_start: self.ref_start,
            ref_length: self.ref_length,
            profile_seqs,
            substitution_matrix: Arc::clone(&self.substitution_matrix),
            columns,
            merge_columns,
            max_depth,
            forward_log_prob: LOG_ZERO,
            backward_log_prob: LOG_ZERO,
        })
    }
}

fn trivial_merge_column() -> MergeColumn {
    let mut merge = MergeColumn::new(0, 0);
    merge.insert(0, 0);
    merge
}

impl fmt::Display for RpHmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hmm {}:{}-{} columns:{} max_depth:{} forward:{:.3} backward:{:.3}",
            self.reference_name,
            self.ref_start,
            self.ref_end(),
            self.column_number(),
            self.max_depth,
            self.forward_log_prob,
            self.backward_log_prob,
        )?;
        for (index, column) in self.columns.iter().enumerate() {
            write!(
                f,
                "\n  column {} start:{} len:{} depth:{} cells:{}",
                index,
                column.ref_start,
                column.length,
                column.depth(),
                column.cells.len(),
            )?;
            if index < self.merge_columns.len() {
                let merge = &self.merge_columns[index];
                write!(
                    f,
                    "\n  merge {} mask_from:{:b} mask_to:{:b} cells:{}",
                    index,
                    merge.mask_from,
                    merge.mask_to,
                    merge.depth(),
                )?;
            }
        }
        Ok(())
    }
}
