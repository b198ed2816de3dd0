use crate::error::{EngineError, Result};

/// Pattern-to-partition assignment plus the reorder bookkeeping that keeps
/// the caller's pattern space stable across reorders.
///
/// Callers always address patterns by their original index. When partitions
/// are defined, patterns are regrouped so each partition occupies one
/// contiguous `[start, end)` range; the permutation (`order`) and its inverse
/// are retained so uploads can be gathered into engine order and site outputs
/// scattered back into caller order.
pub(crate) struct PatternLayout {
    patterns: usize,
    partition_count: usize,
    /// Partition of the pattern at each engine slot; identity layout keeps
    /// everything in partition 0.
    assignments: Vec<usize>,
    /// `starts[k]..starts[k + 1]` is partition `k`'s slot range.
    starts: Vec<usize>,
    /// `order[slot]` = original pattern index stored at `slot`.
    order: Vec<usize>,
    /// `inverse[original]` = engine slot holding that pattern.
    inverse: Vec<usize>,
    reordered: bool,
}

/// Gather indices for moving already-uploaded pattern-indexed data into the
/// new slot order: `new[slot] = old[gather[slot]]`.
pub(crate) struct ReorderPlan {
    pub gather: Vec<usize>,
    pub changed: bool,
}

impl PatternLayout {
    pub fn identity(patterns: usize) -> Self {
        Self {
            patterns,
            partition_count: 1,
            assignments: vec![0; patterns],
            starts: vec![0, patterns],
            order: (0..patterns).collect(),
            inverse: (0..patterns).collect(),
            reordered: false,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn reordered(&self) -> bool {
        self.reordered
    }

    /// Slot range `[start, end)` of one partition.
    pub fn range(&self, partition: usize) -> Result<(usize, usize)> {
        if partition >= self.partition_count {
            return Err(EngineError::OutOfRange {
                what: "partition",
                index: partition,
                limit: self.partition_count,
            });
        }
        Ok((self.starts[partition], self.starts[partition + 1]))
    }

    /// Caller-space pattern index stored at an engine slot.
    #[inline]
    pub fn original_of(&self, slot: usize) -> usize {
        self.order[slot]
    }

    /// Install a new partition assignment, given in caller pattern order.
    ///
    /// Produces the gather plan for permuting data that is already resident
    /// in the previous slot order.
    pub fn set_partitions(
        &mut self,
        partition_count: usize,
        assignments: &[usize],
    ) -> Result<ReorderPlan> {
        if partition_count == 0 {
            return Err(EngineError::OutOfRange {
                what: "partition count",
                index: 0,
                limit: 1,
            });
        }
        if assignments.len() != self.patterns {
            return Err(EngineError::OutOfRange {
                what: "partition assignment length",
                index: assignments.len(),
                limit: self.patterns,
            });
        }
        for &a in assignments {
            if a >= partition_count {
                return Err(EngineError::OutOfRange {
                    what: "partition assignment",
                    index: a,
                    limit: partition_count,
                });
            }
        }

        // Stable regrouping: within a partition, patterns keep their original
        // relative order.
        let mut new_order: Vec<usize> = (0..self.patterns).collect();
        new_order.sort_by_key(|&orig| assignments[orig]);

        let mut starts = vec![0usize; partition_count + 1];
        for &orig in &new_order {
            starts[assignments[orig] + 1] += 1;
        }
        for k in 0..partition_count {
            starts[k + 1] += starts[k];
        }

        // Resident data lives at the *previous* slot of each pattern.
        let gather: Vec<usize> = new_order.iter().map(|&orig| self.inverse[orig]).collect();
        let changed = gather.iter().enumerate().any(|(slot, &from)| slot != from);

        let mut inverse = vec![0usize; self.patterns];
        for (slot, &orig) in new_order.iter().enumerate() {
            inverse[orig] = slot;
        }
        self.partition_count = partition_count;
        self.assignments = new_order.iter().map(|&orig| assignments[orig]).collect();
        self.starts = starts;
        self.order = new_order;
        self.inverse = inverse;
        self.reordered = self.reordered || changed;

        Ok(ReorderPlan { gather, changed })
    }
}
