//! Block-interval arithmetic for the synced-range bookkeeping.
//!
//! The cache stores, per `(chain, source fingerprint)`, the set of block
//! ranges that are fully synced. The set is kept disjoint and maximal:
//! inserting `[5,10]` into `{[1,6], [12,20]}` yields `{[1,10], [12,20]}`.
//! Subtracting the cached set from a requested range yields the minimal
//! ranges left to fetch.

use serde::{Deserialize, Serialize};

/// An inclusive block-number range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInterval {
    pub from: u64,
    pub to: u64,
}

impl BlockInterval {
    /// Construct `[from, to]`; panics in debug builds if inverted.
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "inverted interval [{from}, {to}]");
        Self { from, to }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.from <= block && block <= self.to
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn is_empty(&self) -> bool {
        false // an inclusive interval always covers at least one block
    }

    /// Returns `true` if the two intervals overlap or touch, i.e. their
    /// union is a single contiguous interval.
    fn mergeable(&self, other: &BlockInterval) -> bool {
        // Adjacent counts: [1,5] and [6,9] merge into [1,9].
        self.from <= other.to.saturating_add(1) && other.from <= self.to.saturating_add(1)
    }
}

impl std::fmt::Display for BlockInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// A disjoint, maximal, sorted set of block intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    /// Sorted by `from`; pairwise disjoint and non-adjacent.
    intervals: Vec<BlockInterval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a set from stored rows. Merges as it inserts, so rows from
    /// an older, less-normalized store are tolerated.
    pub fn from_rows(rows: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut set = Self::new();
        for (from, to) in rows {
            set.insert(BlockInterval::new(from, to));
        }
        set
    }

    pub fn as_slice(&self) -> &[BlockInterval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of blocks covered.
    pub fn total_blocks(&self) -> u64 {
        self.intervals.iter().map(BlockInterval::len).sum()
    }

    /// Insert an interval, merging with any overlapping or adjacent ones.
    pub fn insert(&mut self, iv: BlockInterval) {
        let mut merged = iv;
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        let mut placed = false;

        for existing in self.intervals.drain(..) {
            if existing.mergeable(&merged) {
                merged = BlockInterval::new(
                    merged.from.min(existing.from),
                    merged.to.max(existing.to),
                );
            } else if existing.to < merged.from {
                out.push(existing);
            } else {
                // existing starts past the merged interval
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(existing);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.intervals = out;
    }

    /// Returns `true` if every block of `iv` is covered.
    pub fn covers(&self, iv: BlockInterval) -> bool {
        self.intervals
            .iter()
            .any(|c| c.from <= iv.from && iv.to <= c.to)
    }

    /// The required set `request \ self`, as minimal ordered ranges.
    /// This is the ordered sweep the historical fetcher plans from.
    pub fn subtract_from(&self, request: BlockInterval) -> Vec<BlockInterval> {
        let mut required = Vec::new();
        let mut cursor = request.from;

        for cached in &self.intervals {
            if cached.to < cursor {
                continue;
            }
            if cached.from > request.to {
                break;
            }
            if cached.from > cursor {
                required.push(BlockInterval::new(cursor, (cached.from - 1).min(request.to)));
            }
            cursor = cursor.max(cached.to.saturating_add(1));
            if cursor > request.to {
                return required;
            }
        }
        if cursor <= request.to {
            required.push(BlockInterval::new(cursor, request.to));
        }
        required
    }

    /// Truncate the set so nothing at or above `block` remains.
    /// Used on reorg rollback: `delete_from_block(N)` keeps `[.., N-1]`.
    pub fn truncate_at(&mut self, block: u64) {
        self.intervals.retain_mut(|iv| {
            if iv.from >= block {
                return false;
            }
            if iv.to >= block {
                iv.to = block - 1;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(from: u64, to: u64) -> BlockInterval {
        BlockInterval::new(from, to)
    }

    fn set(rows: &[(u64, u64)]) -> IntervalSet {
        IntervalSet::from_rows(rows.iter().copied())
    }

    #[test]
    fn insert_merges_overlap() {
        let mut s = set(&[(1, 6), (12, 20)]);
        s.insert(iv(5, 10));
        assert_eq!(s.as_slice(), &[iv(1, 10), iv(12, 20)]);
    }

    #[test]
    fn insert_merges_adjacent() {
        let mut s = set(&[(1, 5)]);
        s.insert(iv(6, 9));
        assert_eq!(s.as_slice(), &[iv(1, 9)]);
    }

    #[test]
    fn insert_bridges_multiple() {
        let mut s = set(&[(1, 3), (5, 7), (20, 25)]);
        s.insert(iv(2, 10));
        assert_eq!(s.as_slice(), &[iv(1, 10), iv(20, 25)]);
    }

    #[test]
    fn subtract_full_miss() {
        let s = IntervalSet::new();
        assert_eq!(s.subtract_from(iv(0, 100)), vec![iv(0, 100)]);
    }

    #[test]
    fn subtract_full_hit() {
        let s = set(&[(0, 100)]);
        assert!(s.subtract_from(iv(10, 50)).is_empty());
        assert!(s.covers(iv(10, 50)));
    }

    #[test]
    fn subtract_gaps() {
        let s = set(&[(10, 20), (40, 50)]);
        assert_eq!(
            s.subtract_from(iv(0, 60)),
            vec![iv(0, 9), iv(21, 39), iv(51, 60)]
        );
    }

    #[test]
    fn subtract_partial_edges() {
        let s = set(&[(10, 20)]);
        assert_eq!(s.subtract_from(iv(15, 30)), vec![iv(21, 30)]);
        assert_eq!(s.subtract_from(iv(0, 15)), vec![iv(0, 9)]);
    }

    #[test]
    fn truncate_splits_and_drops() {
        let mut s = set(&[(0, 10), (20, 30), (40, 50)]);
        s.truncate_at(25);
        assert_eq!(s.as_slice(), &[iv(0, 10), iv(20, 24)]);
    }

    #[test]
    fn truncate_at_interval_start_drops_it() {
        let mut s = set(&[(10, 20)]);
        s.truncate_at(10);
        assert!(s.is_empty());
    }

    // Disjointness + maximality after arbitrary insertion orders: every
    // block covered by any inserted interval is covered exactly once, and
    // no two stored intervals are mergeable.
    #[test]
    fn insert_invariants_hold_for_all_small_cases() {
        let candidates: Vec<BlockInterval> = (0u64..8)
            .flat_map(|a| (a..8).map(move |b| iv(a, b)))
            .collect();

        for x in &candidates {
            for y in &candidates {
                for z in &candidates {
                    let mut s = IntervalSet::new();
                    s.insert(*x);
                    s.insert(*y);
                    s.insert(*z);

                    // Pairwise non-mergeable (disjoint and maximal)
                    let ivs = s.as_slice();
                    for i in 0..ivs.len() {
                        for j in (i + 1)..ivs.len() {
                            assert!(
                                !ivs[i].mergeable(&ivs[j]),
                                "{} and {} should have merged (inserted {x}, {y}, {z})",
                                ivs[i],
                                ivs[j]
                            );
                        }
                    }

                    // Coverage matches the union
                    for block in 0u64..8 {
                        let expected =
                            x.contains(block) || y.contains(block) || z.contains(block);
                        let actual = ivs.iter().any(|i| i.contains(block));
                        assert_eq!(expected, actual, "block {block} after {x}, {y}, {z}");
                    }
                }
            }
        }
    }

    // Subtraction correctness over exhaustive small ranges.
    #[test]
    fn subtract_matches_per_block_membership() {
        let s = set(&[(2, 4), (7, 7), (10, 12)]);
        for from in 0u64..14 {
            for to in from..14 {
                let required = s.subtract_from(iv(from, to));
                for block in from..=to {
                    let in_required = required.iter().any(|r| r.contains(block));
                    let in_cached = s.as_slice().iter().any(|c| c.contains(block));
                    assert_eq!(
                        in_required, !in_cached,
                        "block {block} for request [{from}, {to}]"
                    );
                }
                // Required ranges are ordered and disjoint
                for w in required.windows(2) {
                    assert!(w[0].to + 1 < w[1].from);
                }
            }
        }
    }
}
