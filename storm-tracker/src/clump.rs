//! Connected-component clumping over run-length intervals
//!
//! Intervals are sorted into canonical (plane, row, begin, end) order and
//! swept row by row. Each interval is compared only against the intervals of
//! the next row (and, for volumes, the same row of the next plane); the
//! candidate range is found by binary search, so the whole pass is
//! O(n log n). Clump identity is kept in an index-based union-find.
//!
//! ## Overlap rule
//!
//! Two intervals A and B in adjacent rows link iff
//!
//! ```text
//! min(A.end, B.end) - max(A.begin, B.begin) + 1 >= min_overlap
//! ```
//!
//! - `min_overlap = +n`: the runs must share at least n columns
//! - `min_overlap = 0`: runs touching diagonally at a corner link
//! - `min_overlap = -n`: runs separated by a gap of up to n columns link
//!
//! The gap tolerance applies along the row only. Rows and planes are always
//! adjacent-only.

use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;

use crate::types::{Interval, Result, TrackError};

/// Clumping parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClumpParams {
    /// Minimum column overlap for intervals in adjacent rows to link
    pub min_overlap: i32,
    /// Also link the same row in adjacent planes (3-D clumping)
    pub link_planes: bool,
}

impl Default for ClumpParams {
    fn default() -> Self {
        Self {
            min_overlap: 1,
            link_planes: true,
        }
    }
}

/// Inclusive bounding box of a clump in grid indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_plane: u32,
    pub max_plane: u32,
    pub min_row: u32,
    pub max_row: u32,
    pub min_col: i32,
    pub max_col: i32,
}

impl BoundingBox {
    fn from_interval(iv: &Interval) -> Self {
        Self {
            min_plane: iv.plane,
            max_plane: iv.plane,
            min_row: iv.row,
            max_row: iv.row,
            min_col: iv.begin,
            max_col: iv.end,
        }
    }

    fn extend(&mut self, iv: &Interval) {
        self.min_plane = self.min_plane.min(iv.plane);
        self.max_plane = self.max_plane.max(iv.plane);
        self.min_row = self.min_row.min(iv.row);
        self.max_row = self.max_row.max(iv.row);
        self.min_col = self.min_col.min(iv.begin);
        self.max_col = self.max_col.max(iv.end);
    }
}

/// A connected set of intervals from one scan
#[derive(Debug, Clone, PartialEq)]
pub struct Clump {
    /// Clump id within the scan, starting at 1
    pub id: u32,
    /// Member intervals in canonical order
    pub intervals: Vec<Interval>,
    /// Total number of grid cells
    pub n_points: u32,
    /// Bounding box of the member intervals
    pub bbox: BoundingBox,
}

/// Output of one clumping pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClumpSet {
    /// Clumps ordered by id
    pub clumps: Vec<Clump>,
    /// For each input interval (in input order), the index of its clump
    pub interval_clump: Vec<usize>,
}

impl ClumpSet {
    /// Number of clumps found
    pub fn len(&self) -> usize {
        self.clumps.len()
    }

    /// True if no clumps were found
    pub fn is_empty(&self) -> bool {
        self.clumps.is_empty()
    }
}

/// Index-based disjoint-set forest with path splitting and union by rank
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn with_len(n: usize) -> std::result::Result<Self, TryReserveError> {
        let mut parent = Vec::new();
        parent.try_reserve_exact(n)?;
        parent.extend(0..n);
        let mut rank = Vec::new();
        rank.try_reserve_exact(n)?;
        rank.resize(n, 0);
        Ok(Self { parent, rank })
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            let next = self.parent[x];
            self.parent[x] = self.parent[next];
            x = next;
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (big, small) = if self.rank[ra] >= self.rank[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        if self.rank[big] == self.rank[small] {
            self.rank[big] = self.rank[big].saturating_add(1);
        }
    }
}

/// A run of sorted positions sharing one (plane, row)
#[derive(Debug, Clone, Copy)]
struct RowGroup {
    plane: u32,
    row: u32,
    start: usize,
    end: usize,
}

/// Connected-component labeller for interval data
#[derive(Debug, Clone)]
pub struct IntervalClumper {
    params: ClumpParams,
}

impl IntervalClumper {
    /// Create a clumper with the given parameters
    pub fn new(params: ClumpParams) -> Self {
        Self { params }
    }

    /// Parameters in use
    pub fn params(&self) -> &ClumpParams {
        &self.params
    }

    /// Clump a set of intervals.
    ///
    /// Intervals may arrive in any order, but runs in one row of one plane
    /// must not overlap each other. Either every clump is returned or an
    /// error is; there is no partial result.
    pub fn clump(&self, intervals: &[Interval]) -> Result<ClumpSet> {
        let n = intervals.len();
        if n == 0 {
            return Ok(ClumpSet::default());
        }

        for iv in intervals {
            if iv.end < iv.begin {
                return Err(TrackError::InvalidInterval(format!(
                    "plane {} row {}: end {} before begin {}",
                    iv.plane, iv.row, iv.end, iv.begin
                )));
            }
        }

        // Canonical order, stable, ties broken by end
        let mut order: Vec<usize> = Vec::new();
        order.try_reserve_exact(n).map_err(alloc_error)?;
        order.extend(0..n);
        order.sort_by_key(|&i| intervals[i].sort_key());

        let sorted = |pos: usize| &intervals[order[pos]];

        // Group sorted positions into rows
        let mut rows: Vec<RowGroup> = Vec::new();
        rows.try_reserve(n).map_err(alloc_error)?;
        let mut start = 0;
        for pos in 1..=n {
            let boundary = pos == n
                || sorted(pos).plane != sorted(start).plane
                || sorted(pos).row != sorted(start).row;
            if boundary {
                rows.push(RowGroup {
                    plane: sorted(start).plane,
                    row: sorted(start).row,
                    start,
                    end: pos,
                });
                start = pos;
            }
        }

        for group in &rows {
            for pos in group.start + 1..group.end {
                let prev = sorted(pos - 1);
                let cur = sorted(pos);
                if cur.begin <= prev.end {
                    return Err(TrackError::InvalidInterval(format!(
                        "plane {} row {}: runs [{}, {}] and [{}, {}] overlap",
                        cur.plane, cur.row, prev.begin, prev.end, cur.begin, cur.end
                    )));
                }
            }
        }

        let mut uf = UnionFind::with_len(n).map_err(alloc_error)?;
        let min_overlap = self.params.min_overlap as i64;

        for group in &rows {
            let mut neighbours = Vec::with_capacity(2);
            if let Some(next_row) = group.row.checked_add(1) {
                neighbours.push((group.plane, next_row));
            }
            if self.params.link_planes {
                if let Some(next_plane) = group.plane.checked_add(1) {
                    neighbours.push((next_plane, group.row));
                }
            }

            for key in neighbours {
                let Ok(idx) = rows.binary_search_by_key(&key, |g| (g.plane, g.row)) else {
                    continue;
                };
                let other = rows[idx];

                for a_pos in group.start..group.end {
                    let a = sorted(a_pos);
                    // First candidate: end >= a.begin + min_overlap - 1
                    let lower = a.begin as i64 + min_overlap - 1;
                    let first = other.start
                        + order[other.start..other.end]
                            .partition_point(|&i| (intervals[i].end as i64) < lower);
                    // Candidates stop once begin > a.end - min_overlap + 1
                    let upper = a.end as i64 - min_overlap + 1;
                    for b_pos in first..other.end {
                        let b = sorted(b_pos);
                        if b.begin as i64 > upper {
                            break;
                        }
                        if a.overlap(b) >= min_overlap {
                            uf.union(a_pos, b_pos);
                        }
                    }
                }
            }
        }

        // Assign clump ids in canonical order of each clump's first member
        let mut root_clump: Vec<usize> = Vec::new();
        root_clump.try_reserve_exact(n).map_err(alloc_error)?;
        root_clump.resize(n, usize::MAX);
        let mut interval_clump: Vec<usize> = Vec::new();
        interval_clump.try_reserve_exact(n).map_err(alloc_error)?;
        interval_clump.resize(n, 0);
        let mut clumps: Vec<Clump> = Vec::new();

        for pos in 0..n {
            let root = uf.find(pos);
            let iv = *sorted(pos);
            let clump_idx = if root_clump[root] == usize::MAX {
                clumps.try_reserve(1).map_err(alloc_error)?;
                clumps.push(Clump {
                    id: clumps.len() as u32 + 1,
                    intervals: Vec::new(),
                    n_points: 0,
                    bbox: BoundingBox::from_interval(&iv),
                });
                root_clump[root] = clumps.len() - 1;
                clumps.len() - 1
            } else {
                root_clump[root]
            };

            let clump = &mut clumps[clump_idx];
            clump.intervals.try_reserve(1).map_err(alloc_error)?;
            clump.intervals.push(iv);
            clump.n_points += iv.n_points();
            clump.bbox.extend(&iv);
            interval_clump[order[pos]] = clump_idx;
        }

        log::debug!("Clumped {} intervals into {} clumps", n, clumps.len());

        Ok(ClumpSet {
            clumps,
            interval_clump,
        })
    }
}

fn alloc_error(e: TryReserveError) -> TrackError {
    TrackError::Allocation(e.to_string())
}
