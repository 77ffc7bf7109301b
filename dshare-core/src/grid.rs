//! Chunk grid and slice arithmetic
//!
//! Maps a requested slice onto the set of chunk indices whose coordinate
//! extents intersect it. Chunks are numbered in C order over the chunk grid.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Half-open `[start, stop)` range along one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimRange {
    pub start: u64,
    pub stop: u64,
}

impl DimRange {
    pub fn new(start: u64, stop: u64) -> Self {
        Self {
            start,
            stop: stop.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    pub fn intersect(&self, other: &DimRange) -> DimRange {
        DimRange::new(self.start.max(other.start), self.stop.min(other.stop))
    }
}

/// A resolved selection: one range per dimension, within the dataset shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    ranges: Vec<DimRange>,
}

impl Slice {
    pub fn new(ranges: Vec<DimRange>) -> Self {
        Self { ranges }
    }

    /// Selection covering the whole shape
    pub fn full(shape: &[u64]) -> Self {
        Self {
            ranges: shape.iter().map(|&n| DimRange::new(0, n)).collect(),
        }
    }

    pub fn ranges(&self) -> &[DimRange] {
        &self.ranges
    }

    pub fn ndim(&self) -> usize {
        self.ranges.len()
    }

    pub fn shape(&self) -> Vec<u64> {
        self.ranges.iter().map(|r| r.len()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.iter().any(|r| r.is_empty())
    }
}

/// One dimension of an unresolved slice expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DimSpec {
    Index(i64),
    Range { start: Option<i64>, stop: Option<i64> },
}

/// Textual slice such as `15:25` or `5:9,:,-1`, resolved against a shape
///
/// Follows Python indexing: omitted bounds, negative indices and clamping.
/// A single index selects a length-1 range and keeps the dimension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SliceSpec {
    dims: Vec<DimSpec>,
}

impl SliceSpec {
    /// The empty spec selects everything
    pub fn all() -> Self {
        Self::default()
    }

    pub fn resolve(&self, shape: &[u64]) -> Result<Slice> {
        if self.dims.len() > shape.len() {
            return Err(Error::InvalidSlice(format!(
                "{} dimensions given for a {}-dimensional dataset",
                self.dims.len(),
                shape.len()
            )));
        }
        let mut ranges = Vec::with_capacity(shape.len());
        for (i, &n) in shape.iter().enumerate() {
            let range = match self.dims.get(i) {
                None => DimRange::new(0, n),
                Some(DimSpec::Index(idx)) => {
                    let pos = if *idx < 0 { *idx + n as i64 } else { *idx };
                    if pos < 0 || pos as u64 >= n {
                        return Err(Error::InvalidSlice(format!(
                            "index {} out of bounds for dimension {} of size {}",
                            idx, i, n
                        )));
                    }
                    DimRange::new(pos as u64, pos as u64 + 1)
                }
                Some(DimSpec::Range { start, stop }) => {
                    let start = start.map(|s| clamp_bound(s, n)).unwrap_or(0);
                    let stop = stop.map(|s| clamp_bound(s, n)).unwrap_or(n);
                    DimRange::new(start, stop)
                }
            };
            ranges.push(range);
        }
        Ok(Slice::new(ranges))
    }
}

fn clamp_bound(bound: i64, n: u64) -> u64 {
    let n = n as i64;
    let b = if bound < 0 { bound + n } else { bound };
    b.clamp(0, n) as u64
}

impl FromStr for SliceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('[').trim_end_matches(']');
        if s.trim().is_empty() {
            return Ok(Self::all());
        }
        let mut dims = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            let parse = |v: &str| -> Result<Option<i64>> {
                let v = v.trim();
                if v.is_empty() {
                    return Ok(None);
                }
                v.parse::<i64>()
                    .map(Some)
                    .map_err(|_| Error::InvalidSlice(format!("bad bound {:?} in {:?}", v, s)))
            };
            let pieces: Vec<&str> = part.split(':').collect();
            let dim = match pieces.as_slice() {
                [idx] => match parse(idx)? {
                    Some(i) => DimSpec::Index(i),
                    None => return Err(Error::InvalidSlice(format!("empty dimension in {:?}", s))),
                },
                [start, stop] => DimSpec::Range {
                    start: parse(start)?,
                    stop: parse(stop)?,
                },
                _ => {
                    return Err(Error::InvalidSlice(format!(
                        "steps are not supported: {:?}",
                        part
                    )));
                }
            };
            dims.push(dim);
        }
        Ok(Self { dims })
    }
}

impl fmt::Display for SliceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .dims
            .iter()
            .map(|d| match d {
                DimSpec::Index(i) => i.to_string(),
                DimSpec::Range { start, stop } => format!(
                    "{}:{}",
                    start.map(|v| v.to_string()).unwrap_or_default(),
                    stop.map(|v| v.to_string()).unwrap_or_default()
                ),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Upper bound on the chunks of one dataset (slot table of 256 MiB)
pub const MAX_CHUNKS: u64 = 1 << 24;

fn checked_product(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
}

/// Regular chunk grid over a shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    shape: Vec<u64>,
    chunks: Vec<u64>,
    grid: Vec<u64>,
}

impl ChunkGrid {
    pub fn new(shape: Vec<u64>, chunks: Vec<u64>) -> Result<Self> {
        if shape.len() != chunks.len() {
            return Err(Error::InvalidSlice(format!(
                "chunk shape {:?} does not match shape {:?}",
                chunks, shape
            )));
        }
        if chunks.iter().any(|&c| c == 0) {
            return Err(Error::InvalidSlice(format!(
                "chunk shape {:?} has a zero extent",
                chunks
            )));
        }
        let grid: Vec<u64> = shape
            .iter()
            .zip(&chunks)
            .map(|(&n, &c)| n.div_ceil(c))
            .collect();
        let total = checked_product(&grid).filter(|&n| n <= MAX_CHUNKS);
        if total.is_none() {
            return Err(Error::InvalidSlice(format!(
                "shape {:?} in chunks {:?} exceeds {} chunks",
                shape, chunks, MAX_CHUNKS
            )));
        }
        if checked_product(&shape).is_none() || checked_product(&chunks).is_none() {
            return Err(Error::InvalidSlice(format!(
                "element count of shape {:?} / chunks {:?} overflows",
                shape, chunks
            )));
        }
        Ok(Self {
            shape,
            chunks,
            grid,
        })
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunks
    }

    /// Number of chunks along each dimension
    pub fn grid_shape(&self) -> &[u64] {
        &self.grid
    }

    pub fn total_chunks(&self) -> u64 {
        self.grid.iter().product()
    }

    /// Grid coordinates of flat chunk index `n`
    pub fn chunk_coords(&self, mut n: u64) -> Vec<u64> {
        let mut coords = vec![0; self.grid.len()];
        for d in (0..self.grid.len()).rev() {
            coords[d] = n % self.grid[d];
            n /= self.grid[d];
        }
        coords
    }

    /// Element ranges covered by chunk `n`, clipped to the dataset edge
    pub fn chunk_extent(&self, n: u64) -> Vec<DimRange> {
        self.chunk_coords(n)
            .iter()
            .enumerate()
            .map(|(d, &c)| {
                let start = c * self.chunks[d];
                DimRange::new(start, (start + self.chunks[d]).min(self.shape[d]))
            })
            .collect()
    }

    /// Flat indices, ascending, of every chunk intersecting `slice`
    pub fn overlapping_chunks(&self, slice: &Slice) -> Result<Vec<u64>> {
        if slice.ndim() != self.shape.len() {
            return Err(Error::InvalidSlice(format!(
                "{}-dimensional slice for a {}-dimensional grid",
                slice.ndim(),
                self.shape.len()
            )));
        }
        let mut firsts = Vec::with_capacity(self.shape.len());
        let mut counts = Vec::with_capacity(self.shape.len());
        for (d, r) in slice.ranges().iter().enumerate() {
            let r = r.intersect(&DimRange::new(0, self.shape[d]));
            if r.is_empty() {
                return Ok(Vec::new());
            }
            let first = r.start / self.chunks[d];
            let last = (r.stop - 1) / self.chunks[d];
            firsts.push(first);
            counts.push(last + 1 - first);
        }

        let strides = c_strides(&self.grid);
        let mut out = Vec::new();
        for_each_index(&counts, |idx| {
            let flat: u64 = idx
                .iter()
                .enumerate()
                .map(|(d, &i)| (firsts[d] + i) * strides[d])
                .sum();
            out.push(flat);
        });
        Ok(out)
    }
}

/// Row-major strides, in elements, for `shape`
pub fn c_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Visit every index of `extents` in C order
///
/// A zero-dimensional extent is visited once; any zero extent visits nothing.
pub fn for_each_index(extents: &[u64], mut f: impl FnMut(&[u64])) {
    if extents.iter().any(|&e| e == 0) {
        return;
    }
    let mut idx = vec![0u64; extents.len()];
    loop {
        f(&idx);
        let mut d = extents.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < extents[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(s: &str) -> SliceSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_partial_slice_1d() {
        let grid = ChunkGrid::new(vec![100], vec![10]).unwrap();
        let slice = spec("15:25").resolve(&[100]).unwrap();
        assert_eq!(grid.overlapping_chunks(&slice).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_chunk_boundaries_1d() {
        let grid = ChunkGrid::new(vec![100], vec![10]).unwrap();
        let cases = [
            ("0:10", vec![0]),
            ("10:20", vec![1]),
            ("9:10", vec![0]),
            ("9:11", vec![0, 1]),
            ("10:11", vec![1]),
            ("95:", vec![9]),
            ("-1", vec![9]),
            ("20:20", vec![]),
            ("30:20", vec![]),
            (":", (0..10).collect()),
        ];
        for (s, expected) in cases {
            let slice = spec(s).resolve(&[100]).unwrap();
            assert_eq!(grid.overlapping_chunks(&slice).unwrap(), expected, "slice {}", s);
        }
    }

    #[test]
    fn test_ragged_edge_chunk() {
        let grid = ChunkGrid::new(vec![25], vec![10]).unwrap();
        assert_eq!(grid.total_chunks(), 3);
        assert_eq!(grid.chunk_extent(2), vec![DimRange::new(20, 25)]);
        let slice = spec("24:").resolve(&[25]).unwrap();
        assert_eq!(grid.overlapping_chunks(&slice).unwrap(), vec![2]);
    }

    #[test]
    fn test_2d_overlap_c_order() {
        // 4x3 grid of chunks
        let grid = ChunkGrid::new(vec![40, 30], vec![10, 10]).unwrap();
        let slice = spec("15:25,5:15").resolve(&[40, 30]).unwrap();
        assert_eq!(grid.overlapping_chunks(&slice).unwrap(), vec![3, 4, 6, 7]);
        assert_eq!(grid.chunk_coords(7), vec![2, 1]);
    }

    #[test]
    fn test_zero_dim_dataset() {
        let grid = ChunkGrid::new(vec![], vec![]).unwrap();
        assert_eq!(grid.total_chunks(), 1);
        let slice = SliceSpec::all().resolve(&[]).unwrap();
        assert_eq!(grid.overlapping_chunks(&slice).unwrap(), vec![0]);
    }

    #[test]
    fn test_empty_dimension() {
        let grid = ChunkGrid::new(vec![0, 10], vec![4, 4]).unwrap();
        assert_eq!(grid.total_chunks(), 0);
        let slice = Slice::full(&[0, 10]);
        assert!(grid.overlapping_chunks(&slice).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_grid_is_rejected() {
        assert!(matches!(
            ChunkGrid::new(vec![1 << 62], vec![1]),
            Err(Error::InvalidSlice(_))
        ));
        assert!(ChunkGrid::new(vec![u64::MAX, u64::MAX], vec![u64::MAX, u64::MAX]).is_err());
        assert!(ChunkGrid::new(vec![MAX_CHUNKS + 1], vec![1]).is_err());
        assert_eq!(
            ChunkGrid::new(vec![MAX_CHUNKS], vec![1]).unwrap().total_chunks(),
            MAX_CHUNKS
        );
    }

    #[test]
    fn test_slice_spec_parsing() {
        assert_eq!(spec("").resolve(&[5, 6]).unwrap(), Slice::full(&[5, 6]));
        assert_eq!(
            spec("[1:3]").resolve(&[5, 6]).unwrap().ranges(),
            &[DimRange::new(1, 3), DimRange::new(0, 6)]
        );
        assert_eq!(
            spec("-2:,2").resolve(&[5, 6]).unwrap().ranges(),
            &[DimRange::new(3, 5), DimRange::new(2, 3)]
        );
        assert_eq!(spec("2:-1").resolve(&[5]).unwrap().ranges(), &[DimRange::new(2, 4)]);
        assert_eq!(spec("0:500").resolve(&[5]).unwrap().ranges(), &[DimRange::new(0, 5)]);
        assert_eq!(spec("5:9").to_string(), "5:9");

        assert!("1:2:3".parse::<SliceSpec>().is_err());
        assert!("a:b".parse::<SliceSpec>().is_err());
        assert!(spec("7").resolve(&[5]).is_err());
        assert!(spec("1,2").resolve(&[5]).is_err());
    }

    #[test]
    fn test_for_each_index_order() {
        let mut seen = Vec::new();
        for_each_index(&[2, 2], |i| seen.push(i.to_vec()));
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);

        let mut calls = 0;
        for_each_index(&[], |_| calls += 1);
        assert_eq!(calls, 1);
    }

    /// Brute force: a chunk overlaps iff some element of the slice lies in it
    fn expected_overlap(grid: &ChunkGrid, slice: &Slice) -> Vec<u64> {
        (0..grid.total_chunks())
            .filter(|&n| {
                grid.chunk_extent(n)
                    .iter()
                    .zip(slice.ranges())
                    .all(|(e, s)| !e.intersect(s).is_empty())
            })
            .collect()
    }

    fn grid_and_slice() -> impl Strategy<Value = (Vec<u64>, Vec<u64>, Vec<(u64, u64)>)> {
        prop::collection::vec((0u64..40, 1u64..12), 1..4).prop_flat_map(|dims| {
            let shape: Vec<u64> = dims.iter().map(|d| d.0).collect();
            let chunks: Vec<u64> = dims.iter().map(|d| d.1).collect();
            let ranges: Vec<_> = shape
                .iter()
                .map(|&n| (0..=n, 0..=n))
                .collect();
            (Just(shape), Just(chunks), ranges)
        })
    }

    proptest! {
        #[test]
        fn prop_overlap_matches_brute_force((shape, chunks, bounds) in grid_and_slice()) {
            let grid = ChunkGrid::new(shape, chunks).unwrap();
            let slice = Slice::new(bounds.iter().map(|&(a, b)| DimRange::new(a, b)).collect());
            let got = grid.overlapping_chunks(&slice).unwrap();
            prop_assert_eq!(got, expected_overlap(&grid, &slice));
        }
    }
}
