use core::ops::Range;
use std::fmt;
use crate::overlap::Overlap;




/**
 * A refinement ratio relating a fine level's cell size to the coarse level
 * beneath it. The ratio may be isotropic or differ per axis.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ratio<const D: usize>([i64; D]);




// ============================================================================
impl<const D: usize> Ratio<D> {

    pub fn new(ratio: [i64; D]) -> Self {
        Self(ratio)
    }

    /**
     * Return the ratio along the given axis.
     */
    pub fn along(&self, axis: usize) -> i64 {
        self.0[axis]
    }

    /**
     * Return the number of fine cells covered by one coarse cell.
     */
    pub fn volume(&self) -> usize {
        self.0.iter().map(|&r| r as usize).product()
    }

    /**
     * A ratio is usable if every component is at least one.
     */
    pub fn is_valid(&self) -> bool {
        self.0.iter().all(|&r| r >= 1)
    }
}

impl<const D: usize> From<i64> for Ratio<D> {
    fn from(ratio: i64) -> Self {
        Self([ratio; D])
    }
}

impl<const D: usize> From<[i64; D]> for Ratio<D> {
    fn from(ratio: [i64; D]) -> Self {
        Self(ratio)
    }
}

impl<const D: usize> fmt::Display for Ratio<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}




/**
 * Represents a rectangular region in a discrete D-dimensional index space.
 * Each axis is a half-open range of signed 64-bit indexes.
 */
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IndexSpace<const D: usize> {
    axes: [Range<i64>; D],
}




// ============================================================================
impl<const D: usize> IndexSpace<D> {

    pub fn new(axes: [Range<i64>; D]) -> Self {
        assert!(
            axes.iter().all(|r| r.start <= r.end),
            "index space has negative volume");

        Self { axes }
    }


    /**
     * Construct an index space from inclusive lower and upper corners, the
     * way boxes are usually written down: `[0,7]x[0,3]`.
     */
    pub fn from_corners(lo: [i64; D], hi: [i64; D]) -> Self {
        Self::new(std::array::from_fn(|a| lo[a]..hi[a] + 1))
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> [usize; D] {
        std::array::from_fn(|a| (self.axes[a].end - self.axes[a].start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        self.dim().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> [i64; D] {
        std::array::from_fn(|a| self.axes[a].start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> [i64; D] {
        std::array::from_fn(|a| self.axes[a].end)
    }

    pub fn axis(&self, axis: usize) -> &Range<i64> {
        &self.axes[axis]
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: [i64; D]) -> bool {
        self.axes.iter().zip(index.iter()).all(|(r, i)| r.contains(i))
    }


    /**
     * Determine whether another index space is a subset of this one.
     */
    pub fn contains_space(&self, other: &Self) -> bool {
        self.axes
            .iter()
            .zip(other.axes.iter())
            .all(|(s, o)| o.start >= s.start && o.end <= s.end)
    }


    /**
     * Return the region common to both index spaces, or `None` if they do
     * not overlap.
     */
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let mut axes: [Range<i64>; D] = std::array::from_fn(|_| 0..0);

        for a in 0..D {
            axes[a] = self.axes[a].intersection(&other.axes[a])?;
        }
        Some(Self { axes })
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.axes.iter().zip(other.axes.iter()).all(|(s, o)| s.overlaps(o))
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        Self::new(std::array::from_fn(|a| {
            self.axes[a].start - delta..self.axes[a].end + delta
        }))
    }


    /**
     * Trim this index space by the given number of elements on each axis.
     */
    pub fn trim_all(&self, delta: i64) -> Self {
        self.extend_all(-delta)
    }


    /**
     * Shift this index space by the given offset.
     */
    pub fn translate(&self, shift: [i64; D]) -> Self {
        Self::new(std::array::from_fn(|a| {
            self.axes[a].start + shift[a]..self.axes[a].end + shift[a]
        }))
    }


    /**
     * Map this index space to the finer level under the given ratio. Every
     * coarse index becomes a block of `ratio` fine indexes.
     */
    pub fn refine(&self, ratio: &Ratio<D>) -> Self {
        Self::new(std::array::from_fn(|a| {
            let r = ratio.along(a);
            self.axes[a].start * r..self.axes[a].end * r
        }))
    }


    /**
     * Map this index space to the coarser level under the given ratio. The
     * result is the smallest coarse space whose refinement covers this one.
     */
    pub fn coarsen(&self, ratio: &Ratio<D>) -> Self {
        Self::new(std::array::from_fn(|a| {
            let r = ratio.along(a);
            let lower = self.axes[a].start.div_euclid(r);
            let upper = -(-self.axes[a].end).div_euclid(r);
            lower..upper
        }))
    }


    /**
     * Determine whether both corners of this index space lie on multiples of
     * the ratio, in which case `coarsen` followed by `refine` is lossless.
     */
    pub fn is_aligned(&self, ratio: &Ratio<D>) -> bool {
        self.axes.iter().enumerate().all(|(a, r)| {
            r.start.rem_euclid(ratio.along(a)) == 0 && r.end.rem_euclid(ratio.along(a)) == 0
        })
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space.
     */
    pub fn row_major_offset(&self, index: [i64; D]) -> usize {
        let dim = self.dim();
        let mut offset = 0;

        for a in 0..D {
            offset = offset * dim[a] + (index[a] - self.axes[a].start) as usize;
        }
        offset
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> Iter<D> {
        Iter {
            next: if self.is_empty() { None } else { Some(self.start()) },
            space: self.clone(),
        }
    }
}

impl<const D: usize> fmt::Debug for IndexSpace<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (a, r) in self.axes.iter().enumerate() {
            if a > 0 {
                write!(f, "x")?;
            }
            write!(f, "[{},{}]", r.start, r.end - 1)?;
        }
        Ok(())
    }
}

impl<const D: usize> fmt::Display for IndexSpace<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<(Range<i64>, Range<i64>)> for IndexSpace<2> {
    fn from(range: (Range<i64>, Range<i64>)) -> Self {
        Self::new([range.0, range.1])
    }
}

impl<'a, const D: usize> IntoIterator for &'a IndexSpace<D> {
    type Item = [i64; D];
    type IntoIter = Iter<D>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}




/**
 * Less imposing factory function to construct a 2D IndexSpace object.
 */
pub fn range2d(di: Range<i64>, dj: Range<i64>) -> IndexSpace<2> {
    IndexSpace::new([di, dj])
}




/**
 * Row-major traversal of an index space.
 */
pub struct Iter<const D: usize> {
    space: IndexSpace<D>,
    next: Option<[i64; D]>,
}

impl<const D: usize> Iterator for Iter<D> {
    type Item = [i64; D];

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let mut index = current;

        self.next = None;

        for a in (0..D).rev() {
            index[a] += 1;

            if index[a] < self.space.axes[a].end {
                self.next = Some(index);
                break;
            }
            index[a] = self.space.axes[a].start;
        }
        Some(current)
    }
}
