use core::ops::Range;




/**
 * Extension trait to intersect half-open ranges. Two ranges that line up
 * end-to-end do not overlap, and neither does an empty range with anything.
 */
pub trait Overlap: Sized {
    fn overlaps(&self, other: &Self) -> bool;
    fn intersection(&self, other: &Self) -> Option<Self>;
}




// ============================================================================
impl<T> Overlap for Range<T>
where
    T: Ord + Copy
{
    fn overlaps(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    fn intersection(&self, other: &Self) -> Option<Self> {
        let lower = self.start.max(other.start);
        let upper = self.end.min(other.end);

        if lower < upper {
            Some(lower..upper)
        } else {
            None
        }
    }
}
