use crate::index_space::IndexSpace;
use crate::message::Rank;




/**
 * The domain decomposition of one refinement level: an ordered sequence of
 * boxes, each with the rank that owns it. The position of a box in the
 * sequence is its box index, and is what `RegionId` refers to.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct BoxLayout<const D: usize> {
    level: u32,
    boxes: Vec<(IndexSpace<D>, Rank)>,
}




// ============================================================================
impl<const D: usize> BoxLayout<D> {

    pub fn new<I>(level: u32, boxes: I) -> Self
    where
        I: IntoIterator<Item = (IndexSpace<D>, Rank)>
    {
        Self { level, boxes: boxes.into_iter().collect() }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&(IndexSpace<D>, Rank)> {
        self.boxes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &IndexSpace<D>, Rank)> + '_ {
        self.boxes.iter().enumerate().map(|(n, (space, rank))| (n, space, *rank))
    }


    /**
     * Return the indexes of the boxes owned by the given rank.
     */
    pub fn local_indexes(&self, rank: Rank) -> impl Iterator<Item = usize> + '_ {
        self.iter().filter(move |(_, _, r)| *r == rank).map(|(n, _, _)| n)
    }


    /**
     * Return the total number of cells covered by the boxes.
     */
    pub fn volume(&self) -> usize {
        self.boxes.iter().map(|(space, _)| space.len()).sum()
    }


    /**
     * Build a spatial index over the boxes of this layout.
     */
    pub fn index(&self) -> BoxIndex<D> {
        BoxIndex::new(self)
    }


    /**
     * Return the first pair of boxes (by index) that overlap one another, if
     * any.
     */
    pub fn first_overlapping_pair(&self) -> Option<(usize, usize)> {
        let index = self.index();

        self.iter()
            .flat_map(|(a, space, _)| {
                index
                    .query(self, space)
                    .into_iter()
                    .filter(move |&b| b > a)
                    .map(move |b| (a, b))
            })
            .next()
    }
}




/**
 * Sorted index over the boxes of a layout for rectangle queries. Boxes are
 * sorted on their lower bound along the first axis, so a query only scans
 * the boxes whose lower bound falls in a window determined by the query and
 * the longest box.
 */
pub struct BoxIndex<const D: usize> {
    sorted: Vec<(i64, usize)>,
    max_extent: i64,
}




// ============================================================================
impl<const D: usize> BoxIndex<D> {

    fn new(layout: &BoxLayout<D>) -> Self {
        let mut sorted: Vec<_> = layout
            .iter()
            .filter(|(_, space, _)| !space.is_empty())
            .map(|(n, space, _)| (space.axis(0).start, n))
            .collect();
        sorted.sort_unstable();

        let max_extent = layout
            .iter()
            .map(|(_, space, _)| space.axis(0).end - space.axis(0).start)
            .max()
            .unwrap_or(0);

        Self { sorted, max_extent }
    }


    /**
     * Return the indexes of the layout's boxes which overlap the given space,
     * in ascending order.
     */
    pub fn query(&self, layout: &BoxLayout<D>, space: &IndexSpace<D>) -> Vec<usize> {
        if D == 0 || space.is_empty() {
            return Vec::new();
        }
        let lower = space.axis(0).start - self.max_extent;
        let upper = space.axis(0).end;
        let i0 = self.sorted.partition_point(|&(s, _)| s <= lower);
        let i1 = self.sorted.partition_point(|&(s, _)| s < upper);

        let mut hits: Vec<_> = self.sorted[i0..i1]
            .iter()
            .map(|&(_, n)| n)
            .filter(|&n| layout.boxes[n].0.overlaps(space))
            .collect();
        hits.sort_unstable();
        hits
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::BoxLayout;
    use crate::index_space::range2d;

    fn quilt() -> BoxLayout<2> {
        BoxLayout::new(0, vec![
            (range2d(0..4, 0..4), 0),
            (range2d(4..8, 0..4), 1),
            (range2d(0..4, 4..8), 0),
            (range2d(4..8, 4..8), 1),
            (range2d(8..32, 0..8), 2),
        ])
    }

    #[test]
    fn query_finds_overlapping_boxes_in_index_order() {
        let layout = quilt();
        let index = layout.index();
        assert_eq!(index.query(&layout, &range2d(3..5, 3..5)), vec![0, 1, 2, 3]);
        assert_eq!(index.query(&layout, &range2d(30..40, 0..1)), vec![4]);
        assert_eq!(index.query(&layout, &range2d(12..13, 2..3)), vec![4]);
        assert!(index.query(&layout, &range2d(-4..0, 0..8)).is_empty());
    }

    #[test]
    fn local_indexes_and_volume_work() {
        let layout = quilt();
        assert_eq!(layout.local_indexes(1).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(layout.volume(), 64 + 192);
    }

    #[test]
    fn overlapping_pair_is_detected() {
        assert_eq!(quilt().first_overlapping_pair(), None);

        let layout = BoxLayout::new(1, vec![
            (range2d(0..4, 0..4), 0),
            (range2d(8..12, 0..4), 0),
            (range2d(3..9, 3..5), 0),
        ]);
        assert_eq!(layout.first_overlapping_pair(), Some((0, 2)));
    }
}
