use std::fmt;
use serde::{Deserialize, Serialize};
use crate::index_space::IndexSpace;
use crate::message::Rank;




/**
 * Identifies a region within a grid configuration: the refinement level,
 * and the index of the region's box in that level's layout. Ordering is by
 * level first, then box index, which is the order the graph iterator yields
 * equally ready regions in.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId {
    pub level: u32,
    pub index: usize,
}

impl RegionId {
    pub fn new(level: u32, index: usize) -> Self {
        Self { level, index }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.index)
    }
}




/**
 * A region is a rectangular data patch owned by one rank: the mapping from
 * its valid index space, grown by a number of ghost zones, to field values.
 * The backing array is row-major over the grown space, and the fields at each
 * index are stored contiguously, so `get_slice` returns all the fields of one
 * zone.
 */
#[derive(Clone, Debug)]
pub struct Region<const D: usize> {
    id: RegionId,
    owner: Rank,
    valid: IndexSpace<D>,
    num_ghost: i64,
    num_fields: usize,
    data: Vec<f64>,
}




// ============================================================================
impl<const D: usize> Region<D> {


    /**
     * Create a region with all of its fields set to zero.
     */
    pub fn new(id: RegionId, owner: Rank, valid: IndexSpace<D>, num_ghost: usize, num_fields: usize) -> Self {
        let num_ghost = num_ghost as i64;
        let len = valid.extend_all(num_ghost).len() * num_fields;

        Self {
            id,
            owner,
            valid,
            num_ghost,
            num_fields,
            data: vec![0.0; len],
        }
    }


    /**
     * Generate a region with values in its valid zones defined from a
     * closure. Ghost zones are set to zero.
     */
    pub fn from_slice_function<F>(
        id: RegionId,
        owner: Rank,
        valid: IndexSpace<D>,
        num_ghost: usize,
        num_fields: usize,
        f: F) -> Self
    where
        F: Fn([i64; D], &mut [f64])
    {
        let mut region = Self::new(id, owner, valid, num_ghost, num_fields);

        for index in region.valid.clone().iter() {
            f(index, region.get_slice_mut(index))
        }
        region
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn owner(&self) -> Rank {
        self.owner
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    pub fn num_ghost(&self) -> usize {
        self.num_ghost as usize
    }


    /**
     * Return the index space of the valid zones.
     */
    pub fn valid_space(&self) -> &IndexSpace<D> {
        &self.valid
    }


    /**
     * Return the index space covered by the backing array, including the
     * ghost zones.
     */
    pub fn index_space(&self) -> IndexSpace<D> {
        self.valid.extend_all(self.num_ghost)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }


    /**
     * Return the fields at the given index as a slice.
     */
    pub fn get_slice(&self, index: [i64; D]) -> &[f64] {
        let n = self.offset(index);
        &self.data[n * self.num_fields..(n + 1) * self.num_fields]
    }

    pub fn get_slice_mut(&mut self, index: [i64; D]) -> &mut [f64] {
        let n = self.offset(index);
        &mut self.data[n * self.num_fields..(n + 1) * self.num_fields]
    }


    /**
     * Copy the fields `scomp..scomp + ncomp` of every zone in `space` into a
     * new buffer, in row-major order with the components of each zone
     * together.
     */
    pub fn extract(&self, space: &IndexSpace<D>, scomp: usize, ncomp: usize) -> Vec<f64> {
        let mut buffer = Vec::with_capacity(space.len() * ncomp);

        for index in space {
            buffer.extend_from_slice(&self.get_slice(index)[scomp..scomp + ncomp])
        }
        buffer
    }


    /**
     * Write a buffer laid out as by `extract` into the zones of `space`.
     */
    pub fn write(&mut self, space: &IndexSpace<D>, scomp: usize, ncomp: usize, buffer: &[f64]) {
        assert_eq!(
            buffer.len(),
            space.len() * ncomp,
            "buffer does not match the index space {} of region {}", space, self.id);

        for (index, values) in space.iter().zip(buffer.chunks_exact(ncomp)) {
            self.get_slice_mut(index)[scomp..scomp + ncomp].copy_from_slice(values)
        }
    }

    fn offset(&self, index: [i64; D]) -> usize {
        let space = self.index_space();

        if !space.contains(index) {
            panic!("index {:?} out of range on region {} {}", index, self.id, space);
        }
        space.row_major_offset(index)
    }
}
