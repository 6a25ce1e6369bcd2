use std::collections::BTreeMap;
use crate::error::ConfigurationError;
use crate::layout::BoxLayout;
use crate::message::Rank;
use crate::region::{Region, RegionId};




/**
 * The regions of one refinement level that live on this rank. Every region
 * has the same number of fields and ghost zones. Regions are keyed by their
 * box index in the level's layout.
 */
#[derive(Clone, Debug)]
pub struct LevelData<const D: usize> {
    level: u32,
    num_fields: usize,
    num_ghost: usize,
    regions: BTreeMap<usize, Region<D>>,
}




// ============================================================================
impl<const D: usize> LevelData<D> {


    /**
     * Allocate zero-filled regions for the boxes of the layout owned by the
     * given rank.
     */
    pub fn new(layout: &BoxLayout<D>, rank: Rank, num_fields: usize, num_ghost: usize) -> Self {
        Self::from_slice_function(layout, rank, num_fields, num_ghost, |_, _| {})
    }


    /**
     * Allocate the local regions and initialize their valid zones from a
     * closure.
     */
    pub fn from_slice_function<F>(
        layout: &BoxLayout<D>,
        rank: Rank,
        num_fields: usize,
        num_ghost: usize,
        f: F) -> Self
    where
        F: Fn([i64; D], &mut [f64])
    {
        let level = layout.level();
        let regions = layout
            .iter()
            .filter(|(_, _, owner)| *owner == rank)
            .map(|(n, space, owner)| {
                let id = RegionId::new(level, n);
                (n, Region::from_slice_function(id, owner, space.clone(), num_ghost, num_fields, &f))
            })
            .collect();

        Self {
            level,
            num_fields,
            num_ghost,
            regions,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    pub fn num_ghost(&self) -> usize {
        self.num_ghost
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Region<D>> {
        self.regions.get(&index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Region<D>> {
        self.regions.get_mut(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region<D>> {
        self.regions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Region<D>> {
        self.regions.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.regions.values().map(|r| r.id())
    }


    /**
     * Check that the component range `scomp..scomp + ncomp` is within the
     * fields of this level.
     */
    pub fn check_components(&self, scomp: usize, ncomp: usize) -> Result<(), ConfigurationError> {
        if ncomp == 0 || scomp + ncomp > self.num_fields {
            Err(ConfigurationError::ComponentRange {
                level: self.level,
                scomp,
                ncomp,
                num_fields: self.num_fields,
            })
        } else {
            Ok(())
        }
    }


    /**
     * Look up a region the graph says this rank owns.
     */
    pub(crate) fn require(&self, id: RegionId, rank: Rank) -> Result<&Region<D>, ConfigurationError> {
        self.regions
            .get(&id.index)
            .filter(|_| id.level == self.level)
            .ok_or(ConfigurationError::MissingRegion { region: id, rank })
    }

    pub(crate) fn require_mut(&mut self, id: RegionId, rank: Rank) -> Result<&mut Region<D>, ConfigurationError> {
        let level = self.level;
        self.regions
            .get_mut(&id.index)
            .filter(|_| id.level == level)
            .ok_or(ConfigurationError::MissingRegion { region: id, rank })
    }
}
