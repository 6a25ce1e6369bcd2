use std::f64::consts::PI;
use crate::index_space::{IndexSpace, Ratio};




/**
 * Coordinate system of a level. In cylindrical coordinates the first axis
 * is the radius.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordSys {
    Cartesian,
    Cylindrical,
}




/**
 * Describes the index domain of one refinement level, and how it maps onto
 * physical space: the physical bounds, the periodicity of each axis, and the
 * coordinate system.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry<const D: usize> {
    domain: IndexSpace<D>,
    prob_lo: [f64; D],
    prob_hi: [f64; D],
    periodic: [bool; D],
    coord: CoordSys,
}




// ============================================================================
impl<const D: usize> Geometry<D> {

    pub fn new(domain: IndexSpace<D>, prob_lo: [f64; D], prob_hi: [f64; D]) -> Self {
        Self {
            domain,
            prob_lo,
            prob_hi,
            periodic: [false; D],
            coord: CoordSys::Cartesian,
        }
    }

    pub fn with_periodicity(mut self, periodic: [bool; D]) -> Self {
        self.periodic = periodic;
        self
    }

    pub fn with_coord(mut self, coord: CoordSys) -> Self {
        self.coord = coord;
        self
    }

    pub fn domain(&self) -> &IndexSpace<D> {
        &self.domain
    }


    /**
     * Return the geometry of the level above this one: same physical extent,
     * finer index domain.
     */
    pub fn refine(&self, ratio: &Ratio<D>) -> Self {
        Self {
            domain: self.domain.refine(ratio),
            ..self.clone()
        }
    }


    /**
     * Return the physical size of a cell on each axis.
     */
    pub fn cell_size(&self) -> [f64; D] {
        let dim = self.domain.dim();
        std::array::from_fn(|a| (self.prob_hi[a] - self.prob_lo[a]) / dim[a] as f64)
    }


    /**
     * Return the physical position of the lower corner of a cell.
     */
    pub fn cell_lower(&self, index: [i64; D]) -> [f64; D] {
        let dx = self.cell_size();
        let start = self.domain.start();
        std::array::from_fn(|a| self.prob_lo[a] + dx[a] * (index[a] - start[a]) as f64)
    }

    pub fn cell_center(&self, index: [i64; D]) -> [f64; D] {
        let dx = self.cell_size();
        let lower = self.cell_lower(index);
        std::array::from_fn(|a| lower[a] + 0.5 * dx[a])
    }


    /**
     * Return the volume of a cell. In cylindrical coordinates this is the
     * volume of the annulus swept by the cell about the axis.
     */
    pub fn cell_volume(&self, index: [i64; D]) -> f64 {
        let dx = self.cell_size();

        match self.coord {
            CoordSys::Cartesian => dx.iter().product(),
            CoordSys::Cylindrical => {
                let r0 = self.cell_lower(index)[0];
                let r1 = r0 + dx[0];
                PI * (r1 * r1 - r0 * r0) * dx.iter().skip(1).product::<f64>()
            }
        }
    }


    /**
     * Return the index-space offsets of every periodic image of the domain
     * adjacent to it, not including the zero shift.
     */
    pub fn periodic_shifts(&self) -> Vec<[i64; D]> {
        let dim = self.domain.dim();
        let mut shifts = vec![[0; D]];

        for a in 0..D {
            if self.periodic[a] {
                let length = dim[a] as i64;
                shifts = shifts
                    .into_iter()
                    .flat_map(|s| {
                        [-length, 0, length].into_iter().map(move |d| {
                            let mut shifted = s;
                            shifted[a] = d;
                            shifted
                        })
                    })
                    .collect();
            }
        }
        shifts.retain(|s| s.iter().any(|&d| d != 0));
        shifts
    }
}
