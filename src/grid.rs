//! Padded sampling grid for one label's occupancy field.

use fast_surface_nets::ndshape::Shape;

/// Dimensions of a sampled occupancy field, x varying fastest.
///
/// Surface nets addresses samples with `u32`, so a grid is only built when
/// its total sample count fits.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GridShape {
    dims: [u32; 3],
    strides: [usize; 3],
}

impl GridShape {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Option<Self> {
        let len = nx.checked_mul(ny)?.checked_mul(nz)?;
        u32::try_from(len).ok()?;
        Some(Self {
            dims: [nx as u32, ny as u32, nz as u32],
            strides: [1, nx, nx * ny],
        })
    }

    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x * self.strides[0] + y * self.strides[1] + z * self.strides[2]
    }
}

// `new` guarantees every linear index fits in `u32`.
impl Shape<3> for GridShape {
    type Coord = u32;

    #[inline]
    fn as_array(&self) -> [u32; 3] {
        self.dims
    }

    fn size(&self) -> u32 {
        self.len() as u32
    }

    fn usize(&self) -> usize {
        self.len()
    }

    fn linearize(&self, [x, y, z]: [u32; 3]) -> u32 {
        self.index(x as usize, y as usize, z as usize) as u32
    }

    fn delinearize(&self, i: u32) -> [u32; 3] {
        let i = i as usize;
        let z = i / self.strides[2];
        let rest = i % self.strides[2];
        [(rest % self.strides[1]) as u32, (rest / self.strides[1]) as u32, z as u32]
    }
}
