use std::collections::BTreeSet;

use ndarray::Array3;
use ndarray::Zip;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Invalid voxel spacing {0:?}: every component must be finite and > 0")]
    InvalidSpacing((f32, f32, f32)),

    #[error("Label data has {actual} elements, expected {expected} for shape {shape:?}")]
    ShapeMismatch {
        shape: (usize, usize, usize),
        expected: usize,
        actual: usize,
    },
}

/// A voxel-labeled volume.
///
/// `data` is indexed as `[x, y, z]` in the order the axes appear in the
/// source file; `spacing` holds the physical size of one voxel along each of
/// those axes in millimeters. Label `0` is background.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    data: Array3<u16>,
    spacing: (f32, f32, f32),
}

impl LabelVolume {
    pub fn new(data: Array3<u16>, spacing: (f32, f32, f32)) -> Result<Self, VolumeError> {
        let (sx, sy, sz) = spacing;
        if [sx, sy, sz].iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(VolumeError::InvalidSpacing(spacing));
        }
        Ok(Self { data, spacing })
    }

    /// Build a volume from labels laid out in standard (last axis fastest) order.
    pub fn from_shape_vec(
        shape: (usize, usize, usize),
        labels: Vec<u16>,
        spacing: (f32, f32, f32),
    ) -> Result<Self, VolumeError> {
        let expected = shape.0 * shape.1 * shape.2;
        let actual = labels.len();
        let data = Array3::from_shape_vec(shape, labels).map_err(|_| VolumeError::ShapeMismatch {
            shape,
            expected,
            actual,
        })?;
        Self::new(data, spacing)
    }

    /// Get the dimensions of the volume (x, y, z)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    /// Physical volume of one voxel in milliliters (1 ml = 1000 mm³).
    pub fn voxel_volume_ml(&self) -> f64 {
        let (sx, sy, sz) = self.spacing;
        (sx as f64 * sy as f64 * sz as f64) / 1000.0
    }

    /// Number of voxels carrying `label`.
    pub fn count(&self, label: u16) -> usize {
        self.data
            .as_slice_memory_order()
            .map(|values| values.par_iter().filter(|&&v| v == label).count())
            .unwrap_or_else(|| self.data.iter().filter(|&&v| v == label).count())
    }

    /// Distinct non-background labels present, ascending.
    pub fn labels(&self) -> Vec<u16> {
        let present: BTreeSet<u16> = self
            .data
            .iter()
            .copied()
            .filter(|&label| label != 0)
            .collect();
        present.into_iter().collect()
    }

    /// Binary occupancy mask for `label`.
    pub fn mask(&self, label: u16) -> Array3<bool> {
        let mut mask = Array3::from_elem(self.data.dim(), false);
        Zip::from(&mut mask)
            .and(&self.data)
            .par_for_each(|m, &v| *m = v == label);
        mask
    }
}
