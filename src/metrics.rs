//! Organ and tumor volume analysis.
//!
//! Tumors are the 6-connected (face-adjacent) components of the tumor label.
//! Components are numbered from 1 in the order their first voxel is met by a
//! raster scan over `[x, y, z]` with `z` varying fastest, which makes the ids
//! reproducible for a given volume.

use std::collections::VecDeque;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::volume::LabelVolume;

pub const DEFAULT_DECIMALS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tumor {
    pub id: u32,
    pub volume_ml: f64,
}

/// Volumes derived from a label volume.
///
/// `total_tumor_volume_ml` is the rounded sum of the already rounded
/// per-tumor volumes, so it can differ from the rounded exact total by up to
/// 0.01 ml per tumor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetrics {
    pub liver_volume_ml: f64,
    pub tumor_count: u32,
    pub tumors: Vec<Tumor>,
    pub total_tumor_volume_ml: f64,
}

/// Computes [`VolumeMetrics`] for a fixed pair of liver and tumor labels.
#[derive(Debug, Clone, Copy)]
pub struct VolumeAnalyzer {
    liver_label: u16,
    tumor_label: u16,
    decimals: u32,
}

impl VolumeAnalyzer {
    pub fn new(liver_label: u16, tumor_label: u16) -> Self {
        Self {
            liver_label,
            tumor_label,
            decimals: DEFAULT_DECIMALS,
        }
    }

    /// Number of decimal places every reported volume is rounded to.
    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn analyze(&self, volume: &LabelVolume) -> VolumeMetrics {
        let voxel_ml = volume.voxel_volume_ml();
        let liver_voxels = volume.count(self.liver_label);

        let components = ComponentLabeler::label(&volume.mask(self.tumor_label));
        let tumors: Vec<Tumor> = components
            .sizes
            .iter()
            .enumerate()
            .map(|(index, &voxels)| Tumor {
                id: index as u32 + 1,
                volume_ml: self.round(voxels as f64 * voxel_ml),
            })
            .collect();
        let total: f64 = tumors.iter().map(|t| t.volume_ml).sum();

        VolumeMetrics {
            liver_volume_ml: self.round(liver_voxels as f64 * voxel_ml),
            tumor_count: tumors.len() as u32,
            total_tumor_volume_ml: self.round(total),
            tumors,
        }
    }

    fn round(&self, value: f64) -> f64 {
        let factor = 10f64.powi(self.decimals as i32);
        (value * factor).round() / factor
    }
}

/// Metrics with the default two-decimal rounding.
pub fn compute_metrics(volume: &LabelVolume, liver_label: u16, tumor_label: u16) -> VolumeMetrics {
    VolumeAnalyzer::new(liver_label, tumor_label).analyze(volume)
}

/// Result of connected-component labeling over a binary mask.
#[derive(Debug)]
pub struct Components {
    /// Component id per voxel, 0 for voxels outside the mask.
    pub labels: Array3<u32>,
    /// Voxel count of component `i + 1` at index `i`.
    pub sizes: Vec<usize>,
}

impl Components {
    pub fn count(&self) -> usize {
        self.sizes.len()
    }
}

pub struct ComponentLabeler;

impl ComponentLabeler {
    const NEIGHBORS: [(isize, isize, isize); 6] = [
        (-1, 0, 0),
        (1, 0, 0),
        (0, -1, 0),
        (0, 1, 0),
        (0, 0, -1),
        (0, 0, 1),
    ];

    /// Label the 6-connected components of `mask` in raster discovery order.
    pub fn label(mask: &Array3<bool>) -> Components {
        let (nx, ny, nz) = mask.dim();
        let mut labels = Array3::<u32>::zeros((nx, ny, nz));
        let mut sizes = Vec::new();
        let mut queue = VecDeque::new();

        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    if !mask[[x, y, z]] || labels[[x, y, z]] != 0 {
                        continue;
                    }
                    let id = sizes.len() as u32 + 1;
                    labels[[x, y, z]] = id;
                    queue.push_back((x, y, z));
                    let mut size = 0usize;

                    while let Some((cx, cy, cz)) = queue.pop_front() {
                        size += 1;
                        for (dx, dy, dz) in Self::NEIGHBORS {
                            let Some(n) = Self::offset((cx, cy, cz), (dx, dy, dz), (nx, ny, nz))
                            else {
                                continue;
                            };
                            if mask[n] && labels[n] == 0 {
                                labels[n] = id;
                                queue.push_back((n[0], n[1], n[2]));
                            }
                        }
                    }
                    sizes.push(size);
                }
            }
        }

        Components { labels, sizes }
    }

    #[inline]
    fn offset(
        (x, y, z): (usize, usize, usize),
        (dx, dy, dz): (isize, isize, isize),
        (nx, ny, nz): (usize, usize, usize),
    ) -> Option<[usize; 3]> {
        let x = x.checked_add_signed(dx).filter(|&v| v < nx)?;
        let y = y.checked_add_signed(dy).filter(|&v| v < ny)?;
        let z = z.checked_add_signed(dz).filter(|&v| v < nz)?;
        Some([x, y, z])
    }
}
