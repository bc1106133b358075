use crate::volume::{LabelVolume, VolumeError};

use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::{IntoNdArray, NiftiObject, NiftiVolume, ReaderOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("Label volume not found: {0}")]
    MissingFile(PathBuf),

    #[error("Expected a 3D label volume, got dimensions {0:?}")]
    UnsupportedDimensions(Vec<u16>),

    #[error("Voxel value {value} at {coords:?} is not a valid label")]
    InvalidLabel { value: f64, coords: [usize; 3] },

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a label volume from a NIfTI-1 file (`.nii` or `.nii.gz`)
    ///
    /// The first three `pixdim` entries of the header become the voxel
    /// spacing. Trailing singleton dimensions (e.g. a time axis of length 1)
    /// are accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the file does not exist, cannot be decoded, is not
    /// three-dimensional, holds non-integer or negative values, or carries a
    /// non-positive spacing.
    pub fn load_from_nifti(path: impl AsRef<Path>) -> Result<LabelVolume, VolumeLoaderError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VolumeLoaderError::MissingFile(path.to_path_buf()));
        }

        let object = ReaderOptions::new().read_file(path)?;
        let pixdim = object.header().pixdim;
        let spacing = (pixdim[1], pixdim[2], pixdim[3]);
        let volume = object.into_volume();

        let shape = Self::spatial_shape(volume.dim())?;
        debug!(path = %path.display(), ?shape, ?spacing, "decoding label volume");

        let values = Self::squeeze(volume.into_ndarray::<f64>()?)?;
        let labels = Self::read_labels(&values)?;
        Ok(LabelVolume::from_shape_vec(values.dim(), labels, spacing)?)
    }

    /// File name without directories and without a `.nii.gz` / `.nii` suffix.
    pub fn file_stem(path: impl AsRef<Path>) -> String {
        let name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for ext in [".nii.gz", ".nii"] {
            if let Some(stem) = name.strip_suffix(ext) {
                return stem.to_string();
            }
        }
        name
    }

    fn spatial_shape(dims: &[u16]) -> Result<[u16; 3], VolumeLoaderError> {
        if dims.len() < 3 || dims[3..].iter().any(|&d| d != 1) {
            return Err(VolumeLoaderError::UnsupportedDimensions(dims.to_vec()));
        }
        Ok([dims[0], dims[1], dims[2]])
    }

    // Trailing singleton axes are dropped so the array can be viewed as 3D.
    fn squeeze(mut values: ArrayD<f64>) -> Result<Array3<f64>, VolumeLoaderError> {
        while values.ndim() > 3 {
            let last = Axis(values.ndim() - 1);
            values = values.remove_axis(last);
        }
        let dims: Vec<u16> = values.shape().iter().map(|&d| d as u16).collect();
        values
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeLoaderError::UnsupportedDimensions(dims))
    }

    // `indexed_iter` walks in logical order with the last axis fastest, which
    // is the standard layout `from_shape_vec` expects.
    fn read_labels(values: &Array3<f64>) -> Result<Vec<u16>, VolumeLoaderError> {
        values
            .indexed_iter()
            .map(|((x, y, z), &value)| Self::to_label(value, [x, y, z]))
            .collect()
    }

    fn to_label(value: f64, coords: [usize; 3]) -> Result<u16, VolumeLoaderError> {
        let rounded = value.round();
        let valid = value.is_finite()
            && (value - rounded).abs() < 1e-3
            && rounded >= 0.0
            && rounded <= u16::MAX as f64;
        if !valid {
            return Err(VolumeLoaderError::InvalidLabel { value, coords });
        }
        Ok(rounded as u16)
    }
}
