//! Surface meshes for every organ label of a [`LabelVolume`].
//!
//! Each label's occupancy mask is cropped to its bounding box, padded with
//! background so the surface closes at the volume border, and meshed with surface
//! nets at the 0.5 occupancy level. Vertices are scaled by the voxel spacing
//! so meshes are in millimeters, in the same frame as the voxel indices.
//!
//! Meshes are for display. On a binary field surface nets cuts corners, so
//! small structures enclose noticeably less than their voxels; volumes are
//! reported from voxel counts by [`crate::metrics`], never from meshes.

use crate::enums::SmoothingMode;
use crate::grid::GridShape;
use crate::smoothing::Smoother;
use crate::volume::LabelVolume;

use fast_surface_nets::SurfaceNetsBuffer;
use fast_surface_nets::surface_nets;
use nalgebra::Point3;
use nalgebra::Vector3;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

const PAD: usize = 2;

/// Failure to mesh a single label; the remaining labels are still processed.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("label {0} is not present in the volume")]
    LabelAbsent(u16),

    #[error("label {0} produced an empty surface")]
    EmptySurface(u16),

    #[error("label {0} produced non-finite vertex coordinates")]
    NonFinite(u16),

    #[error("label {0} spans too many voxels to mesh")]
    TooLarge(u16),

    #[error("failed to write mesh {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("cannot create mesh output directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
}

/// Triangle surface with per-vertex normals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceMesh {
    pub vertices: Vec<Point3<f32>>,
    pub faces: Vec<[u32; 3]>,
    pub normals: Vec<Vector3<f32>>,
}

impl SurfaceMesh {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Enclosed volume in mm³.
    pub fn volume(&self) -> f32 {
        Smoother::signed_volume(self)
    }

    /// Write the mesh as Wavefront OBJ (`v`, `vn` and `f v//vn` records).
    pub fn write_obj<W: Write>(&self, name: &str, mut w: W) -> io::Result<()> {
        writeln!(w, "# {} vertices, {} faces", self.vertices.len(), self.faces.len())?;
        writeln!(w, "o {name}")?;
        for v in &self.vertices {
            writeln!(w, "v {:.6} {:.6} {:.6}", v.x, v.y, v.z)?;
        }
        for n in &self.normals {
            writeln!(w, "vn {:.6} {:.6} {:.6}", n.x, n.y, n.z)?;
        }
        for f in &self.faces {
            let (a, b, c) = (f[0] + 1, f[1] + 1, f[2] + 1);
            writeln!(w, "f {a}//{a} {b}//{b} {c}//{c}")?;
        }
        w.flush()
    }
}

/// A mesh produced for one organ label, together with where it is stored.
#[derive(Debug, Clone)]
pub struct MeshAsset {
    pub organ_label: u16,
    pub mesh: SurfaceMesh,
    pub storage_path: PathBuf,
}

pub struct MeshExtractor {
    smoothing: SmoothingMode,
    organ_names: BTreeMap<u16, String>,
}

impl MeshExtractor {
    pub fn new(smoothing: SmoothingMode, organ_names: BTreeMap<u16, String>) -> Self {
        Self {
            smoothing,
            organ_names,
        }
    }

    /// Human readable name of `label`, `organ_<label>` when unknown.
    pub fn organ_name(&self, label: u16) -> String {
        self.organ_names
            .get(&label)
            .cloned()
            .unwrap_or_else(|| format!("organ_{label}"))
    }

    /// Extract, smooth and store a mesh for every non-background label.
    ///
    /// Files are named `<base_name>_<organ>.obj` inside `output_dir`. Labels
    /// that fail are logged and left out of the returned list, which is
    /// ordered by ascending label.
    ///
    /// # Errors
    ///
    /// Only fails if `output_dir` cannot be created.
    pub fn extract_meshes(
        &self,
        volume: &LabelVolume,
        output_dir: impl AsRef<Path>,
        base_name: &str,
    ) -> Result<Vec<(u16, PathBuf)>, MeshError> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).map_err(|source| MeshError::CreateDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut stored = Vec::new();
        for label in volume.labels() {
            let started = Instant::now();
            match self.build_asset(volume, label, output_dir, base_name) {
                Ok(asset) => {
                    info!(
                        label,
                        organ = %self.organ_name(label),
                        vertices = asset.mesh.vertices.len(),
                        faces = asset.mesh.faces.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "mesh created"
                    );
                    stored.push((asset.organ_label, asset.storage_path));
                }
                Err(err) => warn!(label, error = %err, "label skipped"),
            }
        }
        Ok(stored)
    }

    fn build_asset(
        &self,
        volume: &LabelVolume,
        label: u16,
        output_dir: &Path,
        base_name: &str,
    ) -> Result<MeshAsset, ExtractionError> {
        let mesh = self.extract_label(volume, label)?;
        let organ = self.organ_name(label);
        let storage_path = output_dir.join(format!("{base_name}_{organ}.obj"));

        File::create(&storage_path)
            .and_then(|file| mesh.write_obj(&organ, BufWriter::new(file)))
            .map_err(|source| ExtractionError::Write {
                path: storage_path.clone(),
                source,
            })?;

        Ok(MeshAsset {
            organ_label: label,
            mesh,
            storage_path,
        })
    }

    /// Surface of a single label, smoothed according to the configured mode.
    pub fn extract_label(
        &self,
        volume: &LabelVolume,
        label: u16,
    ) -> Result<SurfaceMesh, ExtractionError> {
        let mut mesh = Self::isosurface(volume, label)?;
        if let SmoothingMode::Laplacian { iterations, lambda } = self.smoothing {
            Smoother::laplacian(&mut mesh, iterations, lambda);
        }
        if mesh.vertices.iter().any(|v| !v.coords.iter().all(|c| c.is_finite())) {
            return Err(ExtractionError::NonFinite(label));
        }
        Ok(mesh)
    }

    fn isosurface(volume: &LabelVolume, label: u16) -> Result<SurfaceMesh, ExtractionError> {
        let (min, max) = Self::bounding_box(volume, label).ok_or(ExtractionError::LabelAbsent(label))?;

        // Surface nets only emits quads for edges away from the grid border,
        // so the bounding box is padded with PAD background voxels per side.
        let shape = GridShape::new(
            max[0] - min[0] + 1 + 2 * PAD,
            max[1] - min[1] + 1 + 2 * PAD,
            max[2] - min[2] + 1 + 2 * PAD,
        )
        .ok_or(ExtractionError::TooLarge(label))?;
        let data = volume.data();
        let mut field = vec![0.5f32; shape.len()];
        for x in min[0]..=max[0] {
            for y in min[1]..=max[1] {
                for z in min[2]..=max[2] {
                    if data[[x, y, z]] == label {
                        let i = shape.index(x - min[0] + PAD, y - min[1] + PAD, z - min[2] + PAD);
                        field[i] = -0.5;
                    }
                }
            }
        }

        let mut buffer = SurfaceNetsBuffer::default();
        surface_nets(
            &field,
            &shape,
            [0, 0, 0],
            shape.dims().map(|d| d - 1),
            &mut buffer,
        );
        if buffer.indices.is_empty() {
            return Err(ExtractionError::EmptySurface(label));
        }
        debug!(label, quads = buffer.indices.len() / 6, "surface nets done");

        let (sx, sy, sz) = volume.spacing();
        let origin = [
            min[0] as f32 - PAD as f32,
            min[1] as f32 - PAD as f32,
            min[2] as f32 - PAD as f32,
        ];
        let vertices = buffer
            .positions
            .iter()
            .map(|p| {
                Point3::new(
                    (p[0] + origin[0]) * sx,
                    (p[1] + origin[1]) * sy,
                    (p[2] + origin[2]) * sz,
                )
            })
            .collect();
        let faces = buffer
            .indices
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect();

        let mut mesh = SurfaceMesh {
            vertices,
            faces,
            normals: Vec::new(),
        };
        if mesh.volume() < 0.0 {
            for f in &mut mesh.faces {
                f.swap(1, 2);
            }
        }
        mesh.normals = Smoother::vertex_normals(&mesh);
        Ok(mesh)
    }

    fn bounding_box(volume: &LabelVolume, label: u16) -> Option<([usize; 3], [usize; 3])> {
        volume
            .data()
            .indexed_iter()
            .filter(|&(_, &v)| v == label)
            .fold(None, |acc, ((x, y, z), _)| match acc {
                None => Some(([x, y, z], [x, y, z])),
                Some((lo, hi)) => Some((
                    [lo[0].min(x), lo[1].min(y), lo[2].min(z)],
                    [hi[0].max(x), hi[1].max(y), hi[2].max(z)],
                )),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, s};

    fn names() -> BTreeMap<u16, String> {
        BTreeMap::from([(8, "liver".to_string()), (9, "tumor".to_string())])
    }

    fn cube_volume(spacing: (f32, f32, f32)) -> LabelVolume {
        let mut data = Array3::<u16>::zeros((8, 8, 8));
        data.slice_mut(s![2..6, 2..6, 2..6]).fill(8);
        LabelVolume::new(data, spacing).unwrap()
    }

    #[test]
    fn unknown_labels_fall_back_to_generic_name() {
        let extractor = MeshExtractor::new(SmoothingMode::None, names());
        assert_eq!(extractor.organ_name(8), "liver");
        assert_eq!(extractor.organ_name(42), "organ_42");
    }

    #[test]
    fn cube_surface_is_closed_and_outward() {
        let extractor = MeshExtractor::new(SmoothingMode::None, names());
        let mesh = extractor.extract_label(&cube_volume((1.0, 1.0, 1.0)), 8).unwrap();
        assert!(!mesh.is_empty());
        assert_eq!(mesh.normals.len(), mesh.vertices.len());
        // The 0.5 level set of a 4³ block lies between 3³ and 5³.
        let volume = mesh.volume();
        assert!(volume > 27.0 && volume < 125.0, "volume {volume}");
    }

    #[test]
    fn vertices_are_scaled_by_spacing() {
        let extractor = MeshExtractor::new(SmoothingMode::None, names());
        let mesh = extractor.extract_label(&cube_volume((1.0, 1.0, 3.0)), 8).unwrap();
        let max_z = mesh.vertices.iter().map(|v| v.z).fold(f32::MIN, f32::max);
        let max_x = mesh.vertices.iter().map(|v| v.x).fold(f32::MIN, f32::max);
        assert!(max_z > 2.5 * max_x, "max_x {max_x} max_z {max_z}");
    }

    #[test]
    fn absent_label_is_an_extraction_error() {
        let extractor = MeshExtractor::new(SmoothingMode::default(), names());
        let err = extractor.extract_label(&cube_volume((1.0, 1.0, 1.0)), 9).unwrap_err();
        assert!(matches!(err, ExtractionError::LabelAbsent(9)));
    }

    #[test]
    fn obj_output_uses_one_based_indices() {
        let mesh = SurfaceMesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            faces: vec![[0, 1, 2]],
            normals: vec![Vector3::z(); 3],
        };
        let mut out = Vec::new();
        mesh.write_obj("tri", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("o tri\n"));
        assert_eq!(text.lines().filter(|l| l.starts_with("v ")).count(), 3);
        assert_eq!(text.lines().filter(|l| l.starts_with("vn ")).count(), 3);
        assert!(text.contains("f 1//1 2//2 3//3"));
    }

    #[test]
    fn extract_meshes_writes_one_file_per_label_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = Array3::<u16>::zeros((10, 10, 10));
        data.slice_mut(s![1..4, 1..4, 1..4]).fill(9);
        data.slice_mut(s![5..9, 5..9, 5..9]).fill(8);
        data[[0, 9, 0]] = 3;
        let volume = LabelVolume::new(data, (1.0, 1.0, 1.0)).unwrap();

        let extractor = MeshExtractor::new(SmoothingMode::default(), names());
        let stored = extractor
            .extract_meshes(&volume, dir.path().join("assets"), "case01")
            .unwrap();

        let labels: Vec<u16> = stored.iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, vec![3, 8, 9]);
        assert!(stored[0].1.ends_with("case01_organ_3.obj"));
        assert!(stored[1].1.ends_with("case01_liver.obj"));
        assert!(stored.iter().all(|(_, p)| p.is_file()));
    }

    #[test]
    fn failed_label_is_skipped_and_others_kept() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("assets");
        // A directory where the liver mesh should go makes that write fail.
        fs::create_dir_all(out.join("case_liver.obj")).unwrap();

        let mut data = Array3::<u16>::zeros((10, 10, 10));
        data.slice_mut(s![1..4, 1..4, 1..4]).fill(8);
        data.slice_mut(s![6..9, 6..9, 6..9]).fill(9);
        let volume = LabelVolume::new(data, (1.0, 1.0, 1.0)).unwrap();

        let extractor = MeshExtractor::new(SmoothingMode::default(), names());
        let stored = extractor.extract_meshes(&volume, &out, "case").unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, 9);
        assert!(stored[0].1.ends_with("case_tumor.obj"));
        assert!(stored[0].1.is_file());
    }

    #[test]
    fn unwritable_output_dir_is_the_only_global_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"").unwrap();

        let extractor = MeshExtractor::new(SmoothingMode::None, names());
        let err = extractor
            .extract_meshes(&cube_volume((1.0, 1.0, 1.0)), blocker.join("assets"), "case")
            .unwrap_err();
        assert!(matches!(err, MeshError::CreateDir { .. }));
    }
}
