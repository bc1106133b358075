//! Laplacian smoothing for extracted surfaces.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::mesh_extractor::SurfaceMesh;

pub(crate) struct Smoother;

impl Smoother {
    /// Uniform-weight Laplacian smoothing with a volume constraint.
    ///
    /// Each iteration moves every vertex by `lambda` towards the centroid of
    /// its edge neighbors, then rescales the mesh about its centroid so the
    /// enclosed volume equals the volume before smoothing. Connectivity is
    /// unchanged; normals are recomputed at the end.
    pub(crate) fn laplacian(mesh: &mut SurfaceMesh, iterations: usize, lambda: f32) {
        if iterations == 0 || mesh.vertices.is_empty() {
            return;
        }
        let adjacency = Self::adjacency(mesh);
        let initial_volume = Self::signed_volume(mesh);

        for _ in 0..iterations {
            let current = &mesh.vertices;
            let moved: Vec<Point3<f32>> = current
                .par_iter()
                .zip(adjacency.par_iter())
                .map(|(pos, neighbors)| {
                    if neighbors.is_empty() {
                        return *pos;
                    }
                    let sum = neighbors
                        .iter()
                        .fold(Vector3::<f32>::zeros(), |acc, &n| acc + current[n as usize].coords);
                    let centroid = sum / neighbors.len() as f32;
                    *pos + (centroid - pos.coords) * lambda
                })
                .collect();
            mesh.vertices = moved;

            let volume = Self::signed_volume(mesh);
            if initial_volume != 0.0 && volume != 0.0 && initial_volume / volume > 0.0 {
                Self::scale_about_centroid(mesh, (initial_volume / volume).cbrt());
            }
        }

        mesh.normals = Self::vertex_normals(mesh);
    }

    fn adjacency(mesh: &SurfaceMesh) -> Vec<Vec<u32>> {
        let mut adjacency = vec![Vec::new(); mesh.vertices.len()];
        for face in &mesh.faces {
            for k in 0..3 {
                let a = face[k];
                let b = face[(k + 1) % 3];
                adjacency[a as usize].push(b);
                adjacency[b as usize].push(a);
            }
        }
        for neighbors in &mut adjacency {
            neighbors.sort_unstable();
            neighbors.dedup();
        }
        adjacency
    }

    /// Enclosed volume by the divergence theorem; positive for outward winding.
    pub(crate) fn signed_volume(mesh: &SurfaceMesh) -> f32 {
        mesh.faces
            .iter()
            .map(|f| {
                let a = mesh.vertices[f[0] as usize].coords;
                let b = mesh.vertices[f[1] as usize].coords;
                let c = mesh.vertices[f[2] as usize].coords;
                a.dot(&b.cross(&c))
            })
            .sum::<f32>()
            / 6.0
    }

    fn scale_about_centroid(mesh: &mut SurfaceMesh, factor: f32) {
        let n = mesh.vertices.len() as f32;
        let centroid = mesh
            .vertices
            .iter()
            .fold(Vector3::<f32>::zeros(), |acc, p| acc + p.coords)
            / n;
        for p in &mut mesh.vertices {
            p.coords = centroid + (p.coords - centroid) * factor;
        }
    }

    /// Area-weighted vertex normals from the face winding.
    pub(crate) fn vertex_normals(mesh: &SurfaceMesh) -> Vec<Vector3<f32>> {
        let mut normals = vec![Vector3::zeros(); mesh.vertices.len()];
        for f in &mesh.faces {
            let a = mesh.vertices[f[0] as usize];
            let b = mesh.vertices[f[1] as usize];
            let c = mesh.vertices[f[2] as usize];
            // Cross product length is twice the triangle area.
            let n = (b - a).cross(&(c - a));
            for &i in f {
                normals[i as usize] += n;
            }
        }
        for n in &mut normals {
            *n = n.try_normalize(f32::EPSILON).unwrap_or_else(Vector3::zeros);
        }
        normals
    }
}
