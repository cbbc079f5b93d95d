//! Marching cubes isosurface extraction.
//!
//! A voxel is inside the surface when its intensity is greater than or equal
//! to the threshold, so denser tissue ends up enclosed by the mesh and a
//! voxel exactly at the threshold belongs to the solid.

use std::collections::HashMap;

use log::debug;
use nalgebra::Point3;
use serde::Deserialize;
use serde::Serialize;

use crate::mesh::Mesh;
use crate::tables::CORNER_OFFSETS;
use crate::tables::EDGE_CORNERS;
use crate::tables::EDGE_TABLE;
use crate::tables::TRI_TABLE;
use crate::volume::Volume;
use crate::volume::VolumeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarchingCubesConfig {
    /// Weld vertices shared by adjacent cells
    pub merge_points: bool,
    pub compute_normals: bool,
    /// Weight face normals by triangle area when averaging
    pub area_weighted_normals: bool,
}

impl Default for MarchingCubesConfig {
    fn default() -> Self {
        Self {
            merge_points: true,
            compute_normals: true,
            area_weighted_normals: true,
        }
    }
}

/// Marks keys of crossings that sit exactly on a grid corner.
const CORNER_KEY: u64 = 1 << 63;

/// A point where the surface crosses a grid edge.
///
/// Crossings share a key exactly when they share a position: the lower
/// corner and axis of the edge, or the voxel itself when the crossing lands
/// on a corner whose value equals the threshold.
#[derive(Clone, Copy)]
struct EdgeCrossing {
    key: u64,
    position: Point3<f64>,
}

/// Collects triangle corners, welding them through an edge-keyed cache
/// when requested.
struct VertexSink {
    mesh: Mesh,
    cache: Option<HashMap<u64, u32>>,
}

impl VertexSink {
    fn new(merge_points: bool) -> Self {
        Self {
            mesh: Mesh::new(),
            cache: merge_points.then(HashMap::new),
        }
    }

    fn vertex(&mut self, crossing: EdgeCrossing) -> u32 {
        let vertices = &mut self.mesh.vertices;
        let mut push = |position| {
            vertices.push(position);
            (vertices.len() - 1) as u32
        };
        match &mut self.cache {
            Some(cache) => *cache
                .entry(crossing.key)
                .or_insert_with(|| push(crossing.position)),
            None => push(crossing.position),
        }
    }

    fn triangle(&mut self, corners: [EdgeCrossing; 3]) {
        let [a, b, c] = corners.map(|corner| corner.key);
        if a == b || b == c || a == c {
            // Collapsed onto a corner, no area left
            return;
        }
        let triangle = corners.map(|corner| self.vertex(corner));
        self.mesh.triangles.push(triangle);
    }
}

#[derive(Debug, Clone, Default)]
pub struct IsosurfaceExtractor {
    config: MarchingCubesConfig,
}

impl IsosurfaceExtractor {
    pub fn new(config: MarchingCubesConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MarchingCubesConfig {
        &self.config
    }

    /// Extract the isosurface of `volume` at `threshold`.
    ///
    /// A threshold outside the intensity range yields an empty mesh.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume has no voxels or invalid spacing.
    pub fn extract(&self, volume: &Volume, threshold: f64) -> Result<Mesh, VolumeError> {
        volume.validate()?;

        let mut sink = VertexSink::new(self.config.merge_points);
        let (nx, ny, nz) = volume.dimensions();
        let has_cells = nx > 1 && ny > 1 && nz > 1;
        let crosses = volume
            .intensity_range()
            .is_some_and(|(lo, hi)| f64::from(lo) < threshold && threshold <= f64::from(hi));

        if has_cells && crosses {
            for z in 0..nz - 1 {
                for y in 0..ny - 1 {
                    for x in 0..nx - 1 {
                        self.march_cell(volume, threshold, (x, y, z), &mut sink);
                    }
                }
            }
        } else {
            debug!("threshold {threshold} does not cross the volume, no cells to march");
        }

        let mut mesh = sink.mesh;
        if self.config.compute_normals {
            mesh = mesh.with_vertex_normals(self.config.area_weighted_normals);
        }
        debug!(
            "marching cubes at {threshold}: {} vertices, {} triangles",
            mesh.vertex_count(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }

    fn march_cell(
        &self,
        volume: &Volume,
        threshold: f64,
        (x, y, z): (usize, usize, usize),
        sink: &mut VertexSink,
    ) {
        let corners = CORNER_OFFSETS.map(|[dx, dy, dz]| (x + dx, y + dy, z + dz));
        let values = corners.map(|(cx, cy, cz)| f64::from(volume.value(cx, cy, cz)));

        let case = values
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value < threshold)
            .fold(0usize, |case, (corner, _)| case | (1 << corner));
        let crossed = EDGE_TABLE[case];
        if crossed == 0 {
            return;
        }

        let mut crossings = [None; 12];
        for (edge, &[a, b]) in EDGE_CORNERS.iter().enumerate() {
            if crossed & (1 << edge) == 0 {
                continue;
            }
            crossings[edge] = edge_crossing(volume, threshold, corners[a], corners[b], values[a], values[b]);
        }

        for triangle in TRI_TABLE[case].chunks_exact(3) {
            if triangle[0] < 0 {
                break;
            }
            let [Some(p0), Some(p1), Some(p2)] =
                [triangle[0], triangle[1], triangle[2]].map(|edge| crossings[edge as usize])
            else {
                continue;
            };
            sink.triangle([p0, p1, p2]);
        }
    }
}

/// Interpolate the surface crossing between two corners, `None` when the
/// corner values are equal.
///
/// Always interpolates from the lower corner so every cell sharing the edge
/// computes a bit-identical point. A corner at exactly the threshold is
/// returned as is, keyed by its voxel.
fn edge_crossing(
    volume: &Volume,
    threshold: f64,
    a: (usize, usize, usize),
    b: (usize, usize, usize),
    value_a: f64,
    value_b: f64,
) -> Option<EdgeCrossing> {
    if value_a == value_b {
        return None;
    }
    let ((a, value_a), (b, value_b)) = if a <= b {
        ((a, value_a), (b, value_b))
    } else {
        ((b, value_b), (a, value_a))
    };
    let (nx, ny, _) = volume.dimensions();
    let linear = |(x, y, z): (usize, usize, usize)| ((z * ny + y) * nx + x) as u64;

    for (corner, value) in [(a, value_a), (b, value_b)] {
        if value == threshold {
            return Some(EdgeCrossing {
                key: CORNER_KEY | linear(corner),
                position: volume.world_position(corner.0, corner.1, corner.2),
            });
        }
    }

    let pa = volume.world_position(a.0, a.1, a.2);
    let pb = volume.world_position(b.0, b.1, b.2);
    let t = (threshold - value_a) / (value_b - value_a);
    let axis = if a.0 != b.0 {
        0
    } else if a.1 != b.1 {
        1
    } else {
        2
    };

    Some(EdgeCrossing {
        key: linear(a) * 3 + axis,
        position: pa + (pb - pa) * t,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sphere(n: usize, radius: f64, center: f64) -> Volume {
        Volume::from_fn((n, n, n), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0), |x, y, z| {
            let d = ((x as f64 - center).powi(2)
                + (y as f64 - center).powi(2)
                + (z as f64 - center).powi(2))
            .sqrt();
            if d <= radius { 1000 } else { 0 }
        })
        .unwrap()
    }

    /// Count how often each undirected edge is used.
    fn edge_usage(mesh: &Mesh) -> HashMap<(u32, u32), usize> {
        let mut usage = HashMap::new();
        for t in &mesh.triangles {
            for i in 0..3 {
                let (a, b) = (t[i], t[(i + 1) % 3]);
                *usage.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        usage
    }

    #[test]
    fn sphere_vertices_lie_near_radius() {
        let radius = 6.0;
        let center = 9.5;
        let mesh = IsosurfaceExtractor::default()
            .extract(&sphere(20, radius, center), 500.0)
            .unwrap();
        assert!(mesh.triangle_count() > 0);
        let diagonal = 3f64.sqrt();
        let c = Point3::new(center, center, center);
        for p in &mesh.vertices {
            let d = (p - c).norm();
            assert!((d - radius).abs() <= diagonal, "vertex at distance {d}");
        }
    }

    #[test]
    fn merged_sphere_is_closed_and_consistently_oriented() {
        let mesh = IsosurfaceExtractor::default()
            .extract(&sphere(16, 5.0, 7.5), 500.0)
            .unwrap();
        assert!(edge_usage(&mesh).values().all(|&count| count == 2));

        let c = Point3::new(7.5, 7.5, 7.5);
        for (p, n) in mesh.vertices.iter().zip(&mesh.normals) {
            assert!(n.dot(&(p - c)) > 0.0, "normal points inward at {p}");
        }
    }

    #[test]
    fn threshold_outside_range_gives_empty_mesh() {
        let volume = sphere(8, 2.0, 3.5);
        let extractor = IsosurfaceExtractor::default();
        assert!(extractor.extract(&volume, 1000.5).unwrap().is_empty());
        assert!(extractor.extract(&volume, -1.0).unwrap().is_empty());
        // Everything inside: no sign change anywhere
        assert!(extractor.extract(&volume, 0.0).unwrap().is_empty());
    }

    #[test]
    fn single_corner_case_interpolates_linearly() {
        let mut values = vec![0i16; 8];
        values[0] = 100;
        let volume =
            Volume::from_flat((2, 2, 2), (2.0, 2.0, 2.0), (1.0, 1.0, 1.0), values).unwrap();
        let mesh = IsosurfaceExtractor::default().extract(&volume, 25.0).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(mesh.vertex_count(), 3);
        // t = (25 - 100) / (0 - 100) = 0.75 along each edge of length 2
        for p in &mesh.vertices {
            let offsets = [p.x - 1.0, p.y - 1.0, p.z - 1.0];
            assert_eq!(offsets.iter().filter(|&&o| o == 0.0).count(), 2);
            assert!(offsets.iter().any(|&o| (o - 1.5).abs() < 1e-12));
        }
        // The corner voxel is inside, so the face normal points away from it
        let n = mesh.normals[0];
        assert!(n.x > 0.0 && n.y > 0.0 && n.z > 0.0);
    }

    #[test]
    fn value_equal_to_threshold_is_inside() {
        // Layers 0, 50, 50: only an inside plateau makes a surface
        let values = [[0i16; 4], [50; 4], [50; 4]].concat();
        let volume =
            Volume::from_flat((2, 2, 3), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0), values).unwrap();
        let mesh = IsosurfaceExtractor::default().extract(&volume, 50.0).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.vertex_count(), 4);
        assert!(mesh.vertices.iter().all(|p| p.z == 1.0));
        assert!(mesh.normals.iter().all(|n| n.z < 0.0));
    }

    #[test]
    fn crossings_on_grid_corners_are_welded() {
        // Intensities in steps of 50 put many voxels exactly on the threshold
        let volume = Volume::from_fn((20, 20, 20), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0), |x, y, z| {
            let d = [x, y, z]
                .iter()
                .map(|&i| (i as f64 - 9.5).powi(2))
                .sum::<f64>()
                .sqrt();
            (300.0 + 50.0 * ((6.0 - d) * 2.0).round()).clamp(-1000.0, 1000.0) as i16
        })
        .unwrap();
        let on_threshold = volume.data().iter().filter(|&&v| v == 300).count();
        assert!(on_threshold > 0);

        let merged = IsosurfaceExtractor::default().extract(&volume, 300.0).unwrap();
        assert!(merged.triangle_count() > 0);

        let distinct: std::collections::HashSet<_> = merged
            .vertices
            .iter()
            .map(|p| [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()])
            .collect();
        assert_eq!(distinct.len(), merged.vertex_count());

        let mut used = vec![false; merged.vertex_count()];
        for &[a, b, c] in &merged.triangles {
            assert!(a != b && b != c && a != c);
            let [pa, pb, pc] = merged.triangle_positions([a, b, c]);
            assert!((pb - pa).cross(&(pc - pa)).norm() > 1e-9);
            for i in [a, b, c] {
                used[i as usize] = true;
            }
        }
        assert!(used.iter().all(|&u| u));

        let soup = IsosurfaceExtractor::new(MarchingCubesConfig {
            merge_points: false,
            ..MarchingCubesConfig::default()
        })
        .extract(&volume, 300.0)
        .unwrap();
        assert_eq!(
            crate::stl::write_binary_stl(&merged).unwrap(),
            crate::stl::write_binary_stl(&soup).unwrap()
        );
    }

    #[test]
    fn unmerged_output_duplicates_shared_vertices() {
        let volume = sphere(12, 3.0, 5.5);
        let merged = IsosurfaceExtractor::default().extract(&volume, 500.0).unwrap();
        let soup = IsosurfaceExtractor::new(MarchingCubesConfig {
            merge_points: false,
            ..MarchingCubesConfig::default()
        })
        .extract(&volume, 500.0)
        .unwrap();
        assert_eq!(merged.triangle_count(), soup.triangle_count());
        assert_eq!(soup.vertex_count(), soup.triangle_count() * 3);
        assert!(merged.vertex_count() < soup.vertex_count());
    }

    #[test]
    fn flat_volume_has_no_cells() {
        let volume =
            Volume::from_flat((4, 4, 1), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0), (0..16).collect())
                .unwrap();
        let mesh = IsosurfaceExtractor::default().extract(&volume, 7.5).unwrap();
        assert!(mesh.is_empty());
    }

    #[test]
    fn empty_volume_is_rejected() {
        let err = IsosurfaceExtractor::default()
            .extract(&Volume::default(), 0.0)
            .unwrap_err();
        assert!(matches!(err, VolumeError::EmptyDimension { .. }));
    }

    #[test]
    fn normals_can_be_skipped() {
        let mesh = IsosurfaceExtractor::new(MarchingCubesConfig {
            compute_normals: false,
            ..MarchingCubesConfig::default()
        })
        .extract(&sphere(8, 2.5, 3.5), 500.0)
        .unwrap();
        assert!(mesh.normals.is_empty());
        assert!(mesh.validate().is_ok());
    }
}
