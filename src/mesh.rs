//! Indexed triangle mesh produced by surface extraction.

use nalgebra::Point3;
use nalgebra::Vector3;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("Triangle {triangle} references vertex {index}, mesh has {vertex_count} vertices")]
    IndexOutOfRange {
        triangle: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("Mesh has {normals} normals for {vertices} vertices")]
    NormalCountMismatch { normals: usize, vertices: usize },
}

/// An indexed triangle mesh.
///
/// Triangles wind counter-clockwise seen from outside, so face normals point
/// from denser tissue toward less dense tissue. `normals` is either empty or
/// holds one unit normal per vertex.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Point3<f64>>,
    pub normals: Vec<Vector3<f64>>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(vertices: usize, triangles: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertices),
            normals: Vec::new(),
            triangles: Vec::with_capacity(triangles),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Corner positions of a triangle.
    #[inline]
    pub fn triangle_positions(&self, triangle: [u32; 3]) -> [Point3<f64>; 3] {
        triangle.map(|index| self.vertices[index as usize])
    }

    /// Per-vertex normals averaged from adjacent faces.
    ///
    /// With `area_weighted` each face contributes its raw cross product,
    /// otherwise its unit normal. Degenerate faces contribute nothing; a vertex
    /// without any contributing face gets the zero vector.
    pub fn vertex_normals(&self, area_weighted: bool) -> Vec<Vector3<f64>> {
        let mut sums = vec![Vector3::zeros(); self.vertices.len()];
        for &triangle in &self.triangles {
            let [a, b, c] = self.triangle_positions(triangle);
            let cross = (b - a).cross(&(c - a));
            let contribution = if area_weighted {
                cross
            } else {
                match cross.try_normalize(f64::EPSILON) {
                    Some(unit) => unit,
                    None => continue,
                }
            };
            for index in triangle {
                sums[index as usize] += contribution;
            }
        }
        sums.into_iter()
            .map(|sum| sum.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::zeros))
            .collect()
    }

    /// Replace the normals with freshly computed vertex normals.
    pub fn with_vertex_normals(mut self, area_weighted: bool) -> Self {
        self.normals = self.vertex_normals(area_weighted);
        self
    }

    /// Axis-aligned bounds, `None` for a mesh without vertices
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(p), hi.sup(p))
        }))
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        let vertex_count = self.vertices.len();
        for (triangle, indices) in self.triangles.iter().enumerate() {
            if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(MeshError::IndexOutOfRange {
                    triangle,
                    index,
                    vertex_count,
                });
            }
        }
        if !self.normals.is_empty() && self.normals.len() != vertex_count {
            return Err(MeshError::NormalCountMismatch {
                normals: self.normals.len(),
                vertices: vertex_count,
            });
        }
        Ok(())
    }
}

/// Unit normal of the triangle `(a, b, c)`, zero when it has no area.
#[inline]
pub fn face_normal(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> Vector3<f64> {
    (b - a)
        .cross(&(c - a))
        .try_normalize(f64::EPSILON)
        .unwrap_or_else(Vector3::zeros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tetrahedron() -> Mesh {
        Mesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
            ],
            normals: Vec::new(),
            triangles: vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
        }
    }

    #[test]
    fn face_normal_follows_winding() {
        let n = face_normal(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert_relative_eq!(n, Vector3::z());
    }

    #[test]
    fn degenerate_face_has_zero_normal() {
        let p = Point3::new(1.0, 2.0, 3.0);
        assert_eq!(face_normal(&p, &p, &Point3::new(2.0, 4.0, 6.0)), Vector3::zeros());
    }

    #[test]
    fn vertex_normals_point_outward() {
        let mesh = tetrahedron().with_vertex_normals(true);
        assert_eq!(mesh.normals.len(), 4);
        let centroid = Vector3::new(0.25, 0.25, 0.25);
        for (p, n) in mesh.vertices.iter().zip(&mesh.normals) {
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-12);
            assert!(n.dot(&(p.coords - centroid)) > 0.0);
        }
        // Apex normal of the corner at the origin is the mean of the three axis faces
        let expected = -Vector3::new(1.0, 1.0, 1.0).normalize();
        assert_relative_eq!(mesh.normals[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn zero_area_faces_are_ignored() {
        let mut mesh = tetrahedron();
        mesh.vertices.push(Point3::new(5.0, 5.0, 5.0));
        mesh.triangles.push([4, 4, 4]);
        let normals = mesh.vertex_normals(false);
        assert_eq!(normals[4], Vector3::zeros());
    }

    #[test]
    fn validate_reports_bad_indices() {
        let mut mesh = tetrahedron();
        assert!(mesh.validate().is_ok());
        mesh.triangles.push([0, 1, 9]);
        assert_eq!(
            mesh.validate(),
            Err(MeshError::IndexOutOfRange {
                triangle: 4,
                index: 9,
                vertex_count: 4
            })
        );
    }

    #[test]
    fn bounds_cover_all_vertices() {
        let (lo, hi) = tetrahedron().bounds().unwrap();
        assert_eq!(lo, Point3::origin());
        assert_eq!(hi, Point3::new(1.0, 1.0, 1.0));
        assert!(Mesh::new().bounds().is_none());
    }
}
