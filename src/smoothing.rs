//! Windowed-sinc mesh smoothing.
//!
//! Vertex positions are passed through a low-pass filter built from a
//! Hamming-windowed sinc expanded in Chebyshev polynomials of the umbrella
//! operator (Taubin et al., "Optimal surface smoothing as filter design",
//! 1996). Low frequencies pass almost unchanged, so the surface does not
//! shrink the way repeated Laplacian smoothing makes it.

use std::collections::HashMap;
use std::f64::consts::PI;

use log::debug;
use log::warn;
use nalgebra::Point3;
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::mesh::Mesh;
use crate::mesh::MeshError;
use crate::mesh::face_normal;

const MAX_OFFSET_ITERATIONS: usize = 500;
const OFFSET_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error, PartialEq)]
pub enum SmoothingError {
    #[error("Pass band must lie in (0, 1), got {0}")]
    InvalidPassBand(f64),

    #[error("{name} must be a finite angle in degrees, got {value}")]
    InvalidAngle { name: &'static str, value: f64 },

    #[error("Cannot smooth an inconsistent mesh: {0}")]
    Mesh(#[from] MeshError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingParams {
    pub iterations: u32,
    /// Normalized pass-band frequency; smaller values smooth harder
    pub pass_band: f64,
    /// Keep vertices on open or non-manifold edges in place
    pub preserve_boundary: bool,
    /// Keep vertices on sharp interior edges in place; when off, sharp
    /// edges are smoothed like any other
    pub preserve_feature_edges: bool,
    pub non_manifold_smoothing: bool,
    /// Dihedral angle above which an interior edge counts as a feature
    pub feature_angle_deg: f64,
    /// Largest bend of a boundary chain that still lets its vertices slide
    pub edge_angle_deg: f64,
    /// Filter in a unit-box frame to keep the recurrence well conditioned
    pub normalize_coordinates: bool,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            iterations: 15,
            pass_band: 0.1,
            preserve_boundary: true,
            preserve_feature_edges: false,
            non_manifold_smoothing: true,
            feature_angle_deg: 45.0,
            edge_angle_deg: 15.0,
            normalize_coordinates: true,
        }
    }
}

impl SmoothingParams {
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_pass_band(mut self, pass_band: f64) -> Self {
        self.pass_band = pass_band;
        self
    }

    pub fn with_preserve_boundary(mut self, preserve: bool) -> Self {
        self.preserve_boundary = preserve;
        self
    }

    pub fn with_preserve_feature_edges(mut self, preserve: bool) -> Self {
        self.preserve_feature_edges = preserve;
        self
    }

    pub fn with_feature_angle(mut self, degrees: f64) -> Self {
        self.feature_angle_deg = degrees;
        self
    }

    pub fn validate(&self) -> Result<(), SmoothingError> {
        if !(self.pass_band > 0.0 && self.pass_band < 1.0) {
            return Err(SmoothingError::InvalidPassBand(self.pass_band));
        }
        for (name, value) in [
            ("feature_angle_deg", self.feature_angle_deg),
            ("edge_angle_deg", self.edge_angle_deg),
        ] {
            if !value.is_finite() {
                return Err(SmoothingError::InvalidAngle { name, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Interior,
    Boundary,
    NonManifold,
    Feature,
}

#[derive(Debug, Clone)]
pub struct MeshSmoother {
    params: SmoothingParams,
    area_weighted_normals: bool,
}

impl MeshSmoother {
    pub fn new(params: SmoothingParams) -> Self {
        Self {
            params,
            area_weighted_normals: true,
        }
    }

    /// Weighting used when normals are recomputed after smoothing.
    pub fn with_area_weighted_normals(mut self, area_weighted: bool) -> Self {
        self.area_weighted_normals = area_weighted;
        self
    }

    pub fn params(&self) -> &SmoothingParams {
        &self.params
    }

    /// Smooth vertex positions, returning a new mesh with the same triangles.
    ///
    /// Normals are recomputed when the input carries them.
    pub fn smooth(&self, mesh: &Mesh) -> Result<Mesh, SmoothingError> {
        self.params.validate()?;
        mesh.validate()?;

        let iterations = self.params.iterations as usize;
        if iterations == 0 || mesh.triangles.is_empty() {
            return Ok(mesh.clone());
        }

        let neighbors = self.vertex_neighbors(mesh);
        let (coefficients, converged) = filter_coefficients(iterations, self.params.pass_band);
        if !converged {
            warn!(
                "no optimal offset for pass band {} over {iterations} iterations, expect some shrinkage",
                self.params.pass_band
            );
        }

        let (center, scale) = if self.params.normalize_coordinates {
            normalization(mesh)
        } else {
            (Vector3::zeros(), 1.0)
        };
        let start: Vec<Vector3<f64>> = mesh
            .vertices
            .iter()
            .map(|p| (p.coords - center) / scale)
            .collect();

        let filtered = apply_filter(&start, &neighbors, &coefficients);

        let mut max_displacement = 0.0f64;
        let vertices: Vec<Point3<f64>> = mesh
            .vertices
            .iter()
            .zip(&filtered)
            .zip(&neighbors)
            .map(|((original, moved), neighbors)| {
                if neighbors.is_empty() {
                    return *original;
                }
                let p = Point3::from(moved * scale + center);
                max_displacement = max_displacement.max((p - original).norm());
                p
            })
            .collect();
        debug!(
            "windowed sinc over {iterations} iterations moved vertices by at most {max_displacement:.4}"
        );

        let mut smoothed = Mesh {
            vertices,
            normals: Vec::new(),
            triangles: mesh.triangles.clone(),
        };
        if !mesh.normals.is_empty() {
            smoothed = smoothed.with_vertex_normals(self.area_weighted_normals);
        }
        Ok(smoothed)
    }

    /// Neighbor lists driving the umbrella operator; an empty list pins the
    /// vertex in place.
    fn vertex_neighbors(&self, mesh: &Mesh) -> Vec<Vec<u32>> {
        let mut edge_faces: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (face, triangle) in mesh.triangles.iter().enumerate() {
            for i in 0..3 {
                let (a, b) = (triangle[i], triangle[(i + 1) % 3]);
                if a != b {
                    edge_faces.entry((a.min(b), a.max(b))).or_default().push(face);
                }
            }
        }

        let face_normals: Vec<Vector3<f64>> = mesh
            .triangles
            .iter()
            .map(|&t| {
                let [a, b, c] = mesh.triangle_positions(t);
                face_normal(&a, &b, &c)
            })
            .collect();
        let cos_feature = self.params.feature_angle_deg.to_radians().cos();

        let vertex_count = mesh.vertices.len();
        let mut all: Vec<Vec<u32>> = vec![Vec::new(); vertex_count];
        let mut special: Vec<Vec<(u32, EdgeKind)>> = vec![Vec::new(); vertex_count];
        for (&(a, b), faces) in &edge_faces {
            let kind = match faces.len() {
                1 => EdgeKind::Boundary,
                2 if self.params.preserve_feature_edges => {
                    let (n1, n2) = (face_normals[faces[0]], face_normals[faces[1]]);
                    let degenerate = n1 == Vector3::zeros() || n2 == Vector3::zeros();
                    if !degenerate && n1.dot(&n2) < cos_feature {
                        EdgeKind::Feature
                    } else {
                        EdgeKind::Interior
                    }
                }
                2 => EdgeKind::Interior,
                _ => EdgeKind::NonManifold,
            };
            all[a as usize].push(b);
            all[b as usize].push(a);
            if kind != EdgeKind::Interior {
                special[a as usize].push((b, kind));
                special[b as usize].push((a, kind));
            }
        }

        let cos_edge = self.params.edge_angle_deg.to_radians().cos();
        let mut counts = [0usize; 3];
        let neighbors: Vec<Vec<u32>> = all
            .into_iter()
            .zip(special)
            .enumerate()
            .map(|(vertex, (mut all, mut special))| {
                if special.is_empty() {
                    all.sort_unstable();
                    counts[0] += usize::from(!all.is_empty());
                    return all;
                }
                special.sort_unstable_by_key(|&(neighbor, _)| neighbor);
                if self.pins(&special) || special.len() != 2 {
                    counts[2] += 1;
                    return Vec::new();
                }
                let p = mesh.vertices[vertex];
                let before = p - mesh.vertices[special[0].0 as usize];
                let after = mesh.vertices[special[1].0 as usize] - p;
                match (before.try_normalize(f64::EPSILON), after.try_normalize(f64::EPSILON)) {
                    (Some(u), Some(v)) if u.dot(&v) >= cos_edge => {
                        counts[1] += 1;
                        vec![special[0].0, special[1].0]
                    }
                    _ => {
                        counts[2] += 1;
                        Vec::new()
                    }
                }
            })
            .collect();
        debug!(
            "smoothing classes: {} free, {} on edge chains, {} fixed",
            counts[0], counts[1], counts[2]
        );
        neighbors
    }

    fn pins(&self, special: &[(u32, EdgeKind)]) -> bool {
        special.iter().any(|&(_, kind)| match kind {
            EdgeKind::Boundary => self.params.preserve_boundary,
            EdgeKind::Feature => true,
            EdgeKind::NonManifold => {
                self.params.preserve_boundary || !self.params.non_manifold_smoothing
            }
            EdgeKind::Interior => false,
        })
    }
}

/// Chebyshev coefficients of the windowed sinc filter.
///
/// The cut-off is shifted with Newton-Raphson until the filter passes the
/// pass-band frequency with unit gain, and the result is rescaled to sum to
/// one. The flag reports whether the offset search succeeded.
pub(crate) fn filter_coefficients(iterations: usize, pass_band: f64) -> (Vec<f64>, bool) {
    let n = iterations;
    let theta_pb = (1.0 - 0.5 * pass_band).acos();
    let window: Vec<f64> = (0..=n)
        .map(|i| 0.54 + 0.46 * (i as f64 * PI / (n + 1) as f64).cos())
        .collect();

    let mut sigma = 0.0;
    let mut coefficients = vec![0.0; n + 1];
    let mut converged = false;
    for _ in 0..MAX_OFFSET_ITERATIONS {
        let theta = theta_pb + sigma;
        coefficients[0] = window[0] * theta / PI;
        for i in 1..=n {
            coefficients[i] = 2.0 * window[i] * (i as f64 * theta).sin() / (i as f64 * PI);
        }

        // Coefficients of the derivative series
        let mut derivative = vec![0.0; n + 1];
        if n > 1 {
            derivative[n - 2] = 2.0 * (n - 1) as f64 * coefficients[n - 1];
            for i in (0..n.saturating_sub(2)).rev() {
                derivative[i] = derivative[i + 2] + 2.0 * (i + 1) as f64 * coefficients[i + 1];
            }
        }

        let mut gain = 0.0;
        let mut slope = 0.0;
        for i in 0..=n {
            let chebyshev = (i as f64 * theta_pb).cos();
            gain += coefficients[i] * chebyshev;
            slope += derivative[i] * chebyshev;
        }

        if (gain - 1.0).abs() < OFFSET_TOLERANCE {
            converged = true;
            break;
        }
        if n < 2 || slope == 0.0 || !slope.is_finite() {
            break;
        }
        sigma -= (gain - 1.0) / slope;
    }

    // Unit gain at zero frequency keeps the mesh from scaling about its centre
    let total: f64 = coefficients.iter().sum();
    if total.abs() > f64::EPSILON {
        coefficients.iter_mut().for_each(|c| *c /= total);
    }
    (coefficients, converged)
}

/// Evaluate the filter with the three-term Chebyshev recurrence.
fn apply_filter(
    start: &[Vector3<f64>],
    neighbors: &[Vec<u32>],
    coefficients: &[f64],
) -> Vec<Vector3<f64>> {
    let umbrella = |positions: &[Vector3<f64>], vertex: usize| -> Vector3<f64> {
        let around = &neighbors[vertex];
        let sum: Vector3<f64> = around.iter().map(|&n| positions[n as usize]).sum();
        positions[vertex] - sum / around.len() as f64
    };

    // T1 applied to the input: x - K x / 2
    let mut previous: Vec<Vector3<f64>> = start.to_vec();
    let mut current: Vec<Vector3<f64>> = (0..start.len())
        .into_par_iter()
        .map(|v| {
            if neighbors[v].is_empty() {
                start[v]
            } else {
                start[v] - umbrella(start, v) * 0.5
            }
        })
        .collect();
    let mut filtered: Vec<Vector3<f64>> = previous
        .par_iter()
        .zip(&current)
        .map(|(t0, t1)| t0 * coefficients[0] + t1 * coefficients[1])
        .collect();

    for &c in &coefficients[2..] {
        let next: Vec<Vector3<f64>> = (0..start.len())
            .into_par_iter()
            .map(|v| {
                if neighbors[v].is_empty() {
                    current[v]
                } else {
                    current[v] * 2.0 - umbrella(&current, v) - previous[v]
                }
            })
            .collect();
        filtered
            .par_iter_mut()
            .zip(&next)
            .for_each(|(sum, t)| *sum += t * c);
        previous = std::mem::replace(&mut current, next);
    }
    filtered
}

fn normalization(mesh: &Mesh) -> (Vector3<f64>, f64) {
    match mesh.bounds() {
        Some((lo, hi)) => {
            let extent = (hi - lo).max();
            let scale = if extent > 0.0 { extent } else { 1.0 };
            (nalgebra::center(&lo, &hi).coords, scale)
        }
        None => (Vector3::zeros(), 1.0),
    }
}
