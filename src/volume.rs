use nalgebra::Point3;
use ndarray::Array3;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VolumeError {
    #[error("Volume has no voxels (dimensions {nx}x{ny}x{nz})")]
    EmptyDimension { nx: usize, ny: usize, nz: usize },

    #[error("Intensity array holds {actual} values, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Voxel spacing must be positive and finite, got {0:?}")]
    InvalidSpacing((f64, f64, f64)),
}

/// Dense grid of CT intensities in Hounsfield Units.
///
/// Data is stored with shape (depth, height, width), so the flat view runs x
/// fastest. There is no mutable access once built, which lets concurrent
/// exports share one volume behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<i16>,
    spacing: (f64, f64, f64),
    origin: (f64, f64, f64),
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            data: Array3::zeros((0, 0, 0)),
            spacing: (1.0, 1.0, 1.0),
            origin: (0.0, 0.0, 0.0),
        }
    }
}

impl Volume {
    /// Build a volume from an array shaped (depth, height, width).
    ///
    /// # Errors
    ///
    /// Returns an error if any dimension is zero or the spacing is not
    /// strictly positive.
    pub fn new(
        data: Array3<i16>,
        spacing: (f64, f64, f64),
        origin: (f64, f64, f64),
    ) -> Result<Self, VolumeError> {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        let volume = Self {
            data,
            spacing,
            origin,
        };
        volume.validate()?;
        Ok(volume)
    }

    /// Build a volume from a flat intensity array with x varying fastest.
    pub fn from_flat(
        dimensions: (usize, usize, usize),
        spacing: (f64, f64, f64),
        origin: (f64, f64, f64),
        intensities: Vec<i16>,
    ) -> Result<Self, VolumeError> {
        let (nx, ny, nz) = dimensions;
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(VolumeError::EmptyDimension { nx, ny, nz });
        }
        let expected = nx * ny * nz;
        if intensities.len() != expected {
            return Err(VolumeError::LengthMismatch {
                expected,
                actual: intensities.len(),
            });
        }
        let actual = intensities.len();
        let data = Array3::from_shape_vec((nz, ny, nx), intensities)
            .map_err(|_| VolumeError::LengthMismatch { expected, actual })?;
        Self::new(data, spacing, origin)
    }

    /// Sample `f(x, y, z)` for every voxel index.
    pub fn from_fn<F>(
        dimensions: (usize, usize, usize),
        spacing: (f64, f64, f64),
        origin: (f64, f64, f64),
        f: F,
    ) -> Result<Self, VolumeError>
    where
        F: Fn(usize, usize, usize) -> i16 + Sync,
    {
        let (nx, ny, _) = dimensions;
        let count = dimensions.0 * dimensions.1 * dimensions.2;
        let intensities: Vec<i16> = (0..count)
            .into_par_iter()
            .map(|i| f(i % nx, (i / nx) % ny, i / (nx * ny)))
            .collect();
        Self::from_flat(dimensions, spacing, origin, intensities)
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get the dimensions of the volume as (nx, ny, nz)
    pub fn dimensions(&self) -> (usize, usize, usize) {
        let (nz, ny, nx) = self.data.dim();
        (nx, ny, nz)
    }

    /// Voxel spacing in mm along (x, y, z)
    pub fn spacing(&self) -> (f64, f64, f64) {
        self.spacing
    }

    /// World position of voxel (0, 0, 0)
    pub fn origin(&self) -> (f64, f64, f64) {
        self.origin
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<i16> {
        &self.data
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize, z: usize) -> i16 {
        self.data[[z, y, x]]
    }

    /// World coordinates of a voxel index: `origin + index * spacing`
    #[inline]
    pub fn world_position(&self, x: usize, y: usize, z: usize) -> Point3<f64> {
        Point3::new(
            self.origin.0 + x as f64 * self.spacing.0,
            self.origin.1 + y as f64 * self.spacing.1,
            self.origin.2 + z as f64 * self.spacing.2,
        )
    }

    /// Smallest and largest intensity, `None` for an empty volume
    pub fn intensity_range(&self) -> Option<(i16, i16)> {
        self.data.iter().fold(None, |range, &value| match range {
            None => Some((value, value)),
            Some((lo, hi)) => Some((lo.min(value), hi.max(value))),
        })
    }

    /// Check the invariants a surface extraction relies on.
    pub fn validate(&self) -> Result<(), VolumeError> {
        let (nx, ny, nz) = self.dimensions();
        if self.data.is_empty() {
            return Err(VolumeError::EmptyDimension { nx, ny, nz });
        }
        let (sx, sy, sz) = self.spacing;
        let valid = |s: f64| s.is_finite() && s > 0.0;
        if !(valid(sx) && valid(sy) && valid(sz)) {
            return Err(VolumeError::InvalidSpacing(self.spacing));
        }
        Ok(())
    }
}
