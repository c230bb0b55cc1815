//
// volume.rs
// dicom2mesh
//
// Volumetric image type shared by the loaders, the isosurface extractor
// and the cropping operation.
//

use ndarray::{Array3, s};

/// A 3D regular grid of scalar intensity samples with spacing and origin
/// metadata. Data is indexed `[z, y, x]` (slice, row, column); intensity
/// values are modality-rescaled (Hounsfield units for CT input).
#[derive(Debug, Clone, Default)]
pub struct VolumeImage {
    data: Array3<f32>,
    /// Voxel spacing in mm, ordered (x, y, z).
    spacing: [f64; 3],
    /// World-space position of the voxel at index (0, 0, 0).
    origin: [f64; 3],
}

impl VolumeImage {
    pub fn new(data: Array3<f32>, spacing: [f64; 3], origin: [f64; 3]) -> Self {
        Self {
            data,
            spacing,
            origin,
        }
    }

    /// Extents ordered (x, y, z) to match spacing and world coordinates.
    pub fn dimensions(&self) -> (usize, usize, usize) {
        let (nz, ny, nx) = self.data.dim();
        (nx, ny, nz)
    }

    /// Number of slices along the stacking axis.
    pub fn num_slices(&self) -> usize {
        self.data.dim().0
    }

    /// True when all three extents are strictly positive. Meshing and
    /// cropping reject volumes for which this does not hold.
    pub fn has_data(&self) -> bool {
        let (nx, ny, nz) = self.dimensions();
        nx > 0 && ny > 0 && nz > 0
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[z, y, x]]
    }

    /// Replaces the grid with the inclusive slice range `[start, end]`,
    /// moving the world origin to the first kept slice. Callers validate
    /// the range beforehand; out-of-range indices would panic here.
    pub fn keep_slice_range(&mut self, start: usize, end: usize) {
        self.data = self.data.slice(s![start..=end, .., ..]).to_owned();
        self.origin[2] += start as f64 * self.spacing[2];
    }

    /// Returns a copy with every value at or above `upper` replaced by
    /// `mask_value`. Used to carve an intensity band before extraction.
    pub fn masked_above(&self, upper: f32, mask_value: f32) -> VolumeImage {
        let data = self
            .data
            .mapv(|v| if v >= upper { mask_value } else { v });
        VolumeImage {
            data,
            spacing: self.spacing,
            origin: self.origin,
        }
    }
}
