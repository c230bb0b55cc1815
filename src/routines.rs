//
// routines.rs
// dicom2mesh
//
// The volume acquisition and meshing façade: loads DICOM series or PNG
// slice stacks into a VolumeImage, extracts an isosurface mesh from it
// and crops a slice sub-range. All interactive steps go through the
// injected choice providers.
//

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dicom::pixeldata::PixelDecoder;
use dicom_pixeldata::{ConvertOptions, VoiLutOption};
use ndarray::{s, Array2, Array3};
use rayon::prelude::*;
use thiserror::Error;

use crate::choice::{NonInteractiveSelector, SeriesSelector, SliceRangeSelector};
use crate::marching_cubes;
use crate::mesh::Mesh;
use crate::progress::ProgressSink;
use crate::series::{self, DicomSeries};
use crate::volume::VolumeImage;

#[derive(Debug, Error)]
pub enum RoutineError {
    #[error("input path does not exist or is not readable: {0:?}")]
    InvalidPath(PathBuf),

    #[error("no DICOM data in directory {0:?}")]
    NoDicomData(PathBuf),

    #[error("{count} DICOM series found, a series selection is required")]
    AmbiguousSeries { count: usize },

    #[error("series index {index} is out of range ({count} series found)")]
    SeriesOutOfRange { index: usize, count: usize },

    #[error("no selection could be made: {0}")]
    Selection(String),

    #[error("no input slices given")]
    EmptyInput,

    #[error("voxel spacing must be positive, got {0}")]
    InvalidSpacing(f64),

    #[error("slice {path:?} is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    InconsistentSlices {
        path: PathBuf,
        expected_width: usize,
        expected_height: usize,
        actual_width: usize,
        actual_height: usize,
    },

    #[error("failed to read slice {path:?}: {message}")]
    SliceRead { path: PathBuf, message: String },

    #[error("volume contains no voxel data")]
    NotLoaded,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Uniform entry point for volume acquisition, isosurface extraction
/// and crop-range interaction. Progress reporting and series selection
/// are injected at construction; there is no global state.
pub struct DicomRoutines {
    progress: Option<Arc<dyn ProgressSink>>,
    series_selector: Box<dyn SeriesSelector>,
}

impl Default for DicomRoutines {
    fn default() -> Self {
        Self::new()
    }
}

impl DicomRoutines {
    /// A façade without progress reporting that refuses ambiguous
    /// multi-series directories.
    pub fn new() -> Self {
        Self {
            progress: None,
            series_selector: Box::new(NonInteractiveSelector),
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_series_selector(mut self, selector: Box<dyn SeriesSelector>) -> Self {
        self.series_selector = selector;
        self
    }

    fn progress_ref(&self) -> Option<&dyn ProgressSink> {
        self.progress.as_deref()
    }

    /// Loads the DICOM images within a directory. A directory holding
    /// several series needs a selection; the injected selector decides
    /// (the default fails with [`RoutineError::AmbiguousSeries`]).
    pub fn load_dicom_image(&self, path_to_dicom: &Path) -> Result<VolumeImage, RoutineError> {
        println!("Read DICOM images located under {}", path_to_dicom.display());

        let all = series::scan_directory(path_to_dicom)?;
        if all.is_empty() {
            return Err(RoutineError::NoDicomData(path_to_dicom.to_path_buf()));
        }

        println!("Nbr of series = {}", all.len());
        for (i, s) in all.iter().enumerate() {
            println!("({i})  :  {} files, name = {}", s.num_slices(), s.description);
        }

        let index = if all.len() == 1 {
            0
        } else {
            self.series_selector.select(&all)?
        };
        let selected = &all[index];
        tracing::info!(series = index, description = %selected.description, "loading series");

        let volume = self.decode_series(selected)?;
        if !volume.has_data() {
            return Err(RoutineError::NoDicomData(path_to_dicom.to_path_buf()));
        }
        Ok(volume)
    }

    fn decode_series(&self, series: &DicomSeries) -> Result<VolumeImage, RoutineError> {
        // Identity VOI keeps raw rescaled intensities (HU for CT); the
        // windowing applied by viewers would destroy the iso scale.
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        let entries = series.slice_entries();
        let total = entries.len();

        let mut slices = Vec::with_capacity(total);
        for (i, (path, obj)) in entries.iter().enumerate() {
            let decoded = obj.decode_pixel_data().map_err(|e| RoutineError::SliceRead {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let arr = decoded
                .to_ndarray_with_options::<f32>(&options)
                .map_err(|e| RoutineError::SliceRead {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            slices.push(arr.slice_move(s![0, .., .., 0]));
            if let Some(p) = self.progress_ref() {
                p.report((i + 1) as f64 / total as f64);
            }
        }

        let paths: Vec<PathBuf> = entries.iter().map(|(p, _)| p.clone()).collect();
        let data = stack_slices(slices, &paths)?;
        Ok(VolumeImage::new(data, series.spacing(), series.origin()))
    }

    /// Stacks a sequence of PNG images into a volume. The order of
    /// `paths` determines the slice order; all images must share the
    /// same 2D dimensions and all spacings must be positive.
    pub fn load_png_images(
        &self,
        paths: &[PathBuf],
        x_spacing: f64,
        y_spacing: f64,
        slice_spacing: f64,
    ) -> Result<VolumeImage, RoutineError> {
        if paths.is_empty() {
            return Err(RoutineError::EmptyInput);
        }
        for spacing in [x_spacing, y_spacing, slice_spacing] {
            if !(spacing > 0.0) {
                return Err(RoutineError::InvalidSpacing(spacing));
            }
        }
        for path in paths {
            if !path.is_file() {
                eprintln!("PNG file does not exist: {}", path.display());
                return Err(RoutineError::InvalidPath(path.clone()));
            }
        }

        let total = paths.len();
        let loaded = AtomicUsize::new(0);
        let progress = self.progress.clone();
        let slices: Vec<Array2<f32>> = paths
            .par_iter()
            .map(|path| {
                let img = image::open(path)
                    .map_err(|e| RoutineError::SliceRead {
                        path: path.clone(),
                        message: e.to_string(),
                    })?
                    .to_luma16();
                let (w, h) = img.dimensions();
                let data: Vec<f32> = img.into_raw().into_iter().map(f32::from).collect();
                let arr = Array2::from_shape_vec((h as usize, w as usize), data)
                    .expect("luma buffer matches image dimensions");
                if let Some(p) = progress.as_deref() {
                    let done = loaded.fetch_add(1, Ordering::Relaxed) + 1;
                    p.report(done as f64 / total as f64);
                }
                Ok(arr)
            })
            .collect::<Result<_, RoutineError>>()?;

        let data = stack_slices(slices, paths)?;
        let volume = VolumeImage::new(
            data,
            [x_spacing, y_spacing, slice_spacing],
            [0.0, 0.0, 0.0],
        );
        if !volume.has_data() {
            return Err(RoutineError::EmptyInput);
        }
        Ok(volume)
    }

    /// Extracts the isosurface at `iso_value`. With `upper_iso_value`
    /// set, voxels at or above the upper value are masked below the iso
    /// value first, so the surface encloses the intensity band
    /// `[iso_value, upper)`. An upper value below `iso_value` masks
    /// every candidate voxel and yields an empty mesh. Without an upper
    /// value the result is exactly the single-threshold surface.
    pub fn image_to_mesh(
        &self,
        image: &VolumeImage,
        iso_value: i32,
        upper_iso_value: Option<i32>,
    ) -> Result<Mesh, RoutineError> {
        if !image.has_data() {
            return Err(RoutineError::NotLoaded);
        }

        let mesh = match upper_iso_value {
            Some(upper) => {
                println!("Create surface mesh with iso value range = {iso_value} to {upper}");
                let masked = image.masked_above(upper as f32, (iso_value - 1) as f32);
                marching_cubes::extract_isosurface(&masked, iso_value as f32, self.progress_ref())
            }
            None => {
                println!("Create surface mesh with iso value = {iso_value}");
                marching_cubes::extract_isosurface(image, iso_value as f32, self.progress_ref())
            }
        };
        Ok(mesh)
    }

    /// Crops the volume to the slice range proposed by `range`,
    /// mutating it in place. An unusable range skips the crop and
    /// leaves the volume untouched.
    pub fn crop(
        &self,
        image: &mut VolumeImage,
        range: &dyn SliceRangeSelector,
    ) -> Result<(), RoutineError> {
        if !image.has_data() {
            return Err(RoutineError::NotLoaded);
        }

        let depth = image.num_slices();
        match range.select(depth) {
            Some((start, end)) if start <= end && end < depth => {
                println!("Crop from slice {start} to {end}");
                image.keep_slice_range(start, end);
                if let Some(p) = self.progress_ref() {
                    p.report(1.0);
                }
            }
            _ => {
                tracing::warn!("invalid slice settings, cropping skipped");
                println!("Invalid slice settings - skip cropping.");
            }
        }
        Ok(())
    }
}

fn stack_slices(slices: Vec<Array2<f32>>, paths: &[PathBuf]) -> Result<Array3<f32>, RoutineError> {
    let (height, width) = slices[0].dim();
    for (i, slice) in slices.iter().enumerate() {
        let (h, w) = slice.dim();
        if (h, w) != (height, width) {
            return Err(RoutineError::InconsistentSlices {
                path: paths[i].clone(),
                expected_width: width,
                expected_height: height,
                actual_width: w,
                actual_height: h,
            });
        }
    }

    let mut data = Array3::zeros((slices.len(), height, width));
    for (i, slice) in slices.into_iter().enumerate() {
        data.slice_mut(s![i, .., ..]).assign(&slice);
    }
    Ok(data)
}
