//
// series.rs
// dicom2mesh
//
// DICOM directory scanning: discovers the series in a directory, keeps
// their slices ordered along the stacking axis and derives spacing and
// origin metadata from the headers.
//

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use dicom::object::{open_file, DefaultDicomObject};
use dicom_dictionary_std::tags;
use walkdir::WalkDir;

use crate::routines::RoutineError;

/// One coherent acquisition within a DICOM directory: the slices that
/// share a SeriesInstanceUID.
pub struct DicomSeries {
    pub uid: String,
    pub description: String,
    slices: Vec<(PathBuf, DefaultDicomObject)>,
}

impl DicomSeries {
    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    pub(crate) fn slice_entries(&self) -> &[(PathBuf, DefaultDicomObject)] {
        &self.slices
    }

    fn objects(&self) -> impl Iterator<Item = &DefaultDicomObject> {
        self.slices.iter().map(|(_, obj)| obj)
    }

    /// Orders slices by ImagePositionPatient z, falling back to
    /// InstanceNumber for series without position information.
    fn sort_slices(&mut self) {
        self.slices.sort_by(|a, b| {
            slice_sort_key(&a.1)
                .partial_cmp(&slice_sort_key(&b.1))
                .unwrap_or(Ordering::Equal)
        });
    }

    /// Voxel spacing in mm, ordered (x, y, z). In-plane spacing comes
    /// from PixelSpacing (stored row-major, so (y, x) in the file), the
    /// inter-slice distance from consecutive slice positions with
    /// SliceThickness as fallback. Missing metadata defaults to 1.0.
    pub fn spacing(&self) -> [f64; 3] {
        let (sx, sy) = self
            .objects()
            .find_map(pixel_spacing)
            .unwrap_or((1.0, 1.0));
        let sz = self
            .slice_distance()
            .or_else(|| self.objects().find_map(slice_thickness))
            .unwrap_or(1.0);
        [sx, sy, sz]
    }

    /// World-space position of the first slice, or zeros.
    pub fn origin(&self) -> [f64; 3] {
        self.objects()
            .next()
            .and_then(slice_position)
            .unwrap_or([0.0; 3])
    }

    fn slice_distance(&self) -> Option<f64> {
        let mut zs = self.objects().filter_map(|o| slice_position(o).map(|p| p[2]));
        let a = zs.next()?;
        let b = zs.next()?;
        let d = (b - a).abs();
        (d > f64::EPSILON).then_some(d)
    }
}

/// Scans `dir` (depth 1) for readable DICOM files and groups them by
/// SeriesInstanceUID, in discovery order. Files that do not parse as
/// DICOM are skipped.
pub fn scan_directory(dir: &Path) -> Result<Vec<DicomSeries>, RoutineError> {
    if !dir.is_dir() {
        return Err(RoutineError::InvalidPath(dir.to_path_buf()));
    }

    let mut series: Vec<DicomSeries> = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        let obj = match open_file(&path) {
            Ok(obj) => obj,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping non-DICOM file");
                continue;
            }
        };

        let uid = element_text(&obj, tags::SERIES_INSTANCE_UID).unwrap_or_default();
        match series.iter_mut().find(|s| s.uid == uid) {
            Some(existing) => existing.slices.push((path, obj)),
            None => {
                let description = element_text(&obj, tags::SERIES_DESCRIPTION).unwrap_or_default();
                series.push(DicomSeries {
                    uid,
                    description,
                    slices: vec![(path, obj)],
                });
            }
        }
    }

    for s in &mut series {
        s.sort_slices();
    }
    Ok(series)
}

fn element_text(obj: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|s| s.trim_end_matches('\0').trim().to_string())
}

fn slice_sort_key(obj: &DefaultDicomObject) -> f64 {
    if let Some(pos) = slice_position(obj) {
        return pos[2];
    }
    instance_number(obj).map(f64::from).unwrap_or(0.0)
}

fn slice_position(obj: &DefaultDicomObject) -> Option<[f64; 3]> {
    let pos = obj
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()?
        .to_multi_float64()
        .ok()?;
    (pos.len() >= 3).then(|| [pos[0], pos[1], pos[2]])
}

fn instance_number(obj: &DefaultDicomObject) -> Option<i32> {
    obj.element(tags::INSTANCE_NUMBER).ok()?.to_int::<i32>().ok()
}

fn pixel_spacing(obj: &DefaultDicomObject) -> Option<(f64, f64)> {
    let ps = obj
        .element(tags::PIXEL_SPACING)
        .ok()?
        .to_multi_float64()
        .ok()?;
    (ps.len() >= 2).then(|| (ps[1], ps[0]))
}

fn slice_thickness(obj: &DefaultDicomObject) -> Option<f64> {
    obj.element(tags::SLICE_THICKNESS).ok()?.to_float64().ok()
}
