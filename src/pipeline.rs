//
// pipeline.rs
// dicom2mesh
//
// The conversion pipeline: loads the input data (DICOM directory, PNG
// stack or an existing mesh file), extracts the isosurface, applies the
// requested post-processing steps and exports the result together with
// a parameter sidecar file.
//

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::choice::{
    FixedRangeSelector, FixedSeriesSelector, PromptRangeSelector, PromptSeriesSelector,
};
use crate::mesh::Mesh;
use crate::mesh_filter;
use crate::mesh_io;
use crate::progress::{ProgressSink, TerminalProgress};
use crate::routines::DicomRoutines;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CropMode {
    Off,
    /// Ask for the slice range on stdin.
    Interactive,
    /// Crop to a predetermined inclusive slice range.
    Range { start: usize, end: usize },
}

/// Everything one conversion run needs. Defaults mirror the classic
/// tool: iso value 400 (hard tissue), unit spacing, all post-processing
/// off.
#[derive(Debug, Clone, Serialize)]
pub struct MeshParameters {
    /// DICOM directory, or an obj/stl/ply file to re-process.
    pub input_path: Option<PathBuf>,
    /// Ordered PNG slices forming a volume; takes precedence over
    /// `input_path` when set.
    pub input_image_files: Option<Vec<PathBuf>>,
    pub xyz_spacing: [f64; 3],
    pub output_path: Option<PathBuf>,
    pub binary_export: bool,
    pub iso_value: i32,
    pub upper_iso_value: Option<i32>,
    pub reduction_rate: Option<f64>,
    pub polygon_limit: Option<usize>,
    pub object_size_ratio: Option<f64>,
    pub center_origin: bool,
    pub smoothing: bool,
    pub crop: CropMode,
    pub series_index: Option<usize>,
}

impl Default for MeshParameters {
    fn default() -> Self {
        Self {
            input_path: None,
            input_image_files: None,
            xyz_spacing: [1.0, 1.0, 1.0],
            output_path: None,
            binary_export: false,
            iso_value: 400,
            upper_iso_value: None,
            reduction_rate: None,
            polygon_limit: None,
            object_size_ratio: None,
            center_origin: false,
            smoothing: false,
            crop: CropMode::Off,
            series_index: None,
        }
    }
}

impl MeshParameters {
    pub fn summary(&self) -> String {
        let mut out = String::from("Dicom2Mesh Settings\n-------------------\n");
        out.push_str(&format!(
            "Input directory: {}\n",
            display_or_none(self.input_path.as_deref())
        ));
        out.push_str(&format!(
            "Output file path: {}\n",
            display_or_none(self.output_path.as_deref())
        ));

        out.push_str(&format!("Surface segmentation: {}", self.iso_value));
        if let Some(upper) = self.upper_iso_value {
            out.push_str(&format!(" to {upper}"));
        }
        out.push('\n');

        match self.reduction_rate {
            Some(rate) => out.push_str(&format!("Mesh reduction: enabled (rate={rate})\n")),
            None => out.push_str("Mesh reduction: disabled\n"),
        }
        match self.polygon_limit {
            Some(limit) => out.push_str(&format!("Mesh polygon limitation: enabled (nbr={limit})\n")),
            None => out.push_str("Mesh polygon limitation: disabled\n"),
        }
        out.push_str(&format!(
            "Mesh smoothing: {}\n",
            enabled_or_disabled(self.smoothing)
        ));
        out.push_str(&format!(
            "Mesh centering: {}\n",
            enabled_or_disabled(self.center_origin)
        ));
        match self.object_size_ratio {
            Some(ratio) => out.push_str(&format!("Mesh filtering: enabled (size-ratio={ratio})\n")),
            None => out.push_str("Mesh filtering: disabled\n"),
        }
        out.push_str(&format!(
            "Volume cropping: {}\n",
            enabled_or_disabled(self.crop != CropMode::Off)
        ));
        out
    }
}

fn display_or_none(path: Option<&Path>) -> String {
    path.map_or_else(|| "None".to_string(), |p| p.display().to_string())
}

fn enabled_or_disabled(on: bool) -> &'static str {
    if on {
        "enabled"
    } else {
        "disabled"
    }
}

/// Runs one full conversion. Fails without writing any output when no
/// surface can be extracted from the input.
pub fn run(params: &MeshParameters) -> Result<()> {
    let started = Instant::now();
    println!();
    println!("{}", params.summary());

    let progress: Arc<TerminalProgress> = Arc::new(TerminalProgress);
    let mut mesh = load_input(params, progress.clone())?;
    if mesh.is_empty() {
        bail!("no mesh could be created, wrong input data or wrong iso value");
    }

    post_process(&mut mesh, params, progress.as_ref());

    if let Some(output) = &params.output_path {
        mesh_io::export_mesh(&mesh, output, params.binary_export)
            .with_context(|| format!("failed to export mesh to {}", output.display()))?;
        write_info_sidecar(params, output)?;
    }

    println!();
    println!(
        "Required computing time: {} seconds",
        started.elapsed().as_secs()
    );
    Ok(())
}

fn load_input(params: &MeshParameters, progress: Arc<TerminalProgress>) -> Result<Mesh> {
    // an existing mesh file is modified and re-exported directly
    if params.input_image_files.is_none() {
        if let Some(input) = &params.input_path {
            if mesh_io::is_mesh_file(input) {
                return Ok(mesh_io::import_mesh(input)?);
            }
        }
    }

    let routines = build_routines(params, progress);
    let mut volume = if let Some(files) = &params.input_image_files {
        routines.load_png_images(
            files,
            params.xyz_spacing[0],
            params.xyz_spacing[1],
            params.xyz_spacing[2],
        )?
    } else if let Some(input) = &params.input_path {
        routines.load_dicom_image(input)?
    } else {
        bail!("no input data given");
    };

    match params.crop {
        CropMode::Off => {}
        CropMode::Interactive => routines.crop(&mut volume, &PromptRangeSelector)?,
        CropMode::Range { start, end } => {
            routines.crop(&mut volume, &FixedRangeSelector(start, end))?;
        }
    }

    Ok(routines.image_to_mesh(&volume, params.iso_value, params.upper_iso_value)?)
}

fn build_routines(params: &MeshParameters, progress: Arc<TerminalProgress>) -> DicomRoutines {
    let routines = DicomRoutines::new().with_progress(progress);
    match params.series_index {
        Some(index) => routines.with_series_selector(Box::new(FixedSeriesSelector(index))),
        None => routines.with_series_selector(Box::new(PromptSeriesSelector)),
    }
}

fn post_process(mesh: &mut Mesh, params: &MeshParameters, progress: &dyn ProgressSink) {
    if params.center_origin {
        let t = mesh_filter::move_to_origin(mesh);
        println!(
            "Move mesh to the coordinate system's center: Translation [{}, {}, {}]",
            t.x, t.y, t.z
        );
    }

    if let Some(rate) = params.reduction_rate {
        if (0.0..=1.0).contains(&rate) {
            mesh_filter::reduce(mesh, rate, Some(progress));
        } else {
            println!(
                "Reduction skipped due to invalid reduction rate {rate} where a value of 0.0 - 1.0 is expected"
            );
        }
    }

    if let Some(limit) = params.polygon_limit {
        if mesh.num_triangles() > limit {
            let rate = 1.0 - limit as f64 / mesh.num_triangles() as f64;
            mesh_filter::reduce(mesh, rate, Some(progress));
        } else {
            println!("Reducing polygons not necessary.");
        }
    }

    if let Some(ratio) = params.object_size_ratio {
        if (0.0..=1.0).contains(&ratio) {
            mesh_filter::remove_small_fragments(mesh, ratio);
        } else {
            println!(
                "Filtering skipped due to invalid filter rate {ratio} where a value of 0.0 - 1.0 is expected"
            );
        }
    }

    if params.smoothing {
        mesh_filter::smooth(mesh, mesh_filter::DEFAULT_SMOOTHING_ITERATIONS, Some(progress));
    }
}

#[derive(Serialize)]
struct InfoSidecar<'a> {
    created: String,
    parameters: &'a MeshParameters,
}

/// Records the parameters of a run next to the exported mesh.
fn write_info_sidecar(params: &MeshParameters, output: &Path) -> Result<()> {
    let info_path = output.with_extension("info");
    let info = InfoSidecar {
        created: chrono::Local::now().to_rfc3339(),
        parameters: params,
    };
    std::fs::write(&info_path, serde_json::to_string_pretty(&info)?)?;
    println!("Parameters written to file: {}", info_path.display());
    Ok(())
}
