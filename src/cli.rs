//
// cli.rs
// dicom2mesh
//
// Defines the command line surface with Clap and hands the parsed
// parameters to the conversion pipeline.
//

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::pipeline::{self, CropMode, MeshParameters};

#[derive(Parser, Debug)]
#[command(name = "dicom2mesh")]
#[command(version)]
#[command(about = "Converts DICOM volumes or PNG slice stacks into 3D surface meshes", long_about = None)]
pub struct Cli {
    /// Path to a DICOM directory, or to an existing obj/stl/ply mesh file
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Ordered PNG slice paths forming a volume
    #[arg(long = "png-slices", value_delimiter = ',', num_args = 1..)]
    pub png_slices: Option<Vec<PathBuf>>,

    /// Voxel spacing for PNG input
    #[arg(long = "spacing", num_args = 3, value_names = ["X", "Y", "Z"], default_values_t = [1.0, 1.0, 1.0])]
    pub spacing: Vec<f64>,

    /// Output mesh file (obj, stl or ply)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Write STL output in the binary flavor
    #[arg(short = 'b', long = "binary")]
    pub binary: bool,

    /// Iso value for the surface segmentation (the default shows bone)
    #[arg(short = 't', long = "iso-value", default_value_t = 400, allow_hyphen_values = true)]
    pub iso_value: i32,

    /// Upper bound of the segmentation band
    #[arg(long = "upper-iso-value", allow_hyphen_values = true)]
    pub upper_iso_value: Option<i32>,

    /// Polygon reduction rate between 0.0 and 1.0
    #[arg(short = 'r', long = "reduction", num_args = 0..=1, default_missing_value = "0.5")]
    pub reduction: Option<f64>,

    /// Upper bound for the polygon count
    #[arg(short = 'p', long = "polygon-limit", num_args = 0..=1, default_missing_value = "100000")]
    pub polygon_limit: Option<usize>,

    /// Remove connected objects smaller than this vertex ratio of the
    /// largest object
    #[arg(short = 'e', long = "filter-ratio", num_args = 0..=1, default_missing_value = "0.1")]
    pub filter_ratio: Option<f64>,

    /// Move the mesh to the coordinate system's center
    #[arg(short = 'c', long = "center")]
    pub center: bool,

    /// Smooth the mesh
    #[arg(short = 's', long = "smooth")]
    pub smooth: bool,

    /// Ask for a slice range and crop the volume before meshing
    #[arg(short = 'z', long = "crop")]
    pub crop: bool,

    /// Crop to a fixed slice range instead of asking
    #[arg(long = "crop-range", value_name = "START:END", conflicts_with = "crop")]
    pub crop_range: Option<String>,

    /// Load this series index when the directory holds several series
    #[arg(long = "series")]
    pub series: Option<usize>,
}

impl Cli {
    pub fn into_parameters(self) -> Result<MeshParameters> {
        if self.input.is_none() && self.png_slices.is_none() {
            bail!(
                "no input data given\n> dicom2mesh -i pathToDicom\nor\n> dicom2mesh --png-slices path1,path2,..."
            );
        }

        let crop = if let Some(range) = &self.crop_range {
            let (start, end) = parse_crop_range(range)?;
            CropMode::Range { start, end }
        } else if self.crop {
            CropMode::Interactive
        } else {
            CropMode::Off
        };

        Ok(MeshParameters {
            input_path: self.input,
            input_image_files: self.png_slices,
            xyz_spacing: [self.spacing[0], self.spacing[1], self.spacing[2]],
            output_path: self.output,
            binary_export: self.binary,
            iso_value: self.iso_value,
            upper_iso_value: self.upper_iso_value,
            reduction_rate: self.reduction,
            polygon_limit: self.polygon_limit,
            object_size_ratio: self.filter_ratio,
            center_origin: self.center,
            smoothing: self.smooth,
            crop,
            series_index: self.series,
        })
    }
}

fn parse_crop_range(text: &str) -> Result<(usize, usize)> {
    let (start, end) = text
        .split_once(':')
        .context("crop range must look like START:END")?;
    let start = start.trim().parse().context("bad crop range start")?;
    let end = end.trim().parse().context("bad crop range end")?;
    Ok((start, end))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let params = cli.into_parameters()?;
    pipeline::run(&params)
}
