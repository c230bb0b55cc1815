//
// convert_workflows.rs
// dicom2mesh
//
// Integration tests covering PNG stack loading, DICOM series loading
// and disambiguation, isosurface extraction, the post-processing
// stages and the export/import matrix.
//

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use image::{ImageBuffer, Luma};
use tempfile::{tempdir, TempDir};

use dicom2mesh::choice::FixedSeriesSelector;
use dicom2mesh::mesh_io;
use dicom2mesh::pipeline::{self, CropMode, MeshParameters};
use dicom2mesh::progress::RecordingProgress;
use dicom2mesh::{DicomRoutines, RoutineError};

const SLICE_SIZE: u32 = 24;

/// Writes 16-bit grayscale slices holding a filled circle whose radius
/// follows a sine bump across the stack, so the stack contains one
/// closed ellipsoid of intensity 200 on a zero background.
fn write_png_stack(dir: &Path, count: usize) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for i in 0..count {
        let relative = (i as f32) / (count.saturating_sub(1).max(1) as f32);
        let radius = (std::f32::consts::PI * relative).sin() * SLICE_SIZE as f32 / 4.0;
        let center = SLICE_SIZE as f32 / 2.0;
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(SLICE_SIZE, SLICE_SIZE, |x, y| {
                let dx = x as f32 - center;
                let dy = y as f32 - center;
                if (dx * dx + dy * dy).sqrt() < radius {
                    Luma([200])
                } else {
                    Luma([0])
                }
            });
        let path = dir.join(format!("slice_{i:03}.png"));
        img.save(&path).expect("write png slice");
        paths.push(path);
    }
    paths
}

fn preset_image_parameters(dir: &Path) -> MeshParameters {
    MeshParameters {
        input_image_files: Some(write_png_stack(dir, 8)),
        iso_value: 100,
        ..MeshParameters::default()
    }
}

fn write_dicom_slice(
    dir: &Path,
    file_name: &str,
    series_uid: &str,
    description: &str,
    instance: u16,
    z_position: f64,
    brightness: u8,
) -> PathBuf {
    let path = dir.join(file_name);
    let sop_instance_uid = format!("1.2.826.0.1.3680043.2.1125.{series_uid}.{instance}");

    let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    obj.put(DataElement::new(
        Tag(0x0008, 0x0016),
        VR::UI,
        PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7"),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0018),
        VR::UI,
        PrimitiveValue::from(sop_instance_uid.as_str()),
    ));
    obj.put(DataElement::new(
        Tag(0x0020, 0x000E),
        VR::UI,
        PrimitiveValue::from(format!("1.2.826.0.1.3680043.2.1125.{series_uid}")),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x103E),
        VR::LO,
        PrimitiveValue::from(description),
    ));
    obj.put(DataElement::new(
        Tag(0x0020, 0x0013),
        VR::IS,
        PrimitiveValue::from(format!("{instance}")),
    ));
    obj.put(DataElement::new(
        Tag(0x0020, 0x0032),
        VR::DS,
        PrimitiveValue::from(format!("0\\0\\{z_position}")),
    ));
    obj.put(DataElement::new(
        Tag(0x0028, 0x0030),
        VR::DS,
        PrimitiveValue::from("0.5\\0.5"),
    ));
    obj.put(DataElement::new(
        Tag(0x0018, 0x0050),
        VR::DS,
        PrimitiveValue::from("2.5"),
    ));
    obj.put(DataElement::new(
        Tag(0x0028, 0x0010),
        VR::US,
        PrimitiveValue::from(16_u16),
    )); // Rows
    obj.put(DataElement::new(
        Tag(0x0028, 0x0011),
        VR::US,
        PrimitiveValue::from(16_u16),
    )); // Columns
    obj.put(DataElement::new(
        Tag(0x0028, 0x0002),
        VR::US,
        PrimitiveValue::from(1_u16),
    )); // Samples per pixel
    obj.put(DataElement::new(
        Tag(0x0028, 0x0100),
        VR::US,
        PrimitiveValue::from(8_u16),
    )); // Bits Allocated
    obj.put(DataElement::new(
        Tag(0x0028, 0x0101),
        VR::US,
        PrimitiveValue::from(8_u16),
    )); // Bits Stored
    obj.put(DataElement::new(
        Tag(0x0028, 0x0102),
        VR::US,
        PrimitiveValue::from(7_u16),
    )); // High Bit
    obj.put(DataElement::new(
        Tag(0x0028, 0x0103),
        VR::US,
        PrimitiveValue::from(0_u16),
    )); // Pixel Representation
    obj.put(DataElement::new(
        Tag(0x0028, 0x0004),
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));
    obj.put(DataElement::new(
        Tag(0x0028, 0x0008),
        VR::IS,
        PrimitiveValue::from("1"),
    )); // Number of Frames

    // 16x16 frame with a centered 8x8 bright square
    let mut pixels = vec![0u8; 16 * 16];
    for y in 4..12 {
        for x in 4..12 {
            pixels[y * 16 + x] = brightness;
        }
    }
    obj.put(DataElement::new(
        Tag(0x7FE0, 0x0010),
        VR::OB,
        PrimitiveValue::from(pixels),
    ));

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
        .media_storage_sop_instance_uid(sop_instance_uid)
        .build()
        .expect("meta");

    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file_obj.put(elem);
    }
    file_obj.write_to_file(&path).expect("write test dicom");
    path
}

fn build_test_series(brightnesses: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempdir().expect("tempdir");
    for (i, &brightness) in brightnesses.iter().enumerate() {
        write_dicom_slice(
            dir.path(),
            &format!("slice_{i:03}.dcm"),
            "1",
            "CT Bone",
            i as u16,
            2.5 * i as f64,
            brightness,
        );
    }
    let path = dir.path().to_path_buf();
    (dir, path)
}

#[test]
fn png_stack_becomes_a_volume_with_matching_metadata() {
    let dir = tempdir().expect("tempdir");
    let paths = write_png_stack(dir.path(), 10);

    let routines = DicomRoutines::new();
    let volume = routines
        .load_png_images(&paths, 1.0, 1.0, 2.0)
        .expect("load png stack");

    assert_eq!(
        volume.dimensions(),
        (SLICE_SIZE as usize, SLICE_SIZE as usize, 10)
    );
    assert_eq!(volume.spacing(), [1.0, 1.0, 2.0]);
    assert_eq!(volume.origin(), [0.0, 0.0, 0.0]);
    assert!(volume.has_data());
}

#[test]
fn mixed_size_png_stack_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let mut paths = write_png_stack(dir.path(), 3);

    let odd: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::new(SLICE_SIZE * 2, SLICE_SIZE);
    let odd_path = dir.path().join("odd.png");
    odd.save(&odd_path).expect("write odd png");
    paths.push(odd_path);

    let routines = DicomRoutines::new();
    let err = routines.load_png_images(&paths, 1.0, 1.0, 1.0).unwrap_err();
    assert!(matches!(err, RoutineError::InconsistentSlices { .. }));
}

#[test]
fn missing_png_path_is_rejected() {
    let routines = DicomRoutines::new();
    let paths = vec![PathBuf::from("does_not_exist.png")];
    let err = routines.load_png_images(&paths, 1.0, 1.0, 1.0).unwrap_err();
    assert!(matches!(err, RoutineError::InvalidPath(_)));
}

#[test]
fn png_loading_reports_progress() {
    let dir = tempdir().expect("tempdir");
    let paths = write_png_stack(dir.path(), 4);

    let sink = Arc::new(RecordingProgress::default());
    let routines = DicomRoutines::new().with_progress(sink.clone());
    routines
        .load_png_images(&paths, 1.0, 1.0, 1.0)
        .expect("load");

    let reports = sink.reports();
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|&f| (0.0..=1.0).contains(&f)));
}

#[test]
fn upper_iso_value_carves_a_band() {
    let dir = tempdir().expect("tempdir");
    let paths = write_png_stack(dir.path(), 8);
    let routines = DicomRoutines::new();
    let volume = routines
        .load_png_images(&paths, 1.0, 1.0, 1.0)
        .expect("load");

    let plain = routines.image_to_mesh(&volume, 100, None).expect("mesh");
    let plain_again = routines.image_to_mesh(&volume, 100, None).expect("mesh");
    assert!(!plain.is_empty());
    assert_eq!(plain.num_vertices(), plain_again.num_vertices());
    assert_eq!(plain.num_triangles(), plain_again.num_triangles());

    // an upper bound above every intensity masks nothing
    let wide_band = routines
        .image_to_mesh(&volume, 100, Some(300))
        .expect("mesh");
    assert_eq!(wide_band.num_triangles(), plain.num_triangles());

    // an upper bound below the iso value leaves an empty band
    let empty_band = routines
        .image_to_mesh(&volume, 100, Some(50))
        .expect("mesh");
    assert!(empty_band.is_empty());

    // the object intensity is 200, so an upper bound of 150 masks it away
    let masked = routines
        .image_to_mesh(&volume, 100, Some(150))
        .expect("mesh");
    assert!(masked.is_empty());
}

#[test]
fn pipeline_exports_every_format() {
    for file_name in ["mesh.obj", "mesh.ply", "mesh.stl"] {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join(file_name);
        let params = MeshParameters {
            output_path: Some(output.clone()),
            ..preset_image_parameters(dir.path())
        };

        pipeline::run(&params).expect("pipeline run");

        let metadata = fs::metadata(&output).expect("output exists");
        assert!(metadata.len() > 0);

        // the parameter sidecar lands next to the mesh
        let info = fs::read_to_string(output.with_extension("info")).expect("info sidecar");
        assert!(info.contains("\"iso_value\": 100"));
    }
}

#[test]
fn pipeline_reimports_every_format() {
    for file_name in ["mesh.obj", "mesh.ply", "mesh.stl"] {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join(file_name);
        let params = MeshParameters {
            output_path: Some(output.clone()),
            ..preset_image_parameters(dir.path())
        };
        pipeline::run(&params).expect("create mesh file");

        // reload the exported mesh and save it again as obj
        let reexport = dir.path().join("reexport.obj");
        let import_params = MeshParameters {
            input_path: Some(output),
            output_path: Some(reexport.clone()),
            ..MeshParameters::default()
        };
        pipeline::run(&import_params).expect("reimport run");
        assert!(fs::metadata(&reexport).expect("reexport exists").len() > 0);
    }
}

#[test]
fn too_high_iso_value_fails_without_writing_output() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("mesh.obj");
    let params = MeshParameters {
        output_path: Some(output.clone()),
        iso_value: 400, // the test object has intensity 200
        ..preset_image_parameters(dir.path())
    };

    let err = pipeline::run(&params).unwrap_err();
    assert!(err.to_string().contains("no mesh could be created"));
    assert!(!output.exists());
}

#[test]
fn centered_export_has_its_centroid_at_the_origin() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("centered.obj");
    let params = MeshParameters {
        output_path: Some(output.clone()),
        center_origin: true,
        ..preset_image_parameters(dir.path())
    };

    pipeline::run(&params).expect("pipeline run");

    let mesh = mesh_io::import_mesh(&output).expect("import");
    assert!(mesh.centroid().length() < 0.1);
}

#[test]
fn smoothed_export_succeeds() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("smooth.ply");
    let params = MeshParameters {
        output_path: Some(output.clone()),
        smoothing: true,
        ..preset_image_parameters(dir.path())
    };

    pipeline::run(&params).expect("pipeline run");
    let mesh = mesh_io::import_mesh(&output).expect("import");
    assert!(!mesh.is_empty());
}

#[test]
fn stronger_reduction_exports_fewer_faces() {
    let mut last_count = usize::MAX;
    for rate in [0.2, 0.5, 0.8] {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("reduced.obj");
        let params = MeshParameters {
            output_path: Some(output.clone()),
            reduction_rate: Some(rate),
            ..preset_image_parameters(dir.path())
        };

        pipeline::run(&params).expect("pipeline run");

        let mesh = mesh_io::import_mesh(&output).expect("import");
        assert!(mesh.num_triangles() < last_count);
        last_count = mesh.num_triangles();
    }
}

#[test]
fn cropped_pipeline_still_produces_a_mesh() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("cropped.stl");
    let params = MeshParameters {
        output_path: Some(output.clone()),
        crop: CropMode::Range { start: 1, end: 6 },
        ..preset_image_parameters(dir.path())
    };

    pipeline::run(&params).expect("pipeline run");
    assert!(fs::metadata(&output).expect("output exists").len() > 0);
}

#[test]
fn dicom_series_loads_sorted_with_header_metadata() {
    let dir = tempdir().expect("tempdir");
    // file names ordered against the stacking axis on purpose
    write_dicom_slice(dir.path(), "a.dcm", "1", "CT Bone", 2, 5.0, 30);
    write_dicom_slice(dir.path(), "b.dcm", "1", "CT Bone", 1, 2.5, 20);
    write_dicom_slice(dir.path(), "c.dcm", "1", "CT Bone", 0, 0.0, 10);

    let routines = DicomRoutines::new();
    let volume = routines.load_dicom_image(dir.path()).expect("load dicom");

    assert_eq!(volume.dimensions(), (16, 16, 3));
    assert_eq!(volume.spacing(), [0.5, 0.5, 2.5]);
    assert_eq!(volume.origin(), [0.0, 0.0, 0.0]);
    // slices are ordered by position, not by file name
    assert_eq!(volume.value(8, 8, 0), 10.0);
    assert_eq!(volume.value(8, 8, 1), 20.0);
    assert_eq!(volume.value(8, 8, 2), 30.0);
}

#[test]
fn dicom_volume_meshes_end_to_end() {
    let (_dir, path) = build_test_series(&[0, 200, 200, 200, 0]);

    let routines = DicomRoutines::new();
    let volume = routines.load_dicom_image(&path).expect("load dicom");
    let mesh = routines.image_to_mesh(&volume, 100, None).expect("mesh");

    assert!(!mesh.is_empty());
    for t in &mesh.triangles {
        for &i in t {
            assert!((i as usize) < mesh.num_vertices());
        }
    }
}

#[test]
fn multiple_series_need_a_selection() {
    let dir = tempdir().expect("tempdir");
    write_dicom_slice(dir.path(), "s1_0.dcm", "1", "CT Bone", 0, 0.0, 100);
    write_dicom_slice(dir.path(), "s1_1.dcm", "1", "CT Bone", 1, 2.5, 100);
    write_dicom_slice(dir.path(), "s1_2.dcm", "1", "CT Bone", 2, 5.0, 100);
    write_dicom_slice(dir.path(), "s2_0.dcm", "2", "Scout", 0, 0.0, 50);
    write_dicom_slice(dir.path(), "s2_1.dcm", "2", "Scout", 1, 2.5, 50);

    // the headless default refuses to guess
    let routines = DicomRoutines::new();
    let err = routines.load_dicom_image(dir.path()).unwrap_err();
    assert!(matches!(err, RoutineError::AmbiguousSeries { count: 2 }));

    // a fixed selector picks the second series
    let routines =
        DicomRoutines::new().with_series_selector(Box::new(FixedSeriesSelector(1)));
    let volume = routines.load_dicom_image(dir.path()).expect("load dicom");
    assert_eq!(volume.dimensions(), (16, 16, 2));
    assert_eq!(volume.value(8, 8, 0), 50.0);

    // an out-of-range selection is rejected
    let routines =
        DicomRoutines::new().with_series_selector(Box::new(FixedSeriesSelector(7)));
    let err = routines.load_dicom_image(dir.path()).unwrap_err();
    assert!(matches!(
        err,
        RoutineError::SeriesOutOfRange { index: 7, count: 2 }
    ));
}

#[test]
fn directory_without_dicom_data_fails() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("notes.txt"), "not a dicom file").expect("write");

    let routines = DicomRoutines::new();
    let err = routines.load_dicom_image(dir.path()).unwrap_err();
    assert!(matches!(err, RoutineError::NoDicomData(_)));
}

#[test]
fn missing_directory_fails() {
    let routines = DicomRoutines::new();
    let err = routines
        .load_dicom_image(Path::new("no_such_directory"))
        .unwrap_err();
    assert!(matches!(err, RoutineError::InvalidPath(_)));
}
