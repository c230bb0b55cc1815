//
// mesh_io.rs
// dicom2mesh
//
// Mesh file import and export: STL (ASCII and binary), OBJ and PLY,
// dispatched by file extension.
//

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use glam::Vec3;
use thiserror::Error;

use crate::mesh::Mesh;

#[derive(Debug, Error)]
pub enum MeshIoError {
    #[error("unsupported mesh format: {0:?}")]
    UnsupportedFormat(String),

    #[error("malformed {format} data at line {line}: {message}")]
    Parse {
        format: &'static str,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// True when the path's extension names a supported mesh format. The
/// pipeline uses this to tell mesh-file input apart from image input.
pub fn is_mesh_file(path: &Path) -> bool {
    matches!(extension_of(path).as_str(), "obj" | "stl" | "ply")
}

/// Writes `mesh` in the format named by the output extension.
/// `binary_stl` selects the binary STL flavor and is ignored for the
/// other formats.
pub fn export_mesh(mesh: &Mesh, path: &Path, binary_stl: bool) -> Result<(), MeshIoError> {
    match extension_of(path).as_str() {
        "obj" => export_obj(mesh, path),
        "stl" => export_stl(mesh, path, binary_stl),
        "ply" => export_ply(mesh, path),
        other => Err(MeshIoError::UnsupportedFormat(other.to_string())),
    }
}

/// Reads a mesh in the format named by the file extension. Vertex
/// normals are recomputed after import.
pub fn import_mesh(path: &Path) -> Result<Mesh, MeshIoError> {
    let mut mesh = match extension_of(path).as_str() {
        "obj" => import_obj(path),
        "stl" => import_stl(path),
        "ply" => import_ply(path),
        other => Err(MeshIoError::UnsupportedFormat(other.to_string())),
    }?;
    mesh.recompute_vertex_normals();
    Ok(mesh)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub fn export_obj(mesh: &Mesh, path: &Path) -> Result<(), MeshIoError> {
    println!("Mesh export as obj file: {}", path.display());

    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# dicom2mesh obj exporter")?;
    writeln!(out, "g default")?;
    for v in &mesh.vertices {
        writeln!(out, "v {:.4} {:.4} {:.4}", v.x, v.y, v.z)?;
    }
    for n in mesh.trivial_vertex_normals() {
        writeln!(out, "vn {:.4} {:.4} {:.4}", n.x, n.y, n.z)?;
    }
    writeln!(out)?;
    writeln!(out, "g polyDefault")?;
    writeln!(out, "s off")?;
    for t in &mesh.triangles {
        let (a, b, c) = (t[0] + 1, t[1] + 1, t[2] + 1);
        writeln!(out, "f {a}//{a} {b}//{b} {c}//{c}")?;
    }
    out.flush()?;
    Ok(())
}

pub fn import_obj(path: &Path) -> Result<Mesh, MeshIoError> {
    println!("Load obj file {}", path.display());

    let mut mesh = Mesh::default();
    let reader = BufReader::new(File::open(path)?);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("v") => {
                let v = parse_vec3(&mut fields, "obj", line_no + 1)?;
                mesh.vertices.push(v);
            }
            Some("f") => {
                let mut corners = Vec::new();
                for field in fields {
                    let index_text = field.split('/').next().unwrap_or(field);
                    let index: usize = index_text.parse().map_err(|_| MeshIoError::Parse {
                        format: "obj",
                        line: line_no + 1,
                        message: format!("bad face index {index_text:?}"),
                    })?;
                    if index == 0 || index > mesh.vertices.len() {
                        return Err(MeshIoError::Parse {
                            format: "obj",
                            line: line_no + 1,
                            message: format!("face index {index} out of range"),
                        });
                    }
                    corners.push((index - 1) as u32);
                }
                push_fan(&mut mesh, &corners, "obj", line_no + 1)?;
            }
            _ => {} // normals are recomputed, groups and comments skipped
        }
    }
    Ok(mesh)
}

pub fn export_stl(mesh: &Mesh, path: &Path, binary: bool) -> Result<(), MeshIoError> {
    println!("Mesh export as stl file: {}", path.display());
    if binary {
        export_stl_binary(mesh, path)
    } else {
        export_stl_ascii(mesh, path)
    }
}

fn export_stl_ascii(mesh: &Mesh, path: &Path) -> Result<(), MeshIoError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "solid dicom2mesh")?;
    for t in &mesh.triangles {
        let (a, b, c) = triangle_vertices(mesh, t);
        let n = face_normal(a, b, c);
        writeln!(out, "  facet normal {:.6} {:.6} {:.6}", n.x, n.y, n.z)?;
        writeln!(out, "    outer loop")?;
        for v in [a, b, c] {
            writeln!(out, "      vertex {:.6} {:.6} {:.6}", v.x, v.y, v.z)?;
        }
        writeln!(out, "    endloop")?;
        writeln!(out, "  endfacet")?;
    }
    writeln!(out, "endsolid dicom2mesh")?;
    out.flush()?;
    Ok(())
}

fn export_stl_binary(mesh: &Mesh, path: &Path) -> Result<(), MeshIoError> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut header = [0u8; 80];
    let tag = b"dicom2mesh binary stl";
    header[..tag.len()].copy_from_slice(tag);
    out.write_all(&header)?;
    out.write_all(&(mesh.num_triangles() as u32).to_le_bytes())?;
    for t in &mesh.triangles {
        let (a, b, c) = triangle_vertices(mesh, t);
        let n = face_normal(a, b, c);
        for v in [n, a, b, c] {
            out.write_all(&v.x.to_le_bytes())?;
            out.write_all(&v.y.to_le_bytes())?;
            out.write_all(&v.z.to_le_bytes())?;
        }
        out.write_all(&0u16.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

pub fn import_stl(path: &Path) -> Result<Mesh, MeshIoError> {
    println!("Load stl file {}", path.display());

    let bytes = fs::read(path)?;
    // binary STL: 80-byte header, u32 facet count, 50 bytes per facet
    if bytes.len() >= 84 {
        let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
        if bytes.len() == 84 + count * 50 {
            return import_stl_binary(&bytes[84..], count);
        }
    }
    import_stl_ascii(&bytes)
}

fn import_stl_binary(body: &[u8], count: usize) -> Result<Mesh, MeshIoError> {
    let mut welder = VertexWelder::default();
    for facet in 0..count {
        let base = facet * 50 + 12; // skip the facet normal
        let mut corners = [0u32; 3];
        for (i, corner) in corners.iter_mut().enumerate() {
            let offset = base + i * 12;
            let v = Vec3::new(
                f32::from_le_bytes(body[offset..offset + 4].try_into().unwrap()),
                f32::from_le_bytes(body[offset + 4..offset + 8].try_into().unwrap()),
                f32::from_le_bytes(body[offset + 8..offset + 12].try_into().unwrap()),
            );
            *corner = welder.index_of(v);
        }
        welder.mesh.triangles.push(corners);
    }
    Ok(welder.mesh)
}

fn import_stl_ascii(bytes: &[u8]) -> Result<Mesh, MeshIoError> {
    let text = String::from_utf8_lossy(bytes);
    let mut welder = VertexWelder::default();
    let mut corners: Vec<u32> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("vertex") {
            let v = parse_vec3(&mut fields, "stl", line_no + 1)?;
            corners.push(welder.index_of(v));
            if corners.len() == 3 {
                welder
                    .mesh
                    .triangles
                    .push([corners[0], corners[1], corners[2]]);
                corners.clear();
            }
        }
    }
    if !corners.is_empty() {
        return Err(MeshIoError::Parse {
            format: "stl",
            line: 0,
            message: "dangling vertices at end of file".to_string(),
        });
    }
    Ok(welder.mesh)
}

pub fn export_ply(mesh: &Mesh, path: &Path) -> Result<(), MeshIoError> {
    println!("Mesh export as ply file: {}", path.display());

    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "comment dicom2mesh ply exporter")?;
    writeln!(out, "element vertex {}", mesh.num_vertices())?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    writeln!(out, "element face {}", mesh.num_triangles())?;
    writeln!(out, "property list uchar int vertex_indices")?;
    writeln!(out, "end_header")?;
    for v in &mesh.vertices {
        writeln!(out, "{:.6} {:.6} {:.6}", v.x, v.y, v.z)?;
    }
    for t in &mesh.triangles {
        writeln!(out, "3 {} {} {}", t[0], t[1], t[2])?;
    }
    out.flush()?;
    Ok(())
}

pub fn import_ply(path: &Path) -> Result<Mesh, MeshIoError> {
    println!("Load ply file {}", path.display());

    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines().enumerate();

    let mut num_vertices = 0usize;
    let mut num_faces = 0usize;
    let mut ascii = false;
    loop {
        let (line_no, line) = lines.next().ok_or_else(|| MeshIoError::Parse {
            format: "ply",
            line: 0,
            message: "missing end_header".to_string(),
        })?;
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["format", kind, ..] => ascii = *kind == "ascii",
            ["element", "vertex", n] => num_vertices = parse_count(n, line_no + 1)?,
            ["element", "face", n] => num_faces = parse_count(n, line_no + 1)?,
            ["end_header"] => break,
            _ => {}
        }
    }
    if !ascii {
        return Err(MeshIoError::Parse {
            format: "ply",
            line: 0,
            message: "only ascii ply files are supported".to_string(),
        });
    }

    let mut mesh = Mesh::default();
    for _ in 0..num_vertices {
        let (line_no, line) = lines.next().ok_or_else(|| MeshIoError::Parse {
            format: "ply",
            line: 0,
            message: "truncated vertex list".to_string(),
        })?;
        let line = line?;
        let mut fields = line.split_whitespace();
        mesh.vertices.push(parse_vec3(&mut fields, "ply", line_no + 1)?);
    }
    for _ in 0..num_faces {
        let (line_no, line) = lines.next().ok_or_else(|| MeshIoError::Parse {
            format: "ply",
            line: 0,
            message: "truncated face list".to_string(),
        })?;
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        let count = parse_count(fields.first().copied().unwrap_or(""), line_no + 1)?;
        if fields.len() != count + 1 {
            return Err(MeshIoError::Parse {
                format: "ply",
                line: line_no + 1,
                message: "face index count mismatch".to_string(),
            });
        }
        let mut corners = Vec::with_capacity(count);
        for field in &fields[1..] {
            let index = parse_count(field, line_no + 1)?;
            if index >= mesh.vertices.len() {
                return Err(MeshIoError::Parse {
                    format: "ply",
                    line: line_no + 1,
                    message: format!("face index {index} out of range"),
                });
            }
            corners.push(index as u32);
        }
        push_fan(&mut mesh, &corners, "ply", line_no + 1)?;
    }
    Ok(mesh)
}

fn triangle_vertices(mesh: &Mesh, t: &[u32; 3]) -> (Vec3, Vec3, Vec3) {
    (
        mesh.vertices[t[0] as usize],
        mesh.vertices[t[1] as usize],
        mesh.vertices[t[2] as usize],
    )
}

fn face_normal(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    (b - a).cross(c - a).normalize_or_zero()
}

fn parse_vec3<'a, I: Iterator<Item = &'a str>>(
    fields: &mut I,
    format: &'static str,
    line: usize,
) -> Result<Vec3, MeshIoError> {
    let mut values = [0.0f32; 3];
    for value in &mut values {
        let field = fields.next().ok_or(MeshIoError::Parse {
            format,
            line,
            message: "expected three coordinates".to_string(),
        })?;
        *value = field.parse().map_err(|_| MeshIoError::Parse {
            format,
            line,
            message: format!("bad coordinate {field:?}"),
        })?;
    }
    Ok(Vec3::from_array(values))
}

fn parse_count(field: &str, line: usize) -> Result<usize, MeshIoError> {
    field.parse().map_err(|_| MeshIoError::Parse {
        format: "ply",
        line,
        message: format!("bad count {field:?}"),
    })
}

/// Triangulates a polygon as a fan around its first corner.
fn push_fan(
    mesh: &mut Mesh,
    corners: &[u32],
    format: &'static str,
    line: usize,
) -> Result<(), MeshIoError> {
    if corners.len() < 3 {
        return Err(MeshIoError::Parse {
            format,
            line,
            message: format!("face with {} corners", corners.len()),
        });
    }
    for i in 1..corners.len() - 1 {
        mesh.triangles
            .push([corners[0], corners[i], corners[i + 1]]);
    }
    Ok(())
}

/// Merges exactly-equal vertex positions so imported triangle soups
/// (STL stores three loose corners per facet) share topology again.
#[derive(Default)]
struct VertexWelder {
    mesh: Mesh,
    seen: std::collections::HashMap<[u32; 3], u32>,
}

impl VertexWelder {
    fn index_of(&mut self, v: Vec3) -> u32 {
        let key = [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()];
        *self.seen.entry(key).or_insert_with(|| {
            let index = self.mesh.vertices.len() as u32;
            self.mesh.vertices.push(v);
            index
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cube_corner_mesh() -> Mesh {
        // two triangles sharing an edge
        let mut mesh = Mesh {
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
            ],
            normals: vec![],
            triangles: vec![[0, 1, 2], [0, 2, 3]],
        };
        mesh.recompute_vertex_normals();
        mesh
    }

    #[test]
    fn obj_round_trip_preserves_counts() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mesh.obj");
        let mesh = cube_corner_mesh();

        export_mesh(&mesh, &path, false).expect("export");
        let restored = import_mesh(&path).expect("import");

        assert_eq!(restored.num_vertices(), mesh.num_vertices());
        assert_eq!(restored.num_triangles(), mesh.num_triangles());
    }

    #[test]
    fn ply_round_trip_preserves_positions() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mesh.ply");
        let mesh = cube_corner_mesh();

        export_mesh(&mesh, &path, false).expect("export");
        let restored = import_mesh(&path).expect("import");

        assert_eq!(restored.num_vertices(), mesh.num_vertices());
        for (a, b) in mesh.vertices.iter().zip(&restored.vertices) {
            assert!((*a - *b).length() < 1e-4);
        }
    }

    #[test]
    fn stl_ascii_and_binary_import_to_the_same_mesh() {
        let dir = tempdir().expect("tempdir");
        let ascii = dir.path().join("ascii.stl");
        let binary = dir.path().join("binary.stl");
        let mesh = cube_corner_mesh();

        export_stl(&mesh, &ascii, false).expect("ascii export");
        export_stl(&mesh, &binary, true).expect("binary export");

        let from_ascii = import_mesh(&ascii).expect("ascii import");
        let from_binary = import_mesh(&binary).expect("binary import");

        // welding restores the shared-edge topology in both flavors
        assert_eq!(from_ascii.num_vertices(), mesh.num_vertices());
        assert_eq!(from_binary.num_vertices(), mesh.num_vertices());
        assert_eq!(from_ascii.num_triangles(), 2);
        assert_eq!(from_binary.num_triangles(), 2);
    }

    #[test]
    fn binary_stl_has_the_expected_layout() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("binary.stl");
        let mesh = cube_corner_mesh();
        export_stl(&mesh, &path, true).expect("export");
        let size = fs::metadata(&path).expect("metadata").len();
        assert_eq!(size, 84 + 50 * mesh.num_triangles() as u64);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let mesh = cube_corner_mesh();
        let err = export_mesh(&mesh, Path::new("mesh.step"), false).unwrap_err();
        assert!(matches!(err, MeshIoError::UnsupportedFormat(_)));
    }

    #[test]
    fn is_mesh_file_matches_supported_extensions() {
        assert!(is_mesh_file(Path::new("a.obj")));
        assert!(is_mesh_file(Path::new("a.STL")));
        assert!(is_mesh_file(Path::new("a.ply")));
        assert!(!is_mesh_file(Path::new("a.png")));
        assert!(!is_mesh_file(Path::new("dicomdir")));
    }
}
