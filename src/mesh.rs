//
// mesh.rs
// dicom2mesh
//
// Indexed triangle surface produced by the isosurface extraction and
// consumed by the filters and exporters.
//

use glam::Vec3;

/// A triangulated surface: vertex positions, per-vertex normals and
/// triangle indices. Filters mutate a mesh in place; there is no
/// internal sharing.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Unweighted centroid of the vertex positions, the reference point
    /// used when moving a mesh onto the coordinate origin.
    pub fn centroid(&self) -> Vec3 {
        if self.vertices.is_empty() {
            return Vec3::ZERO;
        }
        let sum: Vec3 = self.vertices.iter().copied().sum();
        sum / self.vertices.len() as f32
    }

    pub fn translate(&mut self, offset: Vec3) {
        for v in &mut self.vertices {
            *v += offset;
        }
    }

    /// Recomputes per-vertex normals by accumulating the geometric
    /// normal of every incident face, then normalizing.
    pub fn recompute_vertex_normals(&mut self) {
        self.normals = vec![Vec3::ZERO; self.vertices.len()];
        for t in &self.triangles {
            let a = self.vertices[t[0] as usize];
            let b = self.vertices[t[1] as usize];
            let c = self.vertices[t[2] as usize];
            let n = (b - a).cross(c - a);
            self.normals[t[0] as usize] += n;
            self.normals[t[1] as usize] += n;
            self.normals[t[2] as usize] += n;
        }
        for n in &mut self.normals {
            let len = n.length();
            if len > 1e-10 {
                *n /= len;
            }
        }
    }

    /// Face-normal-per-vertex computation: every face writes its own
    /// normal to all three corners, the last writer wins. Matches the
    /// flat shading the OBJ exporter has always produced.
    pub fn trivial_vertex_normals(&self) -> Vec<Vec3> {
        let mut normals = vec![Vec3::X; self.vertices.len()];
        for t in &self.triangles {
            let v0 = self.vertices[t[0] as usize];
            let v1 = self.vertices[t[1] as usize];
            let v2 = self.vertices[t[2] as usize];
            let fn_ = (v0 - v1).cross(v0 - v2).normalize_or_zero();
            normals[t[0] as usize] = fn_;
            normals[t[1] as usize] = fn_;
            normals[t[2] as usize] = fn_;
        }
        normals
    }
}
