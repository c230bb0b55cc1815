//
// mesh_filter.rs
// dicom2mesh
//
// In-place mesh post-processing: translation to the coordinate origin,
// polygon reduction by quadric error metrics, removal of small
// disconnected fragments and Laplacian smoothing.
//

use std::cmp::Ordering;
use std::collections::HashSet;

use glam::{DVec3, Vec3};
use rayon::prelude::*;

use crate::mesh::Mesh;
use crate::progress::ProgressSink;

const SMOOTHING_RELAXATION: f32 = 0.05;
pub const DEFAULT_SMOOTHING_ITERATIONS: u32 = 20;

const MAX_REDUCTION_PASSES: usize = 64;

/// Translates the mesh so its vertex centroid lands on the coordinate
/// origin. Returns the applied translation.
pub fn move_to_origin(mesh: &mut Mesh) -> Vec3 {
    let translation = -mesh.centroid();
    mesh.translate(translation);
    translation
}

/// Laplacian smoothing: each iteration relaxes every vertex towards
/// the average of its edge neighbors.
pub fn smooth(mesh: &mut Mesh, iterations: u32, progress: Option<&dyn ProgressSink>) {
    if mesh.is_empty() || iterations == 0 {
        return;
    }
    println!("Mesh smoothing with {iterations} iterations.");

    let neighbors = vertex_neighbors(mesh);
    for iteration in 0..iterations {
        let current = &mesh.vertices;
        let relaxed: Vec<Vec3> = current
            .par_iter()
            .enumerate()
            .map(|(i, &position)| {
                let around = &neighbors[i];
                if around.is_empty() {
                    return position;
                }
                let average = around
                    .iter()
                    .map(|&j| current[j as usize])
                    .sum::<Vec3>()
                    / around.len() as f32;
                position + SMOOTHING_RELAXATION * (average - position)
            })
            .collect();
        mesh.vertices = relaxed;
        if let Some(p) = progress {
            p.report(f64::from(iteration + 1) / f64::from(iterations));
        }
    }
    mesh.recompute_vertex_normals();
}

/// Keeps only connected components whose vertex count exceeds
/// `ratio` times the largest component.
pub fn remove_small_fragments(mesh: &mut Mesh, ratio: f64) {
    if mesh.is_empty() {
        return;
    }
    println!("Remove small connected objects: Size ratio = {ratio:.3}");

    let mut components = DisjointSet::new(mesh.num_vertices());
    for t in &mesh.triangles {
        components.union(t[0] as usize, t[1] as usize);
        components.union(t[0] as usize, t[2] as usize);
    }

    let roots: Vec<usize> = (0..mesh.num_vertices())
        .map(|v| components.find(v))
        .collect();
    let mut component_size = vec![0usize; mesh.num_vertices()];
    for &root in &roots {
        component_size[root] += 1;
    }
    let largest = component_size.iter().copied().max().unwrap_or(0);
    let threshold = largest as f64 * ratio;

    let keep: Vec<bool> = roots
        .iter()
        .map(|&root| component_size[root] as f64 > threshold)
        .collect();

    let before = mesh.num_triangles();
    compact_vertices(mesh, &keep);
    mesh.recompute_vertex_normals();
    tracing::info!(
        removed = before - mesh.num_triangles(),
        "small fragments removed"
    );
}

/// Reduces the face count by `reduction` (0.0 - 1.0) using greedy
/// quadric-error edge collapses, applied in passes of independent
/// collapses until the target is reached.
pub fn reduce(mesh: &mut Mesh, reduction: f64, progress: Option<&dyn ProgressSink>) {
    let before = mesh.num_triangles();
    if before == 0 || reduction <= 0.0 {
        return;
    }
    println!("Mesh reduction by {reduction:.3}");

    let target = (((1.0 - reduction) * before as f64).round() as usize).max(4);
    let mut passes = 0;
    while mesh.num_triangles() > target && passes < MAX_REDUCTION_PASSES {
        let collapsed = collapse_pass(mesh, target);
        passes += 1;
        if let Some(p) = progress {
            let removed = (before - mesh.num_triangles()) as f64;
            let goal = (before - target).max(1) as f64;
            p.report((removed / goal).min(1.0));
        }
        if collapsed == 0 {
            break;
        }
    }
    mesh.recompute_vertex_normals();
    println!("Mesh reduced from {before} to {} faces", mesh.num_triangles());
}

fn vertex_neighbors(mesh: &Mesh) -> Vec<Vec<u32>> {
    let mut sets: Vec<HashSet<u32>> = vec![HashSet::new(); mesh.num_vertices()];
    for t in &mesh.triangles {
        for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
            sets[a as usize].insert(b);
            sets[b as usize].insert(a);
        }
    }
    sets.into_iter()
        .map(|set| {
            let mut list: Vec<u32> = set.into_iter().collect();
            list.sort_unstable();
            list
        })
        .collect()
}

/// Drops every vertex whose `keep` flag is false, every triangle
/// touching one, and renumbers the remainder. Normals are left for the
/// caller to recompute.
fn compact_vertices(mesh: &mut Mesh, keep: &[bool]) {
    let mut remap = vec![u32::MAX; keep.len()];
    let mut vertices = Vec::new();
    for (i, (&kept, &position)) in keep.iter().zip(&mesh.vertices).enumerate() {
        if kept {
            remap[i] = vertices.len() as u32;
            vertices.push(position);
        }
    }
    mesh.triangles.retain(|t| t.iter().all(|&i| keep[i as usize]));
    for t in &mut mesh.triangles {
        *t = [
            remap[t[0] as usize],
            remap[t[1] as usize],
            remap[t[2] as usize],
        ];
    }
    mesh.vertices = vertices;
    mesh.normals.clear();
}

fn collapse_pass(mesh: &mut Mesh, target: usize) -> usize {
    let quadrics = vertex_quadrics(mesh);

    let mut edges: HashSet<(u32, u32)> = HashSet::new();
    for t in &mesh.triangles {
        for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
            edges.insert((a.min(b), a.max(b)));
        }
    }

    let mut candidates: Vec<(f64, u32, u32, Vec3)> = edges
        .into_iter()
        .map(|(a, b)| {
            let combined = quadrics[a as usize].plus(&quadrics[b as usize]);
            let position = combined.optimal_point(
                mesh.vertices[a as usize],
                mesh.vertices[b as usize],
            );
            (combined.error(position), a, b, position)
        })
        .collect();
    candidates.sort_by(|l, r| {
        l.0.partial_cmp(&r.0)
            .unwrap_or(Ordering::Equal)
            .then(l.1.cmp(&r.1))
            .then(l.2.cmp(&r.2))
    });

    // a collapse of an interior edge removes two faces
    let excess = mesh.num_triangles() - target;
    let max_collapses = excess.div_ceil(2);

    let mut touched = vec![false; mesh.num_vertices()];
    let mut remap: Vec<u32> = (0..mesh.num_vertices() as u32).collect();
    let mut scheduled = 0;
    for (_, a, b, position) in candidates {
        if scheduled >= max_collapses {
            break;
        }
        if touched[a as usize] || touched[b as usize] {
            continue;
        }
        touched[a as usize] = true;
        touched[b as usize] = true;
        mesh.vertices[a as usize] = position;
        remap[b as usize] = a;
        scheduled += 1;
    }
    if scheduled == 0 {
        return 0;
    }

    let mut used = vec![false; mesh.num_vertices()];
    let mut triangles = Vec::with_capacity(mesh.triangles.len());
    for t in &mesh.triangles {
        let m = [
            remap[t[0] as usize],
            remap[t[1] as usize],
            remap[t[2] as usize],
        ];
        if m[0] == m[1] || m[1] == m[2] || m[2] == m[0] {
            continue;
        }
        for &i in &m {
            used[i as usize] = true;
        }
        triangles.push(m);
    }
    mesh.triangles = triangles;
    compact_vertices(mesh, &used);
    scheduled
}

/// Sum of the squared distances to the planes accumulated into the
/// quadric, stored as the upper triangle of the symmetric 4x4 matrix:
/// (a², ab, ac, ad, b², bc, bd, c², cd, d²).
#[derive(Debug, Clone, Copy, Default)]
struct Quadric {
    m: [f64; 10],
}

impl Quadric {
    fn from_plane(n: DVec3, d: f64) -> Self {
        Quadric {
            m: [
                n.x * n.x,
                n.x * n.y,
                n.x * n.z,
                n.x * d,
                n.y * n.y,
                n.y * n.z,
                n.y * d,
                n.z * n.z,
                n.z * d,
                d * d,
            ],
        }
    }

    fn accumulate(&mut self, other: &Quadric) {
        for (lhs, rhs) in self.m.iter_mut().zip(&other.m) {
            *lhs += rhs;
        }
    }

    fn plus(&self, other: &Quadric) -> Quadric {
        let mut sum = *self;
        sum.accumulate(other);
        sum
    }

    fn error(&self, p: Vec3) -> f64 {
        let (x, y, z) = (f64::from(p.x), f64::from(p.y), f64::from(p.z));
        let m = &self.m;
        m[0] * x * x
            + 2.0 * m[1] * x * y
            + 2.0 * m[2] * x * z
            + 2.0 * m[3] * x
            + m[4] * y * y
            + 2.0 * m[5] * y * z
            + 2.0 * m[6] * y
            + m[7] * z * z
            + 2.0 * m[8] * z
            + m[9]
    }

    /// Position minimizing the quadric error, solved from the 3x3
    /// system; falls back to the best of midpoint and endpoints when
    /// the system is singular.
    fn optimal_point(&self, a: Vec3, b: Vec3) -> Vec3 {
        let midpoint = (a + b) * 0.5;
        let mut best = midpoint;
        let mut best_error = self.error(midpoint);
        for candidate in [a, b] {
            let err = self.error(candidate);
            if err < best_error {
                best = candidate;
                best_error = err;
            }
        }

        let m = &self.m;
        let det = m[0] * (m[4] * m[7] - m[5] * m[5]) - m[1] * (m[1] * m[7] - m[5] * m[2])
            + m[2] * (m[1] * m[5] - m[4] * m[2]);
        if det.abs() > 1e-12 {
            let rhs = DVec3::new(-m[3], -m[6], -m[8]);
            let x = rhs.x * (m[4] * m[7] - m[5] * m[5]) - m[1] * (rhs.y * m[7] - m[5] * rhs.z)
                + m[2] * (rhs.y * m[5] - m[4] * rhs.z);
            let y = m[0] * (rhs.y * m[7] - m[5] * rhs.z) - rhs.x * (m[1] * m[7] - m[5] * m[2])
                + m[2] * (m[1] * rhs.z - rhs.y * m[2]);
            let z = m[0] * (m[4] * rhs.z - rhs.y * m[5]) - m[1] * (m[1] * rhs.z - rhs.y * m[2])
                + rhs.x * (m[1] * m[5] - m[4] * m[2]);
            let solved = Vec3::new(
                (x / det) as f32,
                (y / det) as f32,
                (z / det) as f32,
            );
            if self.error(solved) < best_error {
                best = solved;
            }
        }
        best
    }
}

fn vertex_quadrics(mesh: &Mesh) -> Vec<Quadric> {
    let mut quadrics = vec![Quadric::default(); mesh.num_vertices()];
    for t in &mesh.triangles {
        let a = mesh.vertices[t[0] as usize].as_dvec3();
        let b = mesh.vertices[t[1] as usize].as_dvec3();
        let c = mesh.vertices[t[2] as usize].as_dvec3();
        let n = (b - a).cross(c - a);
        let len = n.length();
        if len < 1e-12 {
            continue;
        }
        let n = n / len;
        let plane = Quadric::from_plane(n, -n.dot(a));
        for &i in t {
            quadrics[i as usize].accumulate(&plane);
        }
    }
    quadrics
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut v: usize) -> usize {
        while self.parent[v] != v {
            self.parent[v] = self.parent[self.parent[v]];
            v = self.parent[v];
        }
        v
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}
