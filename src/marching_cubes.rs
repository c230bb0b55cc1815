//
// marching_cubes.rs
// dicom2mesh
//
// Isosurface extraction: marches the voxel grid of a VolumeImage and
// builds the triangle surface where the intensity crosses the iso
// value. The triangle configuration table is the public-domain
// MarchingCubeCpp data set.
//

use glam::Vec3;

use crate::mesh::Mesh;
use crate::progress::ProgressSink;
use crate::volume::VolumeImage;

/// Extracts the surface where the volume's intensity crosses
/// `iso_value`. Vertices are emitted in world space (voxel spacing and
/// volume origin applied); normals are accumulated from incident faces
/// and normalized. A volume with fewer than two samples along any axis
/// contains no cell to march and produces an empty mesh.
pub fn extract_isosurface(
    volume: &VolumeImage,
    iso_value: f32,
    progress: Option<&dyn ProgressSink>,
) -> Mesh {
    let (nx, ny, nz) = volume.dimensions();
    if nx < 2 || ny < 2 || nz < 2 {
        return Mesh::default();
    }

    let mut grid = CellGrid {
        mesh: Mesh::default(),
        // edge vertex indices per axis for the two active z slabs
        slab: vec![[0u32; 3]; nx * ny * 2],
        nx,
        ny,
        spacing: volume.spacing(),
        origin: volume.origin(),
    };

    let mut corners = [0.0_f32; 8];
    let mut edges = [0u32; 12];

    for z in 0..nz - 1 {
        for y in 0..ny - 1 {
            for x in 0..nx - 1 {
                corners[0] = volume.value(x, y, z) - iso_value;
                corners[1] = volume.value(x + 1, y, z) - iso_value;
                corners[2] = volume.value(x, y + 1, z) - iso_value;
                corners[3] = volume.value(x + 1, y + 1, z) - iso_value;
                corners[4] = volume.value(x, y, z + 1) - iso_value;
                corners[5] = volume.value(x + 1, y, z + 1) - iso_value;
                corners[6] = volume.value(x, y + 1, z + 1) - iso_value;
                corners[7] = volume.value(x + 1, y + 1, z + 1) - iso_value;

                let config = usize::from(corners[0] < 0.0)
                    | usize::from(corners[1] < 0.0) << 1
                    | usize::from(corners[2] < 0.0) << 2
                    | usize::from(corners[3] < 0.0) << 3
                    | usize::from(corners[4] < 0.0) << 4
                    | usize::from(corners[5] < 0.0) << 5
                    | usize::from(corners[6] < 0.0) << 6
                    | usize::from(corners[7] < 0.0) << 7;

                // fully inside or fully outside
                if config == 0 || config == 255 {
                    continue;
                }

                // Each cell computes the edges on its far sides; edges on
                // the near sides were produced by earlier cells, except
                // on the low grid boundary.
                if y == 0 && z == 0 {
                    grid.edge_vertex(corners[0], corners[1], 0, x, y, z);
                }
                if z == 0 {
                    grid.edge_vertex(corners[2], corners[3], 0, x, y + 1, z);
                }
                if y == 0 {
                    grid.edge_vertex(corners[4], corners[5], 0, x, y, z + 1);
                }
                grid.edge_vertex(corners[6], corners[7], 0, x, y + 1, z + 1);

                if x == 0 && z == 0 {
                    grid.edge_vertex(corners[0], corners[2], 1, x, y, z);
                }
                if z == 0 {
                    grid.edge_vertex(corners[1], corners[3], 1, x + 1, y, z);
                }
                if x == 0 {
                    grid.edge_vertex(corners[4], corners[6], 1, x, y, z + 1);
                }
                grid.edge_vertex(corners[5], corners[7], 1, x + 1, y, z + 1);

                if x == 0 && y == 0 {
                    grid.edge_vertex(corners[0], corners[4], 2, x, y, z);
                }
                if y == 0 {
                    grid.edge_vertex(corners[1], corners[5], 2, x + 1, y, z);
                }
                if x == 0 {
                    grid.edge_vertex(corners[2], corners[6], 2, x, y + 1, z);
                }
                grid.edge_vertex(corners[3], corners[7], 2, x + 1, y + 1, z);

                edges[0] = grid.slab_entry(x, y, z)[0];
                edges[1] = grid.slab_entry(x, y + 1, z)[0];
                edges[2] = grid.slab_entry(x, y, z + 1)[0];
                edges[3] = grid.slab_entry(x, y + 1, z + 1)[0];
                edges[4] = grid.slab_entry(x, y, z)[1];
                edges[5] = grid.slab_entry(x + 1, y, z)[1];
                edges[6] = grid.slab_entry(x, y, z + 1)[1];
                edges[7] = grid.slab_entry(x + 1, y, z + 1)[1];
                edges[8] = grid.slab_entry(x, y, z)[2];
                edges[9] = grid.slab_entry(x + 1, y, z)[2];
                edges[10] = grid.slab_entry(x, y + 1, z)[2];
                edges[11] = grid.slab_entry(x + 1, y + 1, z)[2];

                grid.emit_triangles(TRI_CONFIGS[config], &edges);
            }
        }
        if let Some(p) = progress {
            p.report((z + 1) as f64 / (nz - 1) as f64);
        }
    }

    for normal in &mut grid.mesh.normals {
        let len = normal.length();
        if len > 1e-10 {
            *normal /= len;
        }
    }
    grid.mesh
}

struct CellGrid {
    mesh: Mesh,
    slab: Vec<[u32; 3]>,
    nx: usize,
    ny: usize,
    spacing: [f64; 3],
    origin: [f64; 3],
}

impl CellGrid {
    // modular z keeps only two slabs of edge indices alive
    #[inline]
    fn slab_index(&self, x: usize, y: usize, z: usize) -> usize {
        (z % 2) * self.nx * self.ny + y * self.nx + x
    }

    #[inline]
    fn slab_entry(&self, x: usize, y: usize, z: usize) -> [u32; 3] {
        self.slab[self.slab_index(x, y, z)]
    }

    /// Places an interpolated world-space vertex on the grid edge
    /// starting at (x, y, z) along `axis` when the surface crosses it.
    fn edge_vertex(&mut self, va: f32, vb: f32, axis: usize, x: usize, y: usize, z: usize) {
        if (va < 0.0) == (vb < 0.0) {
            return;
        }
        let mut g = Vec3::new(x as f32, y as f32, z as f32);
        g[axis] += va / (va - vb);

        let world = Vec3::new(
            (self.origin[0] + f64::from(g.x) * self.spacing[0]) as f32,
            (self.origin[1] + f64::from(g.y) * self.spacing[1]) as f32,
            (self.origin[2] + f64::from(g.z) * self.spacing[2]) as f32,
        );

        let index = self.mesh.vertices.len() as u32;
        let slot = self.slab_index(x, y, z);
        self.slab[slot][axis] = index;
        self.mesh.vertices.push(world);
        self.mesh.normals.push(Vec3::ZERO);
    }

    fn emit_triangles(&mut self, config: u64, edges: &[u32; 12]) {
        let n_triangles = (config & 0xF) as usize;
        let mut offset = 4;
        for _ in 0..n_triangles {
            let a = edges[((config >> offset) & 0xF) as usize];
            let b = edges[((config >> (offset + 4)) & 0xF) as usize];
            let c = edges[((config >> (offset + 8)) & 0xF) as usize];
            offset += 12;
            self.mesh.triangles.push([a, b, c]);
            self.accumulate_normal(a, b, c);
        }
    }

    fn accumulate_normal(&mut self, a: u32, b: u32, c: u32) {
        let va = self.mesh.vertices[a as usize];
        let vb = self.mesh.vertices[b as usize];
        let vc = self.mesh.vertices[c as usize];
        let n = (vc - vb).cross(va - vb);
        self.mesh.normals[a as usize] += n;
        self.mesh.normals[b as usize] += n;
        self.mesh.normals[c as usize] += n;
    }
}

/// Triangle configurations for the 256 cube corner sign patterns.
///
/// Each entry is a `u64` encoding the triangle count in bits `[3:0]`
/// and one cell-edge index (0-11) per triangle corner in the following
/// 4-bit groups. Public-domain data from MarchingCubeCpp.
#[rustfmt::skip]
static TRI_CONFIGS: [u64; 256] = [
    0, 33793, 36945, 159668546,
    18961, 144771090, 5851666, 595283255635,
    20913, 67640146, 193993474, 655980856339,
    88782242, 736732689667, 797430812739, 194554754,
    26657, 104867330, 136709522, 298069416227,
    109224258, 8877909667, 318136408323, 1567994331701604,
    189884450, 350847647843, 559958167731, 3256298596865604,
    447393122899, 651646838401572, 2538311371089956, 737032694307,
    29329, 43484162, 91358498, 374810899075,
    158485010, 178117478419, 88675058979, 433581536604804,
    158486962, 649105605635, 4866906995, 3220959471609924,
    649165714851, 3184943915608436, 570691368417972, 595804498035,
    124295042, 431498018963, 508238522371, 91518530,
    318240155763, 291789778348404, 1830001131721892, 375363605923,
    777781811075, 1136111028516116, 3097834205243396, 508001629971,
    2663607373704004, 680242583802939237, 333380770766129845, 179746658,
    42545, 138437538, 93365810, 713842853011,
    73602098, 69575510115, 23964357683, 868078761575828,
    28681778, 713778574611, 250912709379, 2323825233181284,
    302080811955, 3184439127991172, 1694042660682596, 796909779811,
    176306722, 150327278147, 619854856867, 1005252473234484,
    211025400963, 36712706, 360743481544788, 150627258963,
    117482600995, 1024968212107700, 2535169275963444, 4734473194086550421,
    628107696687956, 9399128243, 5198438490361643573, 194220594,
    104474994, 566996932387, 427920028243, 2014821863433780,
    492093858627, 147361150235284, 2005882975110676, 9671606099636618005,
    777701008947, 3185463219618820, 482784926917540, 2900953068249785909,
    1754182023747364, 4274848857537943333, 13198752741767688709, 2015093490989156,
    591272318771, 2659758091419812, 1531044293118596, 298306479155,
    408509245114388, 210504348563, 9248164405801223541, 91321106,
    2660352816454484, 680170263324308757, 8333659837799955077, 482966828984116,
    4274926723105633605, 3184439197724820, 192104450, 15217,
    45937, 129205250, 129208402, 529245952323,
    169097138, 770695537027, 382310500883, 2838550742137652,
    122763026, 277045793139, 81608128403, 1991870397907988,
    362778151475, 2059003085103236, 2132572377842852, 655681091891,
    58419234, 239280858627, 529092143139, 1568257451898804,
    447235128115, 679678845236084, 2167161349491220, 1554184567314086709,
    165479003923, 1428768988226596, 977710670185060, 10550024711307499077,
    1305410032576132, 11779770265620358997, 333446212255967269, 978168444447012,
    162736434, 35596216627, 138295313843, 891861543990356,
    692616541075, 3151866750863876, 100103641866564, 6572336607016932133,
    215036012883, 726936420696196, 52433666, 82160664963,
    2588613720361524, 5802089162353039525, 214799000387, 144876322,
    668013605731, 110616894681956, 1601657732871812, 430945547955,
    3156382366321172, 7644494644932993285, 3928124806469601813, 3155990846772900,
    339991010498708, 10743689387941597493, 5103845475, 105070898,
    3928064910068824213, 156265010, 1305138421793636, 27185,
    195459938, 567044449971, 382447549283, 2175279159592324,
    443529919251, 195059004769796, 2165424908404116, 1554158691063110021,
    504228368803, 1436350466655236, 27584723588724, 1900945754488837749,
    122971970, 443829749251, 302601798803, 108558722,
    724700725875, 43570095105972, 2295263717447940, 2860446751369014181,
    2165106202149444, 69275726195, 2860543885641537797, 2165106320445780,
    2280890014640004, 11820349930268368933, 8721082628082003989, 127050770,
    503707084675, 122834978, 2538193642857604, 10129,
    801441490467, 2923200302876740, 1443359556281892, 2901063790822564949,
    2728339631923524, 7103874718248233397, 12775311047932294245, 95520290,
    2623783208098404, 1900908618382410757, 137742672547, 2323440239468964,
    362478212387, 727199575803140, 73425410, 34337,
    163101314, 668566030659, 801204361987, 73030562,
    591509145619, 162574594, 100608342969108, 5553,
    724147968595, 1436604830452292, 176259090, 42001,
    143955266, 2385, 18433, 0,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingProgress;
    use ndarray::Array3;

    fn volume_from_fn<F: Fn(usize, usize, usize) -> f32>(
        n: usize,
        spacing: [f64; 3],
        origin: [f64; 3],
        f: F,
    ) -> VolumeImage {
        let data = Array3::from_shape_fn((n, n, n), |(z, y, x)| f(x, y, z));
        VolumeImage::new(data, spacing, origin)
    }

    fn sphere_volume(n: usize, spacing: [f64; 3], origin: [f64; 3]) -> VolumeImage {
        let center = n as f32 / 2.0;
        let radius = n as f32 / 4.0;
        volume_from_fn(n, spacing, origin, |x, y, z| {
            let dx = x as f32 - center;
            let dy = y as f32 - center;
            let dz = z as f32 - center;
            (dx * dx + dy * dy + dz * dz).sqrt() - radius
        })
    }

    #[test]
    fn constant_field_above_iso_is_empty() {
        let v = volume_from_fn(3, [1.0; 3], [0.0; 3], |_, _, _| 1.0);
        assert!(extract_isosurface(&v, 0.0, None).is_empty());
    }

    #[test]
    fn constant_field_below_iso_is_empty() {
        let v = volume_from_fn(3, [1.0; 3], [0.0; 3], |_, _, _| -1.0);
        assert!(extract_isosurface(&v, 0.0, None).is_empty());
    }

    #[test]
    fn degenerate_volume_yields_empty_mesh() {
        let data = Array3::from_shape_fn((1, 4, 4), |_| 0.0);
        let v = VolumeImage::new(data, [1.0; 3], [0.0; 3]);
        assert!(extract_isosurface(&v, 0.5, None).is_empty());
    }

    #[test]
    fn single_inside_corner_yields_one_triangle() {
        let data = Array3::from_shape_fn((2, 2, 2), |(z, y, x)| {
            if (x, y, z) == (0, 0, 0) {
                -1.0
            } else {
                1.0
            }
        });
        let v = VolumeImage::new(data, [1.0; 3], [0.0; 3]);
        let mesh = extract_isosurface(&v, 0.0, None);
        assert_eq!(mesh.num_triangles(), 1);
        assert_eq!(mesh.num_vertices(), 3);
    }

    #[test]
    fn sphere_surface_lies_on_the_radius() {
        let n = 20;
        let v = sphere_volume(n, [1.0; 3], [0.0; 3]);
        let mesh = extract_isosurface(&v, 0.0, None);
        let center = Vec3::splat(n as f32 / 2.0);
        let radius = n as f32 / 4.0;

        assert!(mesh.num_triangles() > 100);
        assert_eq!(mesh.vertices.len(), mesh.normals.len());
        for t in &mesh.triangles {
            for &i in t {
                assert!((i as usize) < mesh.num_vertices());
            }
        }
        for v in &mesh.vertices {
            let dist = (*v - center).length();
            assert!((dist - radius).abs() < 2.0, "vertex {v:?} off the sphere");
        }
        for n in &mesh.normals {
            assert!((n.length() - 1.0).abs() < 0.01);
        }
    }

    #[test]
    fn spacing_and_origin_map_vertices_to_world_space() {
        let n = 12;
        let unit = extract_isosurface(&sphere_volume(n, [1.0; 3], [0.0; 3]), 0.0, None);
        let scaled = extract_isosurface(&sphere_volume(n, [2.0, 2.0, 2.0], [5.0, 0.0, 0.0]), 0.0, None);

        assert_eq!(unit.num_vertices(), scaled.num_vertices());
        for (a, b) in unit.vertices.iter().zip(&scaled.vertices) {
            assert!((b.x - (a.x * 2.0 + 5.0)).abs() < 1e-4);
            assert!((b.y - a.y * 2.0).abs() < 1e-4);
            assert!((b.z - a.z * 2.0).abs() < 1e-4);
        }
    }

    #[test]
    fn extraction_reports_progress_per_slab() {
        let v = sphere_volume(8, [1.0; 3], [0.0; 3]);
        let sink = RecordingProgress::default();
        let mesh = extract_isosurface(&v, 0.0, Some(&sink));
        assert!(!mesh.is_empty());
        let reports = sink.reports();
        assert_eq!(reports.len(), 7);
        assert!((reports.last().copied().unwrap() - 1.0).abs() < 1e-9);
    }
}
