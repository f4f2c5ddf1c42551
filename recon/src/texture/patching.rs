use std::collections::HashMap;
use std::f64::consts::PI;

use petgraph::unionfind::UnionFind;

use crate::camera::{Matrix3, Vector2, Vector3};
use crate::mesh::Mesh;

use super::{
    all_nonneg, complement, dominant_vector, extract_biggest_partition_component,
    idxs_to_mask, mask_to_idxs, vec_inv, BarycentricCoordinateSystem,
    FaceTopology, Matrix2, Rectangle,
};

const ANGLE_LIMIT: f64 = (PI / 180.0) * 66.0;
const REFINE_ITERATIONS: usize = 10;
const DEPTH_TOLERANCE: f64 = 1e-3;
const MIN_PATCH_SIZE: f64 = 1e-6;

fn vertex_aligned(i: usize, major_axis: Vector3, mesh: &Mesh) -> bool {
    mesh.normals[i].dot(&major_axis) > ANGLE_LIMIT.cos()
}

fn face_aligned(i: usize, major_axis: Vector3, mesh: &Mesh) -> bool {
    mesh.faces[i]
        .iter()
        .all(|&v| vertex_aligned(v, major_axis, mesh))
}

fn count_aligned_faces(
    major_axis: Vector3,
    faces_mask: &[bool],
    mesh: &Mesh,
) -> usize {
    (0..mesh.faces.len())
        .filter(|&i| faces_mask[i] && face_aligned(i, major_axis, mesh))
        .count()
}

fn face_normal(i: usize, mesh: &Mesh) -> Vector3 {
    let [v0, v1, v2] = mesh.faces[i];
    (mesh.normals[v0] + mesh.normals[v1] + mesh.normals[v2])
        .try_normalize(1e-12)
        .or_else(|| mesh.face_cross(mesh.faces[i]).try_normalize(1e-12))
        .unwrap_or_else(Vector3::z)
}

fn get_major_axis(faces_mask: &[bool], mesh: &Mesh) -> Vector3 {
    let normals: Vec<Vector3> = (0..mesh.faces.len())
        .filter(|&i| faces_mask[i])
        .map(|i| face_normal(i, mesh))
        .collect();
    let mut major = dominant_vector(&normals).unwrap_or_else(Vector3::z);
    if count_aligned_faces(major, faces_mask, mesh)
        < count_aligned_faces(-major, faces_mask, mesh)
    {
        major = -major;
    }
    major
}

// Orthonormal (u, v) directions spanning the plane across `major_axis`.
fn plane_basis(major_axis: Vector3) -> (Vector3, Vector3) {
    let ev = match complement(major_axis) {
        Some((_, ev)) => ev,
        None => {
            let helper = if major_axis.x.abs() < 0.9 {
                Vector3::x()
            } else {
                Vector3::y()
            };
            major_axis.cross(&helper).normalize()
        }
    };
    (ev.cross(&major_axis), ev)
}

/// Orthographic projection of the chunk faces along `major_axis`, keeping
/// the depth of every corner.
fn project_chunk_with_depths(
    chunk: &[usize],
    major_axis: Vector3,
    mesh: &Mesh,
) -> Vec<[(Vector2, f64); 3]> {
    let (eu, ev) = plane_basis(major_axis);
    let uvw_basis = Matrix3::from_columns(&[eu, ev, -major_axis]).transpose();

    let f = |v: usize| {
        let uvw = uvw_basis * mesh.vertices[v].coords;
        (Vector2::new(uvw[0], uvw[1]), uvw[2])
    };
    chunk
        .iter()
        .map(|&i| mesh.faces[i])
        .map(|[v0, v1, v2]| [f(v0), f(v1), f(v2)])
        .collect()
}

// Buckets of projected corners, so that the occlusion test only visits
// corners that may fall inside a given triangle.
struct CornerGrid {
    cell: f64,
    buckets: HashMap<(i64, i64), Vec<(usize, usize)>>,
}

impl CornerGrid {
    fn new(uvs: &[[Vector2; 3]]) -> CornerGrid {
        let edges: f64 = uvs
            .iter()
            .map(|t| (t[1] - t[0]).norm() + (t[2] - t[1]).norm())
            .sum();
        let cell = (edges / (2 * uvs.len().max(1)) as f64).max(1e-9);

        let mut grid = CornerGrid {
            cell,
            buckets: HashMap::new(),
        };
        for (j, tri) in uvs.iter().enumerate() {
            for (k, p) in tri.iter().enumerate() {
                let key = grid.key(p);
                grid.buckets.entry(key).or_default().push((j, k));
            }
        }
        grid
    }

    fn key(&self, p: &Vector2) -> (i64, i64) {
        (
            (p.x / self.cell).floor() as i64,
            (p.y / self.cell).floor() as i64,
        )
    }

    fn corners_within(
        &self,
        tri: &[Vector2; 3],
    ) -> impl Iterator<Item = &(usize, usize)> + '_ {
        let lo = self.key(&tri[0].inf(&tri[1]).inf(&tri[2]));
        let hi = self.key(&tri[0].sup(&tri[1]).sup(&tri[2]));
        (lo.0..=hi.0)
            .flat_map(move |x| (lo.1..=hi.1).map(move |y| (x, y)))
            .filter_map(move |key| self.buckets.get(&key))
            .flatten()
    }
}

// Drops faces hidden behind other faces of the chunk when looking along
// the major axis, so that the projected patch does not overlap itself.
fn visible_faces(
    faces_mask: &[bool],
    major_axis: Vector3,
    mesh: &Mesh,
) -> Vec<bool> {
    let faces_idx = mask_to_idxs(faces_mask);
    let uvws = project_chunk_with_depths(&faces_idx, major_axis, mesh);
    let uvs: Vec<[Vector2; 3]> =
        uvws.iter().map(|t| [t[0].0, t[1].0, t[2].0]).collect();
    let ws: Vec<Vector3> = uvws
        .iter()
        .map(|t| Vector3::new(t[0].1, t[1].1, t[2].1))
        .collect();
    let grid = CornerGrid::new(&uvs);

    let mut faces_mask = faces_mask.to_vec();
    for (i_idx, tri) in uvs.iter().enumerate() {
        let bcs = match BarycentricCoordinateSystem::new(*tri) {
            Some(bcs) => bcs,
            None => continue,
        };
        for &(j_idx, k) in grid.corners_within(tri) {
            let j = faces_idx[j_idx];
            if !faces_mask[j] || j_idx == i_idx {
                continue;
            }
            if let Some(bary) = bcs.infer(uvs[j_idx][k]) {
                let depth = bary.dot(&ws[i_idx]);
                if all_nonneg(bary) && depth + DEPTH_TOLERANCE < ws[j_idx][k] {
                    faces_mask[j] = false;
                }
            }
        }
    }

    faces_mask
}

fn partition_faces(
    faces_mask: &[bool],
    topo: &FaceTopology,
) -> (UnionFind<usize>, Vec<usize>) {
    let carrier = mask_to_idxs(faces_mask);
    let carrier_inv = vec_inv(&carrier);
    let mut partition = UnionFind::new(carrier.len());

    for (c0, &f0) in carrier.iter().enumerate() {
        for f1 in &topo.neighbouring_faces[f0] {
            if let Some(&c1) = carrier_inv.get(f1) {
                partition.union(c0, c1);
            }
        }
    }

    (partition, carrier)
}

fn get_big_chunk_helper(
    faces_mask: &[bool],
    mesh: &Mesh,
    topo: &FaceTopology,
    major_axis: Vector3,
) -> Vec<usize> {
    let subset: Vec<bool> = (0..mesh.faces.len())
        .map(|i| faces_mask[i] && face_aligned(i, major_axis, mesh))
        .collect();

    if subset.iter().any(|&b| b) {
        let (partition, carrier) = partition_faces(&subset, topo);
        extract_biggest_partition_component(partition)
            .iter()
            .map(|&i| carrier[i])
            .collect()
    } else {
        // Toward the end only a few scattered faces are left.
        faces_mask.iter().position(|&b| b).into_iter().collect()
    }
}

fn average_normal(faces_idx: &[usize], mesh: &Mesh) -> Option<Vector3> {
    faces_idx
        .iter()
        .flat_map(|&i| mesh.faces[i])
        .map(|i| mesh.normals[i])
        .sum::<Vector3>()
        .try_normalize(1e-12)
}

fn get_big_chunk(
    faces_mask: &[bool],
    mesh: &Mesh,
    topo: &FaceTopology,
) -> (Vec<usize>, Vector3) {
    let mut major_axis = get_major_axis(faces_mask, mesh);
    let mut biggest = get_big_chunk_helper(faces_mask, mesh, topo, major_axis);

    for _ in 0..REFINE_ITERATIONS {
        match average_normal(&biggest, mesh) {
            Some(axis) => major_axis = axis,
            None => break,
        }
        biggest = get_big_chunk_helper(faces_mask, mesh, topo, major_axis);
    }

    let biggest_mask = idxs_to_mask(mesh.faces.len(), &biggest);
    let visible = mask_to_idxs(&visible_faces(&biggest_mask, major_axis, mesh));
    if visible.is_empty() {
        // Every face hides another; keep one to guarantee progress.
        (biggest.into_iter().take(1).collect(), major_axis)
    } else {
        (visible, major_axis)
    }
}

/// Splits the mesh into connected chunks of faces that project onto a
/// plane without overlapping, each with its projection axis. Every face
/// lands in exactly one chunk. Needs vertex normals.
pub fn choose_uv_patches(
    mesh: &Mesh,
    topo: &FaceTopology,
) -> Vec<(Vec<usize>, Vector3)> {
    let mut faces_mask = vec![true; mesh.faces.len()];
    let mut remaining = mesh.faces.len();
    let mut result = vec![];

    while remaining > 0 {
        let (chunk, major_axis) = get_big_chunk(&faces_mask, mesh, topo);
        for &k in &chunk {
            faces_mask[k] = false;
        }
        remaining -= chunk.len();
        result.push((chunk, major_axis));
    }

    result
}

#[derive(Debug, PartialEq, Clone, PartialOrd)]
pub struct LocalPatch {
    // Indices into the mesh faces.
    pub chunk: Vec<usize>,
    // Physical size of the patch in world units.
    pub size: [f64; 2],
    // Corner coordinates normalized to [0,1]x[0,1].
    pub uvs: Vec<[Vector2; 3]>,
}

impl LocalPatch {
    pub fn calculate_from(
        chunk: &[usize],
        major_axis: Vector3,
        mesh: &Mesh,
    ) -> LocalPatch {
        let (eu, ev) = plane_basis(major_axis);
        let uv_basis =
            nalgebra::Matrix3x2::from_columns(&[eu, ev]).transpose();

        let f = |v: usize| uv_basis * mesh.vertices[v].coords;
        let chunk_uvs: Vec<[Vector2; 3]> = chunk
            .iter()
            .map(|&i| mesh.faces[i])
            .map(|[v0, v1, v2]| [f(v0), f(v1), f(v2)])
            .collect();

        // Rotate to align the patch with the axes, which packs tighter.
        let count = (chunk_uvs.len() * 3).max(1) as f64;
        let avg = chunk_uvs.iter().flatten().sum::<Vector2>() / count;
        let centered: Vec<Vector2> =
            chunk_uvs.iter().flatten().map(|uv| uv - avg).collect();
        let chunk_uvs = match dominant_vector(&centered) {
            Some(ev) => {
                let eu = Vector2::new(ev[1], -ev[0]);
                let basis = Matrix2::from_columns(&[eu, ev]).transpose();
                chunk_uvs
                    .iter()
                    .map(|[a, b, c]| [basis * a, basis * b, basis * c])
                    .collect()
            }
            None => chunk_uvs,
        };

        let corners: Vec<[f64; 2]> =
            chunk_uvs.iter().flatten().map(|uv| [uv[0], uv[1]]).collect();
        let rect = Rectangle::bounding(&corners).unwrap_or(Rectangle {
            pos: [0.0, 0.0],
            size: [0.0, 0.0],
        });
        let [u_min, v_min] = rect.pos;
        let size = [
            rect.size[0].max(MIN_PATCH_SIZE),
            rect.size[1].max(MIN_PATCH_SIZE),
        ];

        let f = |uv: Vector2| {
            Vector2::new((uv[0] - u_min) / size[0], (uv[1] - v_min) / size[1])
        };
        let uvs = chunk_uvs
            .iter()
            .map(|&[a, b, c]| [f(a), f(b), f(c)])
            .collect();

        LocalPatch {
            chunk: chunk.to_vec(),
            size,
            uvs,
        }
    }

    pub fn to_global_coords(&self, rect: Rectangle<f64>) -> Vec<[Vector2; 3]> {
        let f = |uv: Vector2| {
            Vector2::new(
                rect.pos[0] + rect.size[0] * uv[0],
                rect.pos[1] + rect.size[1] * uv[1],
            )
        };
        self.uvs.iter().map(|&[a, b, c]| [f(a), f(b), f(c)]).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use base::assert_eq_f32;

    use crate::camera::Point3;
    use crate::mesh::test::grid_mesh;

    fn cube() -> Mesh {
        let mut mesh = Mesh::default();
        for i in 0..8 {
            mesh.vertices.push(Point3::new(
                (i & 1) as f64 - 0.5,
                ((i >> 1) & 1) as f64 - 0.5,
                ((i >> 2) & 1) as f64 - 0.5,
            ));
        }
        mesh.faces = vec![
            [0, 2, 1], [1, 2, 3], [4, 5, 6], [5, 7, 6],
            [0, 1, 4], [1, 5, 4], [2, 6, 3], [3, 6, 7],
            [0, 4, 2], [2, 4, 6], [1, 3, 5], [3, 7, 5],
        ];
        mesh.compute_vertex_normals();
        mesh
    }

    fn assert_partition(patches: &[(Vec<usize>, Vector3)], num_faces: usize) {
        let mut seen = vec![0; num_faces];
        for (chunk, axis) in patches {
            assert!(!chunk.is_empty());
            assert_eq_f32!(axis.norm(), 1.0);
            for &f in chunk {
                seen[f] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_flat_mesh_is_one_patch() {
        let mut mesh = grid_mesh(6);
        mesh.compute_vertex_normals();
        let topo = FaceTopology::new(&mesh);
        let patches = choose_uv_patches(&mesh, &topo);
        assert_eq!(patches.len(), 1);
        assert_partition(&patches, mesh.faces.len());
        assert_eq_f32!(patches[0].1.z.abs(), 1.0);
    }

    #[test]
    fn test_cube_faces_are_covered_once() {
        let mesh = cube();
        let topo = FaceTopology::new(&mesh);
        let patches = choose_uv_patches(&mesh, &topo);
        assert!(patches.len() > 1);
        assert_partition(&patches, mesh.faces.len());
    }

    #[test]
    fn test_folded_sheet_hides_the_back_layer() {
        // A small triangle one unit below a larger one, both facing up.
        let mut mesh = Mesh::default();
        for (z, lo, hi) in [(0.0, 0.0, 1.0), (-1.0, 0.1, 0.5)] {
            mesh.vertices.push(Point3::new(lo, lo, z));
            mesh.vertices.push(Point3::new(hi, lo, z));
            mesh.vertices.push(Point3::new(lo, hi, z));
        }
        mesh.faces = vec![[0, 1, 2], [3, 4, 5]];
        mesh.normals = vec![Vector3::z(); 6];

        let visible = visible_faces(&[true, true], Vector3::z(), &mesh);
        assert_eq!(visible, vec![true, false]);
    }

    #[test]
    fn test_local_patch_is_normalized() {
        let mut mesh = grid_mesh(4);
        mesh.compute_vertex_normals();
        let chunk: Vec<usize> = (0..mesh.faces.len()).collect();
        let patch = LocalPatch::calculate_from(&chunk, Vector3::z(), &mesh);
        assert_eq!(patch.uvs.len(), chunk.len());
        for uv in patch.uvs.iter().flatten() {
            assert!(uv[0] > -1e-9 && uv[0] < 1.0 + 1e-9);
            assert!(uv[1] > -1e-9 && uv[1] < 1.0 + 1e-9);
        }
        let area = patch.size[0] * patch.size[1];
        assert!(area > 0.0);

        let global = patch.to_global_coords(Rectangle {
            pos: [0.5, 0.25],
            size: [0.5, 0.5],
        });
        for uv in global.iter().flatten() {
            assert!(uv[0] >= 0.5 - 1e-9 && uv[0] <= 1.0 + 1e-9);
            assert!(uv[1] >= 0.25 - 1e-9 && uv[1] <= 0.75 + 1e-9);
        }
    }
}
