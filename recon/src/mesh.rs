use std::cmp::{Ord, Ordering};
use std::collections::{BinaryHeap, HashMap, HashSet};

use derive_more::{Add, AddAssign};
use log::debug;
use petgraph::unionfind::UnionFind;

use crate::camera::{Matrix4, Point3, Vector3};

type Vector4 = nalgebra::Vector4<f64>;

/// Triangle mesh. `normals` and `colors` are either empty or hold one
/// entry per vertex.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Point3>,
    pub normals: Vec<Vector3>,
    pub colors: Vec<Vector3>,
    pub faces: Vec<[usize; 3]>,
}

impl Mesh {
    pub fn has_colors(&self) -> bool {
        !self.colors.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Unnormalized face normal, its length is twice the face area.
    pub fn face_cross(&self, face: [usize; 3]) -> Vector3 {
        let [v0, v1, v2] = face;
        let p0 = self.vertices[v0];
        (self.vertices[v1] - p0).cross(&(self.vertices[v2] - p0))
    }

    pub fn face_area(&self, face: [usize; 3]) -> f64 {
        self.face_cross(face).norm() / 2.0
    }

    pub fn compute_vertex_normals(&mut self) {
        let mut normals = vec![Vector3::zeros(); self.vertices.len()];
        for &face in &self.faces {
            let n = self.face_cross(face);
            for v in face {
                normals[v] += n;
            }
        }
        self.normals = normals
            .into_iter()
            .map(|n| n.try_normalize(1e-20).unwrap_or_else(Vector3::z))
            .collect();
    }

    // Keeps the vertices whose mask entry is set, remapping faces and
    // dropping any face that references a removed vertex.
    fn retain_vertices(&mut self, mask: &[bool]) {
        let mut mappings = HashMap::with_capacity(self.vertices.len());

        let mut j = 0;
        for i in 0..self.vertices.len() {
            if mask[i] {
                mappings.insert(i, j);
                self.vertices.swap(i, j);
                if self.has_normals() {
                    self.normals.swap(i, j);
                }
                if self.has_colors() {
                    self.colors.swap(i, j);
                }
                j += 1;
            }
        }
        self.vertices.truncate(j);
        if self.has_normals() {
            self.normals.truncate(j);
        }
        if self.has_colors() {
            self.colors.truncate(j);
        }

        let mut j = 0;
        'next: for i in 0..self.faces.len() {
            let mut face = [0; 3];
            for k in 0..3 {
                if let Some(&l) = mappings.get(&self.faces[i][k]) {
                    face[k] = l;
                } else {
                    continue 'next;
                }
            }
            self.faces[j] = face;
            j += 1;
        }
        self.faces.truncate(j);
    }

    pub fn remove_vertices_by_mask(&mut self, remove: &[bool]) {
        let keep: Vec<bool> = remove.iter().map(|&r| !r).collect();
        self.retain_vertices(&keep);
    }

    pub fn remove_unreferenced_vertices(&mut self) {
        let mut referenced = vec![false; self.vertices.len()];
        for face in &self.faces {
            for &v in face {
                referenced[v] = true;
            }
        }
        self.retain_vertices(&referenced);
    }

    /// Drops faces that reference a vertex more than once.
    pub fn remove_degenerate_triangles(&mut self) {
        self.faces
            .retain(|&[v0, v1, v2]| v0 != v1 && v0 != v2 && v1 != v2);
    }

    /// Drops faces spanning the same vertex set as an earlier face.
    pub fn remove_duplicated_triangles(&mut self) {
        let mut seen = HashSet::with_capacity(self.faces.len());
        self.faces.retain(|&face| {
            let mut key = face;
            key.sort_unstable();
            seen.insert(key)
        });
    }

    /// Merges vertices with identical coordinates.
    pub fn remove_duplicated_vertices(&mut self) {
        let mut first_of = HashMap::<[u64; 3], usize>::new();
        let mut remap = Vec::with_capacity(self.vertices.len());
        let mut keep = vec![false; self.vertices.len()];
        for (i, v) in self.vertices.iter().enumerate() {
            let key = [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()];
            let j = *first_of.entry(key).or_insert(i);
            keep[i] = i == j;
            remap.push(j);
        }
        for face in self.faces.iter_mut() {
            for v in face.iter_mut() {
                *v = remap[*v];
            }
        }
        self.retain_vertices(&keep);
    }

    /// Resolves edges shared by more than two faces by dropping the
    /// smallest faces around them.
    pub fn remove_non_manifold_edges(&mut self) {
        let mut alive = vec![true; self.faces.len()];
        loop {
            let mut faces_around_edge = HashMap::<[usize; 2], Vec<usize>>::new();
            for (f_idx, &[v0, v1, v2]) in self.faces.iter().enumerate() {
                if !alive[f_idx] {
                    continue;
                }
                for e in [[v0, v1], [v1, v2], [v2, v0]] {
                    faces_around_edge.entry(ordered(e)).or_default().push(f_idx);
                }
            }

            let mut changed = false;
            let mut edges: Vec<_> = faces_around_edge
                .into_iter()
                .filter(|(_, fs)| fs.len() > 2)
                .collect();
            edges.sort_unstable_by_key(|(e, _)| *e);
            for (_, mut fs) in edges {
                fs.retain(|&f| alive[f]);
                if fs.len() <= 2 {
                    continue;
                }
                fs.sort_by(|&a, &b| {
                    let (aa, ab) =
                        (self.face_area(self.faces[a]), self.face_area(self.faces[b]));
                    aa.partial_cmp(&ab).unwrap_or(Ordering::Equal)
                });
                for &f in &fs[..fs.len() - 2] {
                    alive[f] = false;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        let mut i = 0;
        self.faces.retain(|_| {
            i += 1;
            alive[i - 1]
        });
    }

    pub fn cleanup(&mut self) {
        let (nv, nf) = (self.vertices.len(), self.faces.len());
        self.remove_degenerate_triangles();
        self.remove_duplicated_triangles();
        self.remove_duplicated_vertices();
        self.remove_degenerate_triangles();
        self.remove_duplicated_triangles();
        self.remove_non_manifold_edges();
        self.remove_unreferenced_vertices();
        debug!(
            "mesh cleanup: verts {} -> {}, tris {} -> {}",
            nv,
            self.vertices.len(),
            nf,
            self.faces.len()
        );
    }

    /// Quadric-error decimation down to at most `target_faces` faces.
    /// Meshes already within budget are returned unchanged.
    pub fn decimate(self, target_faces: usize) -> Mesh {
        let mut mesh = self;
        while mesh.faces.len() > target_faces {
            let before = mesh.faces.len();
            mesh = Decimator::execute(mesh, target_faces);
            if mesh.faces.len() >= before {
                break;
            }
        }
        mesh.remove_unreferenced_vertices();
        mesh
    }
}

pub fn ordered(e: [usize; 2]) -> [usize; 2] {
    if e[0] < e[1] {
        e
    } else {
        [e[1], e[0]]
    }
}

#[derive(Add, AddAssign, Copy, Clone)]
struct Quadric(Matrix4);

impl Quadric {
    // Below this determinant the optimal point is ill-conditioned.
    const OPTIMIZE_EPS: f64 = 1e-8;

    pub fn make_planar(p: Vector3, n: Vector3) -> Quadric {
        let plane = Vector4::new(n[0], n[1], n[2], -p.dot(&n));
        Quadric(plane * plane.transpose())
    }

    pub fn optimum(&self) -> Option<Vector3> {
        let a = self.0.fixed_slice::<3, 3>(0, 0);
        if a.determinant().abs() > Self::OPTIMIZE_EPS {
            let b = self.0.fixed_slice::<3, 1>(0, 3);
            Some(-a.cholesky()?.solve(&b))
        } else {
            None
        }
    }

    pub fn eval(&self, p: Vector3) -> f64 {
        let v = Vector4::new(p[0], p[1], p[2], 1.0);
        v.dot(&(self.0 * v))
    }

    pub fn zero() -> Quadric {
        Quadric(nalgebra::zero())
    }
}

// Edge contraction waiting in the heap. A candidate whose timestamp no
// longer matches the partition sizes of its ends is stale.
struct Candidate {
    cost: f64,
    edge: [usize; 2],
    point: Vector3,
    timestamp: [usize; 2],
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .partial_cmp(&other.cost)
            .unwrap_or(Ordering::Equal)
            .reverse()
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for Candidate {}

pub struct Decimator {
    mesh: Mesh,
    vertex_quadrics: Vec<Quadric>,
    vertex_partition: UnionFind<usize>,
    vertex_partition_sizes: Vec<usize>,
    vertices_around_vertex: Vec<HashSet<usize>>,
    faces_around_vertex: Vec<HashSet<usize>>,
    dead_faces: Vec<bool>,
    live_faces: usize,
    edge_heap: BinaryHeap<Candidate>,
}

impl Decimator {
    pub fn execute(mesh: Mesh, target_faces: usize) -> Mesh {
        let mut d = Decimator::new(mesh);

        while d.live_faces > target_faces {
            let c = match d.edge_heap.pop() {
                Some(c) => c,
                None => break,
            };
            d.try_contract(c.point, c.edge, c.timestamp);
        }

        d.finalize()
    }

    fn new(mesh: Mesh) -> Decimator {
        // Plane quadrics of the incident faces.
        let mut vertex_quadrics = vec![Quadric::zero(); mesh.vertices.len()];
        for &face in &mesh.faces {
            let [v0, v1, v2] = face;
            let n = mesh.face_cross(face);
            if n.norm() < 1e-20 {
                continue;
            }
            let v_mid = (mesh.vertices[v0].coords
                + mesh.vertices[v1].coords
                + mesh.vertices[v2].coords)
                / 3.0;
            let q = Quadric::make_planar(v_mid, n.normalize());
            vertex_quadrics[v0] += q;
            vertex_quadrics[v1] += q;
            vertex_quadrics[v2] += q;
        }

        let vertex_partition = UnionFind::new(mesh.vertices.len());
        let vertex_partition_sizes = vec![1; mesh.vertices.len()];

        // Adjacency, kept up to date while contracting.
        let mut vertices_around_vertex =
            vec![HashSet::new(); mesh.vertices.len()];
        let mut faces_around_vertex = vec![HashSet::new(); mesh.vertices.len()];
        for (f_idx, &[v0, v1, v2]) in mesh.faces.iter().enumerate() {
            vertices_around_vertex[v0].insert(v1);
            vertices_around_vertex[v0].insert(v2);
            vertices_around_vertex[v1].insert(v0);
            vertices_around_vertex[v1].insert(v2);
            vertices_around_vertex[v2].insert(v0);
            vertices_around_vertex[v2].insert(v1);
            for v in [v0, v1, v2] {
                faces_around_vertex[v].insert(f_idx);
            }
        }

        let live_faces = mesh.faces.len();
        let mut decimator = Decimator {
            mesh,
            vertex_quadrics,
            vertex_partition,
            vertex_partition_sizes,
            vertices_around_vertex,
            faces_around_vertex,
            dead_faces: vec![false; live_faces],
            live_faces,
            edge_heap: BinaryHeap::new(),
        };

        // Put all edges in the decimator queue.
        for f_idx in 0..decimator.mesh.faces.len() {
            let [v0, v1, v2] = decimator.mesh.faces[f_idx];
            for edge in [[v0, v1], [v0, v2], [v1, v2]] {
                if edge[0] != edge[1] {
                    decimator.push_candidate(edge);
                }
            }
        }

        decimator
    }

    fn push_candidate(&mut self, edge: [usize; 2]) {
        let (point, cost) = self.optimize_single_edge(edge);
        let timestamp = self.edge_timestamp(edge);
        self.edge_heap.push(Candidate {
            cost,
            edge,
            point,
            timestamp,
        });
    }

    fn optimize_single_edge(&self, e: [usize; 2]) -> (Vector3, f64) {
        let quadric = self.vertex_quadrics[e[0]] + self.vertex_quadrics[e[1]];
        let point = if let Some(p) = quadric.optimum() {
            p
        } else {
            let p0 = self.mesh.vertices[e[0]];
            let p1 = self.mesh.vertices[e[1]];
            (p0.coords + p1.coords) / 2.0
        };
        (point, quadric.eval(point))
    }

    fn edge_timestamp(&self, e: [usize; 2]) -> [usize; 2] {
        [
            self.vertex_partition_sizes[e[0]],
            self.vertex_partition_sizes[e[1]],
        ]
    }

    fn face_is_live(&self, f_idx: usize) -> bool {
        let [v0, v1, v2] = self.mesh.faces[f_idx];
        let (r0, r1, r2) = (
            self.vertex_partition.find(v0),
            self.vertex_partition.find(v1),
            self.vertex_partition.find(v2),
        );
        r0 != r1 && r0 != r2 && r1 != r2
    }

    fn try_contract(
        &mut self,
        point: Vector3,
        edge: [usize; 2],
        ts: [usize; 2],
    ) -> bool {
        if !self.validate_timestamp(edge, ts) {
            return false;
        }

        let [v0, v1] = edge;
        if v0 == v1 {
            return false;
        }

        // The merged vertex lives at the root of the union.
        self.vertex_partition.union(v0, v1);
        let v = self.vertex_partition.find(v0);

        let (s0, s1) = (
            self.vertex_partition_sizes[v0] as f64,
            self.vertex_partition_sizes[v1] as f64,
        );
        self.vertex_partition_sizes[v] =
            self.vertex_partition_sizes[v0] + self.vertex_partition_sizes[v1];
        self.mesh.vertices[v] = Point3::from(point);
        if self.mesh.has_normals() {
            let n = self.mesh.normals[v0] + self.mesh.normals[v1];
            self.mesh.normals[v] =
                n.try_normalize(1e-20).unwrap_or(self.mesh.normals[v0]);
        }
        if self.mesh.has_colors() {
            self.mesh.colors[v] = (self.mesh.colors[v0] * s0
                + self.mesh.colors[v1] * s1)
                / (s0 + s1);
        }
        self.vertex_quadrics[v] =
            self.vertex_quadrics[v0] + self.vertex_quadrics[v1];

        // Faces spanning the contracted edge collapse.
        let faces: HashSet<usize> = self.faces_around_vertex[v0]
            .union(&self.faces_around_vertex[v1])
            .cloned()
            .collect();
        let mut live = HashSet::with_capacity(faces.len());
        for f in faces {
            if self.face_is_live(f) {
                live.insert(f);
            } else if !self.dead_faces[f] {
                self.dead_faces[f] = true;
                self.live_faces -= 1;
            }
        }
        self.faces_around_vertex[v] = live;

        self.vertices_around_vertex[v] = self.vertices_around_vertex[v0]
            .union(&self.vertices_around_vertex[v1])
            .map(|&w| self.vertex_partition.find(w))
            .collect();
        self.vertices_around_vertex[v].remove(&v);

        let neighbours: Vec<usize> =
            self.vertices_around_vertex[v].iter().cloned().collect();
        for v2 in neighbours {
            self.push_candidate([v, v2]);
        }

        true
    }

    fn validate_timestamp(&self, edge: [usize; 2], ts: [usize; 2]) -> bool {
        edge[0] == self.vertex_partition.find(edge[0])
            && edge[1] == self.vertex_partition.find(edge[1])
            && self.edge_timestamp(edge) == ts
    }

    fn finalize(self) -> Mesh {
        let mut kept_indices = self.vertex_partition.clone().into_labeling();
        kept_indices.sort_unstable();
        kept_indices.dedup();
        let new_indices = HashMap::<usize, usize>::from_iter(
            kept_indices.iter().enumerate().map(|(i, &j)| (j, i)),
        );

        let vertices: Vec<Point3> = kept_indices
            .iter()
            .map(|&i| self.mesh.vertices[i])
            .collect();
        let normals: Vec<Vector3> = if self.mesh.has_normals() {
            kept_indices.iter().map(|&i| self.mesh.normals[i]).collect()
        } else {
            vec![]
        };
        let colors: Vec<Vector3> = if self.mesh.has_colors() {
            kept_indices.iter().map(|&i| self.mesh.colors[i]).collect()
        } else {
            vec![]
        };
        let mut faces: Vec<[usize; 3]> = self
            .mesh
            .faces
            .iter()
            .map(|&[v0, v1, v2]| {
                [
                    new_indices[&self.vertex_partition.find(v0)],
                    new_indices[&self.vertex_partition.find(v1)],
                    new_indices[&self.vertex_partition.find(v2)],
                ]
            })
            .filter(|[v0, v1, v2]| v0 != v1 && v0 != v2 && v1 != v2)
            .collect();
        faces.sort_unstable();
        faces.dedup();

        Mesh {
            vertices,
            normals,
            colors,
            faces,
        }
    }
}
