use std::collections::HashMap;

use crate::camera::{Point3, Vector3};
use crate::mesh::Mesh;

pub type NodeKey = [i64; 3];

// Kuhn split of a unit cube into six tetrahedra around the 0-7 diagonal.
// Corner bit 0 is the x offset, bit 1 the y offset and bit 2 the z offset.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 3, 2, 7],
    [0, 2, 6, 7],
    [0, 6, 4, 7],
    [0, 4, 5, 7],
    [0, 5, 1, 7],
];

/// Scalar samples on the nodes of a regular lattice. Negative values are
/// inside the surface.
pub trait ScalarField {
    fn value(&self, node: NodeKey) -> Option<f64>;

    fn position(&self, node: NodeKey) -> Point3;

    fn has_colors(&self) -> bool {
        false
    }

    fn color(&self, _node: NodeKey) -> Option<Vector3> {
        None
    }

    /// Minimal corners of the cells worth polygonizing.
    fn cells(&self) -> Box<dyn Iterator<Item = NodeKey> + '_>;
}

/// Dense field over `dims` nodes; NaN marks unknown values.
pub struct DenseField {
    pub origin: Point3,
    pub spacing: f64,
    pub dims: [usize; 3],
    pub values: Vec<f64>,
    pub colors: Vec<Vector3>,
}

impl DenseField {
    pub fn new(origin: Point3, spacing: f64, dims: [usize; 3]) -> DenseField {
        DenseField {
            origin,
            spacing,
            dims,
            values: vec![f64::NAN; dims[0] * dims[1] * dims[2]],
            colors: vec![],
        }
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.dims[1] + j) * self.dims[0] + i
    }

    pub fn node_position(&self, i: usize, j: usize, k: usize) -> Point3 {
        self.origin + Vector3::new(i as f64, j as f64, k as f64) * self.spacing
    }

    fn checked_index(&self, node: NodeKey) -> Option<usize> {
        let in_range = |c: i64, n: usize| c >= 0 && (c as usize) < n;
        if in_range(node[0], self.dims[0])
            && in_range(node[1], self.dims[1])
            && in_range(node[2], self.dims[2])
        {
            let [i, j, k] = node;
            Some(self.index(i as usize, j as usize, k as usize))
        } else {
            None
        }
    }
}

impl ScalarField for DenseField {
    fn value(&self, node: NodeKey) -> Option<f64> {
        let v = self.values[self.checked_index(node)?];
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }

    fn position(&self, node: NodeKey) -> Point3 {
        self.origin
            + Vector3::new(node[0] as f64, node[1] as f64, node[2] as f64)
                * self.spacing
    }

    fn has_colors(&self) -> bool {
        !self.colors.is_empty()
    }

    fn color(&self, node: NodeKey) -> Option<Vector3> {
        self.colors.get(self.checked_index(node)?).cloned()
    }

    fn cells(&self) -> Box<dyn Iterator<Item = NodeKey> + '_> {
        let [nx, ny, nz] = self.dims;
        Box::new(
            (0..nz.saturating_sub(1))
                .flat_map(move |k| {
                    (0..ny.saturating_sub(1)).map(move |j| (j, k))
                })
                .flat_map(move |(j, k)| {
                    (0..nx.saturating_sub(1))
                        .map(move |i| [i as i64, j as i64, k as i64])
                }),
        )
    }
}

struct SurfaceBuilder<'a, F: ScalarField> {
    field: &'a F,
    mesh: Mesh,
    edge_vertices: HashMap<(NodeKey, NodeKey), usize>,
}

impl<'a, F: ScalarField> SurfaceBuilder<'a, F> {
    fn edge_vertex(&mut self, a: (NodeKey, f64), b: (NodeKey, f64)) -> usize {
        let key = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        if let Some(&v) = self.edge_vertices.get(&key) {
            return v;
        }

        let t = a.1 / (a.1 - b.1);
        let (pa, pb) = (self.field.position(a.0), self.field.position(b.0));
        let v = self.mesh.vertices.len();
        self.mesh.vertices.push(pa + (pb - pa) * t);
        if self.field.has_colors() {
            let ca = self.field.color(a.0).unwrap_or_else(Vector3::zeros);
            let cb = self.field.color(b.0).unwrap_or_else(Vector3::zeros);
            self.mesh.colors.push(ca + (cb - ca) * t);
        }
        self.edge_vertices.insert(key, v);
        v
    }

    fn push_face(&mut self, mut face: [usize; 3], outward: Vector3) {
        let n = self.mesh.face_cross(face);
        if n.dot(&outward) < 0.0 {
            face.swap(1, 2);
        }
        self.mesh.faces.push(face);
    }

    fn polygonize(&mut self, nodes: [(NodeKey, f64); 4]) {
        let (inside, outside): (Vec<_>, Vec<_>) =
            nodes.iter().cloned().partition(|n| n.1 < 0.0);
        if inside.is_empty() || outside.is_empty() {
            return;
        }

        let centroid = |ns: &[(NodeKey, f64)]| {
            ns.iter()
                .map(|n| self.field.position(n.0).coords)
                .sum::<Vector3>()
                / ns.len() as f64
        };
        let outward = centroid(&outside) - centroid(&inside);

        match inside.len() {
            1 => {
                let a = inside[0];
                let face = [
                    self.edge_vertex(a, outside[0]),
                    self.edge_vertex(a, outside[1]),
                    self.edge_vertex(a, outside[2]),
                ];
                self.push_face(face, outward);
            }
            3 => {
                let o = outside[0];
                let face = [
                    self.edge_vertex(inside[0], o),
                    self.edge_vertex(inside[1], o),
                    self.edge_vertex(inside[2], o),
                ];
                self.push_face(face, outward);
            }
            _ => {
                let (a, b) = (inside[0], inside[1]);
                let (c, d) = (outside[0], outside[1]);
                let ac = self.edge_vertex(a, c);
                let ad = self.edge_vertex(a, d);
                let bd = self.edge_vertex(b, d);
                let bc = self.edge_vertex(b, c);
                self.push_face([ac, ad, bd], outward);
                self.push_face([ac, bd, bc], outward);
            }
        }
    }
}

/// Extracts the zero level set of the field as a triangle mesh with
/// outward-facing triangles. Cells touching unknown nodes are skipped.
pub fn extract_isosurface<F: ScalarField>(field: &F) -> Mesh {
    let mut builder = SurfaceBuilder {
        field,
        mesh: Mesh::default(),
        edge_vertices: HashMap::new(),
    };

    'cells: for cell in field.cells() {
        let mut corners = [([0; 3], 0.0); 8];
        for (b, corner) in corners.iter_mut().enumerate() {
            let key = [
                cell[0] + (b & 1) as i64,
                cell[1] + ((b >> 1) & 1) as i64,
                cell[2] + ((b >> 2) & 1) as i64,
            ];
            match field.value(key) {
                Some(v) => *corner = (key, v),
                None => continue 'cells,
            }
        }

        let num_inside = corners.iter().filter(|c| c.1 < 0.0).count();
        if num_inside == 0 || num_inside == 8 {
            continue;
        }

        for tet in TETRAHEDRA {
            builder.polygonize([
                corners[tet[0]],
                corners[tet[1]],
                corners[tet[2]],
                corners[tet[3]],
            ]);
        }
    }

    builder.mesh
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashSet;

    use crate::mesh::ordered;

    fn sphere_field(n: usize, radius: f64) -> DenseField {
        let spacing = 2.0 / (n - 1) as f64;
        let mut field =
            DenseField::new(Point3::new(-1.0, -1.0, -1.0), spacing, [n, n, n]);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let p = field.node_position(i, j, k);
                    let idx = field.index(i, j, k);
                    field.values[idx] = p.coords.norm() - radius;
                }
            }
        }
        field
    }

    #[test]
    fn test_sphere_is_closed_and_outward() {
        let mesh = extract_isosurface(&sphere_field(21, 0.63));
        assert!(!mesh.is_empty());

        for v in &mesh.vertices {
            assert!((v.coords.norm() - 0.63).abs() < 0.05);
        }

        let mut outward = 0;
        for &face in &mesh.faces {
            let c = (mesh.vertices[face[0]].coords
                + mesh.vertices[face[1]].coords
                + mesh.vertices[face[2]].coords)
                / 3.0;
            if mesh.face_cross(face).dot(&c) > 0.0 {
                outward += 1;
            }
        }
        assert!(outward as f64 >= 0.99 * mesh.faces.len() as f64);

        // Every edge of a closed surface is shared by exactly two faces.
        let mut edge_count = HashMap::<[usize; 2], usize>::new();
        let mut degenerate = HashSet::new();
        for (f_idx, &[v0, v1, v2]) in mesh.faces.iter().enumerate() {
            if v0 == v1 || v1 == v2 || v0 == v2 {
                degenerate.insert(f_idx);
                continue;
            }
            for e in [[v0, v1], [v1, v2], [v2, v0]] {
                *edge_count.entry(ordered(e)).or_default() += 1;
            }
        }
        assert!(degenerate.is_empty());
        assert!(edge_count.values().all(|&c| c == 2));
    }

    #[test]
    fn test_unknown_nodes_are_skipped() {
        let mut field = sphere_field(11, 0.53);
        for v in field.values.iter_mut() {
            *v = f64::NAN;
        }
        assert!(extract_isosurface(&field).is_empty());
    }

    #[test]
    fn test_colors_are_interpolated() {
        let mut field = sphere_field(11, 0.53);
        field.colors = vec![Vector3::new(0.2, 0.4, 0.6); field.values.len()];
        let mesh = extract_isosurface(&field);
        assert_eq!(mesh.colors.len(), mesh.vertices.len());
        for c in &mesh.colors {
            assert!((c - Vector3::new(0.2, 0.4, 0.6)).norm() < 1e-9);
        }
    }
}
