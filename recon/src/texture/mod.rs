pub mod atlas;
pub mod baking;
mod packing;
mod patching;
pub mod selection;
mod textured_mesh;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::ops::Sub;

use nalgebra::{vector, ArrayStorage, Const, Matrix, Matrix3, SVD};
use petgraph::unionfind::UnionFind;

use crate::camera::{Vector2, Vector3};
use crate::mesh::{ordered, Mesh};

pub use textured_mesh::TexturedMesh;

pub type Matrix2 = nalgebra::Matrix2<f64>;
pub type Vector<const D: usize> =
    nalgebra::Vector<f64, Const<D>, ArrayStorage<f64, D, 1>>;

/// Face adjacency across shared edges.
#[derive(Debug, Clone)]
pub struct FaceTopology {
    pub faces_around_edge: HashMap<[usize; 2], Vec<usize>>,
    pub neighbouring_faces: Vec<HashSet<usize>>,
}

impl FaceTopology {
    pub fn new(mesh: &Mesh) -> FaceTopology {
        let mut faces_around_edge = HashMap::<[usize; 2], Vec<usize>>::new();
        for (f_idx, &[v0, v1, v2]) in mesh.faces.iter().enumerate() {
            for e in [[v0, v1], [v0, v2], [v1, v2]] {
                faces_around_edge.entry(ordered(e)).or_default().push(f_idx);
            }
        }

        let mut neighbouring_faces = vec![HashSet::new(); mesh.faces.len()];
        for faces in faces_around_edge.values() {
            for &f0 in faces {
                for &f1 in faces {
                    if f0 != f1 {
                        neighbouring_faces[f0].insert(f1);
                    }
                }
            }
        }

        FaceTopology {
            faces_around_edge,
            neighbouring_faces,
        }
    }
}

pub struct BarycentricCoordinateSystem {
    vs: [Vector2; 3],
    n22: nalgebra::QR<f64, nalgebra::U2, nalgebra::U2>,
}

impl BarycentricCoordinateSystem {
    pub fn new(vs: [Vector2; 3]) -> Option<Self> {
        let m22 = Matrix2::from_columns(&[vs[1] - vs[0], vs[2] - vs[0]]);
        let n22 = m22.qr();
        if n22.is_invertible() {
            Some(Self { vs, n22 })
        } else {
            None // The triangle edges are parallel.
        }
    }

    // `infer` undoes `apply`.

    pub fn infer(&self, v: Vector2) -> Option<Vector3> {
        let l = self.n22.solve(&(v - self.vs[0]))?;
        Some(Vector3::new(1.0 - l[0] - l[1], l[0], l[1]))
    }

    // `u` must sum to one.
    pub fn apply(&self, u: Vector3) -> Vector2 {
        u[0] * self.vs[0] + u[1] * self.vs[1] + u[2] * self.vs[2]
    }
}

pub fn all_nonneg(v: Vector3) -> bool {
    v.iter().all(|&c| c >= 0.0)
}

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Rectangle<T> {
    pub pos: [T; 2],
    pub size: [T; 2],
}

type Comparator<T> = fn(&T, &T) -> Ordering;

pub fn extremum<T: Copy + PartialOrd, I: Iterator<Item = T>>(
    it: I,
    f: fn(I, Comparator<T>) -> Option<T>,
) -> Option<T> {
    f(it, |p, q| p.partial_cmp(q).unwrap_or(Ordering::Equal))
}

impl<T> Rectangle<T> {
    pub fn bounding(ijs: &[[T; 2]]) -> Option<Rectangle<T>>
    where
        T: Copy + PartialOrd + Sub<Output = T>,
    {
        let ijs_coord = |k: usize| ijs.iter().map(move |ij| ij[k]);

        let imin = extremum(ijs_coord(0), Iterator::min_by)?;
        let imax = extremum(ijs_coord(0), Iterator::max_by)?;
        let jmin = extremum(ijs_coord(1), Iterator::min_by)?;
        let jmax = extremum(ijs_coord(1), Iterator::max_by)?;

        Some(Rectangle {
            pos: [imin, jmin],
            size: [imax - imin, jmax - jmin],
        })
    }
}

pub fn dominant_vector<const D: usize>(vs: &[Vector<D>]) -> Option<Vector<D>> {
    if vs.is_empty() {
        return None;
    }
    let mat = Matrix::from_columns(vs);
    let svd = nalgebra::SVD::new(mat, true, false);
    let u = svd.u?;
    Some(Vector::from(u.column(0)))
}

pub fn complement(u0: Vector3) -> Option<(Vector3, Vector3)> {
    let zero = vector![0.0, 0.0, 0.0];
    let m33 = Matrix3::from_columns(&[u0, zero, zero]);
    let svd = SVD::new(m33, true, false);
    let u = svd.u?;
    Some((Vector3::from(u.column(1)), Vector3::from(u.column(2))))
}

pub fn idxs_to_mask(len: usize, idxs: &[usize]) -> Vec<bool> {
    let mut mask = vec![false; len];
    for &i in idxs {
        mask[i] = true;
    }
    mask
}

pub fn mask_to_idxs(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &b)| if b { Some(i) } else { None })
        .collect()
}

/// Maps every element to its position in the slice.
pub fn vec_inv(v: &[usize]) -> HashMap<usize, usize> {
    v.iter().enumerate().map(|(i, &x)| (x, i)).collect()
}

/// Members of the largest set of the partition, smallest index first.
pub fn extract_biggest_partition_component(
    partition: UnionFind<usize>,
) -> Vec<usize> {
    let labels = partition.into_labeling();
    let mut sizes = HashMap::<usize, usize>::new();
    for &l in &labels {
        *sizes.entry(l).or_default() += 1;
    }
    let biggest = sizes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(l, _)| l);
    labels
        .iter()
        .enumerate()
        .filter(|&(_, &l)| Some(l) == biggest)
        .map(|(i, _)| i)
        .collect()
}

// Expects `f` to fail at `bounds[0]` and succeed at `bounds[1]`, in
// either order.
pub fn bisect<T>(
    f: impl Fn(f64) -> Option<T>,
    bounds: [f64; 2],
    rtol: f64,
) -> Option<(f64, T)> {
    let tol = rtol * f64::max(bounds[0].abs(), bounds[1].abs());

    let [mut fails, mut succeeds] = bounds;
    let mut best_result = f(bounds[1])?;

    while (fails - succeeds).abs() > tol {
        let next = (fails + succeeds) / 2.0;
        if let Some(new_best_result) = f(next) {
            best_result = new_best_result;
            succeeds = next;
        } else {
            fails = next;
        }
    }

    Some((succeeds, best_result))
}
