use rayon::prelude::*;

use crate::camera::{Point3, Vector3};

/// Symmetric positive definite system solved by `solve_cg`.
pub trait LinearOperator: Sync {
    fn len(&self) -> usize;

    fn apply(&self, x: &[f64], out: &mut [f64]);
}

/// Regular cubic lattice of `cells + 1` nodes per axis.
#[derive(Clone, Copy, Debug)]
pub struct Grid {
    pub origin: Point3,
    pub cells: usize,
    pub spacing: f64,
}

impl Grid {
    pub fn nodes_per_axis(&self) -> usize {
        self.cells + 1
    }

    pub fn len(&self) -> usize {
        self.nodes_per_axis().pow(3)
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        let n = self.nodes_per_axis();
        (k * n + j) * n + i
    }

    pub fn node_position(&self, i: usize, j: usize, k: usize) -> Point3 {
        self.origin + Vector3::new(i as f64, j as f64, k as f64) * self.spacing
    }

    /// Lower node of the cell containing `p`.
    pub fn cell_of(&self, p: &Point3) -> [usize; 3] {
        self.locate(p).0
    }

    // Lower node and fractional offsets of the cell containing `p`.
    fn locate(&self, p: &Point3) -> ([usize; 3], [f64; 3]) {
        let local = (p - self.origin) / self.spacing;
        let mut base = [0; 3];
        let mut frac = [0.0; 3];
        for a in 0..3 {
            let c = local[a].floor().max(0.0).min(self.cells as f64 - 1.0);
            base[a] = c as usize;
            frac[a] = (local[a] - c).max(0.0).min(1.0);
        }
        (base, frac)
    }

    /// Calls `f` with each node coordinate and trilinear weight around `p`.
    pub fn splat_nodes<F>(&self, p: &Point3, mut f: F)
    where
        F: FnMut([usize; 3], f64),
    {
        let ([i, j, k], [fx, fy, fz]) = self.locate(p);
        let lerp = |d: usize, t: f64| if d == 1 { t } else { 1.0 - t };
        for b in 0..8 {
            let (dx, dy, dz) = (b & 1, (b >> 1) & 1, (b >> 2) & 1);
            let w = lerp(dx, fx) * lerp(dy, fy) * lerp(dz, fz);
            f([i + dx, j + dy, k + dz], w);
        }
    }

    /// Calls `f` with each node index and trilinear weight around `p`.
    pub fn splat<F: FnMut(usize, f64)>(&self, p: &Point3, mut f: F) {
        self.splat_nodes(p, |[i, j, k], w| f(self.index(i, j, k), w));
    }

    pub fn sample(&self, values: &[f64], p: &Point3) -> f64 {
        let mut sum = 0.0;
        self.splat(p, |idx, w| sum += values[idx] * w);
        sum
    }

    /// Separable [1, 2, 1] blur. Values beyond the lattice count as zero.
    pub fn blur<T>(&self, values: &mut Vec<T>)
    where
        T: Copy
            + Send
            + Sync
            + std::ops::Add<Output = T>
            + std::ops::Mul<f64, Output = T>,
    {
        let n = self.nodes_per_axis();
        let strides = [1, n, n * n];
        for &stride in &strides {
            let src = values.clone();
            values.par_iter_mut().enumerate().for_each(|(idx, v)| {
                let c = (idx / stride) % n;
                let mut acc = src[idx] * 0.5;
                if c > 0 {
                    acc = acc + src[idx - stride] * 0.25;
                }
                if c + 1 < n {
                    acc = acc + src[idx + stride] * 0.25;
                }
                *v = acc;
            });
        }
    }

    /// Right-hand side of the Poisson equation for a node vector field,
    /// scaled to match the lattice Laplacian.
    pub fn divergence_rhs(&self, field: &[Vector3]) -> Vec<f64> {
        let n = self.nodes_per_axis();
        let strides = [1, n, n * n];
        let half = self.spacing / 2.0;
        (0..self.len())
            .into_par_iter()
            .map(|idx| {
                let mut div = 0.0;
                for (a, &stride) in strides.iter().enumerate() {
                    let c = (idx / stride) % n;
                    let next =
                        if c + 1 < n { field[idx + stride][a] } else { 0.0 };
                    let prev =
                        if c > 0 { field[idx - stride][a] } else { 0.0 };
                    div += next - prev;
                }
                -half * div
            })
            .collect()
    }

    /// Samples a coarser solution at every node of this lattice.
    pub fn prolongate(&self, coarse: &Grid, values: &[f64]) -> Vec<f64> {
        let n = self.nodes_per_axis();
        (0..self.len())
            .into_par_iter()
            .map(|idx| {
                let (i, j, k) = (idx % n, (idx / n) % n, idx / (n * n));
                coarse.sample(values, &self.node_position(i, j, k))
            })
            .collect()
    }
}

// The 7-point negative Laplacian, scaled by spacing squared, with zero
// Dirichlet boundary.
impl LinearOperator for Grid {
    fn len(&self) -> usize {
        Grid::len(self)
    }

    fn apply(&self, x: &[f64], out: &mut [f64]) {
        let n = self.nodes_per_axis();
        out.par_chunks_mut(n * n).enumerate().for_each(|(k, slice)| {
            for j in 0..n {
                for i in 0..n {
                    let idx = self.index(i, j, k);
                    let mut acc = 6.0 * x[idx];
                    if i > 0 {
                        acc -= x[idx - 1];
                    }
                    if i + 1 < n {
                        acc -= x[idx + 1];
                    }
                    if j > 0 {
                        acc -= x[idx - n];
                    }
                    if j + 1 < n {
                        acc -= x[idx + n];
                    }
                    if k > 0 {
                        acc -= x[idx - n * n];
                    }
                    if k + 1 < n {
                        acc -= x[idx + n * n];
                    }
                    slice[j * n + i] = acc;
                }
            }
        });
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.par_iter().zip(b.par_iter()).map(|(x, y)| x * y).sum()
}

/// Conjugate gradients on `op`, starting from `x`. Returns the number of
/// iterations performed.
pub fn solve_cg<A: LinearOperator>(
    op: &A,
    b: &[f64],
    x: &mut [f64],
    max_iters: usize,
    accuracy: f64,
) -> usize {
    let len = op.len();
    let mut r = vec![0.0; len];
    op.apply(x, &mut r);
    r.par_iter_mut().zip(b.par_iter()).for_each(|(r, b)| *r = b - *r);

    let b_norm = dot(b, b).sqrt();
    if b_norm == 0.0 {
        return 0;
    }

    let mut p = r.clone();
    let mut ap = vec![0.0; len];
    let mut rr = dot(&r, &r);

    for iter in 0..max_iters {
        if rr.sqrt() <= accuracy * b_norm {
            return iter;
        }

        op.apply(&p, &mut ap);
        let pap = dot(&p, &ap);
        if pap <= 0.0 {
            return iter;
        }
        let alpha = rr / pap;

        x.par_iter_mut()
            .zip(p.par_iter())
            .for_each(|(x, p)| *x += alpha * p);
        r.par_iter_mut()
            .zip(ap.par_iter())
            .for_each(|(r, ap)| *r -= alpha * ap);

        let rr_next = dot(&r, &r);
        let beta = rr_next / rr;
        rr = rr_next;
        p.par_iter_mut()
            .zip(r.par_iter())
            .for_each(|(p, r)| *p = r + beta * *p);
    }

    max_iters
}
