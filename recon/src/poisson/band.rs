use std::collections::{HashMap, HashSet};
use std::ops::{Add, Mul};

use rayon::prelude::*;

use crate::camera::{Point3, Vector3};
use crate::isosurface::{NodeKey, ScalarField};

use super::grid::{Grid, LinearOperator};

// Marks a neighbor outside the band.
const OUTSIDE: usize = usize::MAX;

// Neighbor order: -x, +x, -y, +y, -z, +z.
const OFFSETS: [[i64; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

fn key_of(node: [usize; 3]) -> NodeKey {
    [node[0] as i64, node[1] as i64, node[2] as i64]
}

fn shifted(node: NodeKey, offset: &[i64; 3]) -> NodeKey {
    [node[0] + offset[0], node[1] + offset[1], node[2] + offset[2]]
}

/// Lattice nodes within `radius` cells of some sample. Everything the
/// solver does on a band treats the nodes outside it as known.
pub struct Band {
    pub grid: Grid,
    pub nodes: Vec<NodeKey>,
    index: HashMap<NodeKey, usize>,
    neighbors: Vec<[usize; 6]>,
}

impl Band {
    pub fn new(grid: Grid, points: &[Point3], radius: usize) -> Band {
        let cells: HashSet<NodeKey> =
            points.iter().map(|p| key_of(grid.cell_of(p))).collect();

        let r = radius as i64;
        let mut nodes = HashSet::new();
        for cell in cells {
            for dz in -r..=r + 1 {
                for dy in -r..=r + 1 {
                    for dx in -r..=r + 1 {
                        let node = shifted(cell, &[dx, dy, dz]);
                        if grid_contains(&grid, node) {
                            nodes.insert(node);
                        }
                    }
                }
            }
        }
        let mut nodes: Vec<NodeKey> = nodes.into_iter().collect();
        nodes.sort_unstable();

        let index: HashMap<NodeKey, usize> =
            nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let neighbors = nodes
            .par_iter()
            .map(|&node| {
                let mut adjacent = [OUTSIDE; 6];
                for (adj, offset) in adjacent.iter_mut().zip(OFFSETS.iter()) {
                    if let Some(&i) = index.get(&shifted(node, offset)) {
                        *adj = i;
                    }
                }
                adjacent
            })
            .collect();

        Band {
            grid,
            nodes,
            index,
            neighbors,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn position(&self, node: NodeKey) -> Point3 {
        self.grid.origin
            + Vector3::new(node[0] as f64, node[1] as f64, node[2] as f64)
                * self.grid.spacing
    }

    /// Calls `f` with each band node index and trilinear weight around
    /// `p`. Corners outside the band are left out.
    pub fn splat<F: FnMut(usize, f64)>(&self, p: &Point3, mut f: F) {
        self.grid.splat_nodes(p, |node, w| {
            if let Some(&i) = self.index.get(&key_of(node)) {
                f(i, w);
            }
        });
    }

    /// Trilinear sample, or `None` when a corner lies outside the band.
    pub fn sample(&self, values: &[f64], p: &Point3) -> Option<f64> {
        let mut sum = 0.0;
        let mut complete = true;
        self.grid.splat_nodes(p, |node, w| {
            match self.index.get(&key_of(node)) {
                Some(&i) => sum += values[i] * w,
                None => complete = false,
            }
        });
        if complete {
            Some(sum)
        } else {
            None
        }
    }

    /// Separable [1, 2, 1] blur. Values beyond the band count as zero.
    pub fn blur<T>(&self, values: &mut Vec<T>)
    where
        T: Copy + Send + Sync + Add<Output = T> + Mul<f64, Output = T>,
    {
        for axis in 0..3 {
            let src = values.clone();
            values.par_iter_mut().enumerate().for_each(|(idx, v)| {
                let adjacent = &self.neighbors[idx];
                let mut acc = src[idx] * 0.5;
                for &n in &adjacent[2 * axis..2 * axis + 2] {
                    if n != OUTSIDE {
                        acc = acc + src[n] * 0.25;
                    }
                }
                *v = acc;
            });
        }
    }

    /// Right-hand side of the Poisson equation for a node vector field,
    /// scaled like `Grid::divergence_rhs`.
    pub fn divergence_rhs(&self, field: &[Vector3]) -> Vec<f64> {
        let half = self.grid.spacing / 2.0;
        self.neighbors
            .par_iter()
            .map(|adjacent| {
                let mut div = 0.0;
                for a in 0..3 {
                    let (prev, next) = (adjacent[2 * a], adjacent[2 * a + 1]);
                    if next != OUTSIDE {
                        div += field[next][a];
                    }
                    if prev != OUTSIDE {
                        div -= field[prev][a];
                    }
                }
                -half * div
            })
            .collect()
    }

    /// Moves the known values of the lattice nodes bordering the band to
    /// the right-hand side. Nodes beyond the lattice are zero.
    pub fn add_boundary<S>(&self, rhs: &mut [f64], outer: S)
    where
        S: Fn(&Point3) -> f64 + Sync,
    {
        rhs.par_iter_mut().enumerate().for_each(|(idx, b)| {
            let node = self.nodes[idx];
            for (&adj, offset) in self.neighbors[idx].iter().zip(OFFSETS.iter())
            {
                let outside = shifted(node, offset);
                if adj == OUTSIDE && grid_contains(&self.grid, outside) {
                    *b += outer(&self.position(outside));
                }
            }
        });
    }
}

fn grid_contains(grid: &Grid, node: NodeKey) -> bool {
    let last = grid.cells as i64;
    node.iter().all(|&c| c >= 0 && c <= last)
}

// The lattice Laplacian restricted to the band.
impl LinearOperator for Band {
    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn apply(&self, x: &[f64], out: &mut [f64]) {
        out.par_iter_mut().enumerate().for_each(|(idx, out)| {
            let mut acc = 6.0 * x[idx];
            for &n in &self.neighbors[idx] {
                if n != OUTSIDE {
                    acc -= x[n];
                }
            }
            *out = acc;
        });
    }
}

/// Scalar values on the nodes of a band.
pub struct BandField<'a> {
    pub band: &'a Band,
    pub values: Vec<f64>,
}

impl<'a> ScalarField for BandField<'a> {
    fn value(&self, node: NodeKey) -> Option<f64> {
        self.band.index.get(&node).map(|&i| self.values[i])
    }

    fn position(&self, node: NodeKey) -> Point3 {
        self.band.position(node)
    }

    fn cells(&self) -> Box<dyn Iterator<Item = NodeKey> + '_> {
        Box::new(self.band.nodes.iter().cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use base::assert_eq_f32;

    use crate::poisson::grid::solve_cg;

    fn unit_grid(cells: usize) -> Grid {
        Grid {
            origin: Point3::origin(),
            cells,
            spacing: 1.0 / cells as f64,
        }
    }

    #[test]
    fn test_band_covers_samples() {
        let grid = unit_grid(32);
        let band = Band::new(grid, &[Point3::new(0.5, 0.5, 0.5)], 2);
        assert_eq!(band.len(), 6 * 6 * 6);

        let corner = Band::new(grid, &[Point3::origin()], 2);
        assert_eq!(corner.len(), 4 * 4 * 4);

        let values = vec![1.0; band.len()];
        assert_eq_f32!(
            band.sample(&values, &Point3::new(0.51, 0.49, 0.5)).unwrap(),
            1.0
        );
        assert!(band.sample(&values, &Point3::new(0.9, 0.5, 0.5)).is_none());
    }

    #[test]
    fn test_band_solve_matches_known_boundary() {
        // A linear function is harmonic, so fixing it outside the band
        // must reproduce it inside.
        let grid = unit_grid(16);
        let band = Band::new(grid, &[Point3::new(0.5, 0.5, 0.5)], 3);
        let linear = |p: &Point3| 1.0 + p.x - 2.0 * p.y + 0.5 * p.z;

        let mut b = vec![0.0; band.len()];
        band.add_boundary(&mut b, linear);
        let mut x = vec![0.0; band.len()];
        solve_cg(&band, &b, &mut x, 500, 1e-12);
        for (node, x) in band.nodes.iter().zip(x.iter()) {
            assert_eq_f32!(*x, linear(&band.position(*node)), 1e-6);
        }
    }

    #[test]
    fn test_blur_drops_values_beyond_band() {
        let band = Band::new(unit_grid(16), &[Point3::new(0.5, 0.5, 0.5)], 1);
        let mut values = vec![1.0; band.len()];
        band.blur(&mut values);
        let inner = band.index[&[8, 8, 8]];
        let edge = band.index[&[7, 8, 8]];
        assert_eq_f32!(values[inner], 1.0);
        assert_eq_f32!(values[edge], 0.75);
    }
}
