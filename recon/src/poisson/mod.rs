mod band;
mod grid;

use log::debug;
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::camera::{Point3, Vector3};
use crate::isosurface::{extract_isosurface, DenseField};
use crate::mesh::Mesh;
use crate::point_cloud::{index_points, nearest, PointCloud};

use band::{Band, BandField};
use grid::{solve_cg, Grid};

// Finest lattice that is solved densely. Deeper levels are solved on a
// band of nodes around the samples.
pub const MAX_DENSE_DEPTH: u32 = 7;

// Band half-width in cells, widened where samples are sparser than that.
pub const MIN_BAND_RADIUS: usize = 3;
pub const MAX_BAND_RADIUS: usize = 8;

pub struct Params {
    // Running at depth d corresponds to solving on a 2^d x 2^d x 2^d
    // lattice.
    pub depth: u32,

    // The ratio between the edge of the cube used for reconstruction
    // and the largest extent of the samples' bounding box.
    pub scale: f64,

    // Depth of the coarsest lattice of the cascade.
    pub base_depth: u32,

    // Conjugate-gradient iterations at the base depth.
    pub base_iters: usize,

    // Conjugate-gradient iterations at every finer depth.
    pub iters: usize,

    // Relative residual at which the solver stops early.
    pub cg_accuracy: f64,

    // Fraction of the lowest-density vertices to be discarded.
    pub density_quantile: f64,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            depth: 8,
            scale: 1.1,
            base_depth: 4,
            base_iters: 200,
            iters: 60,
            cg_accuracy: 1e-6,
            density_quantile: 0.02,
        }
    }
}

/// Linearly interpolated quantile of unsorted values.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.max(0.0).min(1.0) * (sorted.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    let t = pos - lo as f64;
    Some(sorted[lo] * (1.0 - t) + sorted[hi] * t)
}

fn bounding_cube(cloud: &PointCloud, scale: f64) -> Result<(Point3, f64)> {
    let (min, max) = cloud.bounds().ok_or_else(|| {
        Error::new(EmptyGeometry, "no samples to reconstruct".to_string())
    })?;
    let extent = (max - min).max();
    if !(extent > 1e-9) {
        let desc = "samples span a degenerate bounding box".to_string();
        return Err(Error::new(EmptyGeometry, desc));
    }
    let size = extent * scale;
    let center = nalgebra::center(&min, &max);
    Ok((center - Vector3::repeat(size / 2.0), size))
}

/// Mean distance from a sample to its closest neighbor.
fn mean_sample_spacing(cloud: &PointCloud) -> Result<f64> {
    if cloud.len() < 2 {
        return Ok(0.0);
    }
    let tree = index_points(&cloud.points)?;
    let total = cloud
        .points
        .par_iter()
        .map(|p| -> Result<f64> {
            let closest = nearest(&tree, p, 2)?;
            Ok(closest.last().map(|&(d2, _)| d2.sqrt()).unwrap_or(0.0))
        })
        .collect::<Result<Vec<f64>>>()?
        .iter()
        .sum::<f64>();
    Ok(total / cloud.len() as f64)
}

// Inward normal field of the samples, smoothed.
fn normal_field(grid: &Grid, cloud: &PointCloud) -> Vec<Vector3> {
    let mut field = vec![Vector3::zeros(); grid.len()];
    let volume = grid.spacing.powi(3);
    for (p, n) in cloud.points.iter().zip(cloud.normals.iter()) {
        grid.splat(p, |idx, w| field[idx] -= n * (w / volume));
    }
    grid.blur(&mut field);
    field
}

fn band_normal_field(band: &Band, cloud: &PointCloud) -> Vec<Vector3> {
    let mut field = vec![Vector3::zeros(); band.len()];
    let volume = band.grid.spacing.powi(3);
    for (p, n) in cloud.points.iter().zip(cloud.normals.iter()) {
        band.splat(p, |idx, w| field[idx] -= n * (w / volume));
    }
    band.blur(&mut field);
    field
}

/// Indicator function of a cascade level. A band level falls back to the
/// coarser level wherever it has no nodes.
enum Solution {
    Dense {
        grid: Grid,
        values: Vec<f64>,
    },
    Band {
        band: Band,
        values: Vec<f64>,
        coarse: Box<Solution>,
    },
}

impl Solution {
    fn sample(&self, p: &Point3) -> f64 {
        match self {
            Solution::Dense { grid, values } => grid.sample(values, p),
            Solution::Band {
                band,
                values,
                coarse,
            } => band.sample(values, p).unwrap_or_else(|| coarse.sample(p)),
        }
    }

    /// Zero level set of `iso - chi`.
    fn extract(&self, iso: f64) -> Mesh {
        match self {
            Solution::Dense { grid, values } => {
                let n = grid.nodes_per_axis();
                let mut field =
                    DenseField::new(grid.origin, grid.spacing, [n, n, n]);
                field.values = values.iter().map(|c| iso - c).collect();
                extract_isosurface(&field)
            }
            Solution::Band { band, values, .. } => {
                extract_isosurface(&BandField {
                    band,
                    values: values.iter().map(|c| iso - c).collect(),
                })
            }
        }
    }

    /// Smoothed sample density at each of `vertices`.
    fn densities(&self, cloud: &PointCloud, vertices: &[Point3]) -> Vec<f64> {
        match self {
            Solution::Dense { grid, .. } => {
                let mut density = vec![0.0; grid.len()];
                for p in &cloud.points {
                    grid.splat(p, |idx, w| density[idx] += w);
                }
                grid.blur(&mut density);
                vertices
                    .par_iter()
                    .map(|v| grid.sample(&density, v))
                    .collect()
            }
            Solution::Band { band, .. } => {
                let mut density = vec![0.0; band.len()];
                for p in &cloud.points {
                    band.splat(p, |idx, w| density[idx] += w);
                }
                band.blur(&mut density);
                vertices
                    .par_iter()
                    .map(|v| band.sample(&density, v).unwrap_or(0.0))
                    .collect()
            }
        }
    }
}

fn lattice(origin: Point3, size: f64, depth: u32) -> Grid {
    let cells = 1 << depth;
    Grid {
        origin,
        cells,
        spacing: size / cells as f64,
    }
}

// Solves one level on the band around the samples, holding the coarser
// solution fixed outside it.
fn solve_band(
    grid: Grid,
    cloud: &PointCloud,
    sample_spacing: f64,
    coarse: Solution,
    params: &Params,
) -> Solution {
    let radius = ((sample_spacing / grid.spacing).ceil() as usize + 1)
        .max(MIN_BAND_RADIUS)
        .min(MAX_BAND_RADIUS);
    let band = Band::new(grid, &cloud.points, radius);

    let mut b = band.divergence_rhs(&band_normal_field(&band, cloud));
    band.add_boundary(&mut b, |p| coarse.sample(p));
    let mut x: Vec<f64> = band
        .nodes
        .par_iter()
        .map(|&node| coarse.sample(&band.position(node)))
        .collect();
    let done = solve_cg(&band, &b, &mut x, params.iters, params.cg_accuracy);
    debug!(
        "poisson {} cells: {} band nodes (radius {}), {} iterations",
        grid.cells,
        band.len(),
        radius,
        done
    );

    Solution::Band {
        band,
        values: x,
        coarse: Box::new(coarse),
    }
}

/// Solves for the indicator function of the oriented samples, coarse to
/// fine. Up to `MAX_DENSE_DEPTH` the whole lattice is solved, beyond it
/// only a band around the samples.
fn solve_indicator(cloud: &PointCloud, params: &Params) -> Result<Solution> {
    let (origin, size) = bounding_cube(cloud, params.scale)?;
    let dense_depth = params.depth.min(MAX_DENSE_DEPTH);

    let mut prev: Option<(Grid, Vec<f64>)> = None;
    for d in params.base_depth.min(dense_depth)..=dense_depth {
        let grid = lattice(origin, size, d);
        let b = grid.divergence_rhs(&normal_field(&grid, cloud));
        let (mut x, iters) = match &prev {
            Some((coarse, values)) => {
                (grid.prolongate(coarse, values), params.iters)
            }
            None => (vec![0.0; grid.len()], params.base_iters),
        };
        let done = solve_cg(&grid, &b, &mut x, iters, params.cg_accuracy);
        debug!("poisson depth {}: {} iterations", d, done);

        prev = Some((grid, x));
    }

    let (grid, values) = prev.ok_or_else(|| {
        Error::new(InconsistentState, "empty poisson cascade".to_string())
    })?;
    let mut solution = Solution::Dense { grid, values };

    if params.depth > MAX_DENSE_DEPTH {
        let spacing = mean_sample_spacing(cloud)?;
        for d in MAX_DENSE_DEPTH + 1..=params.depth {
            let grid = lattice(origin, size, d);
            solution = solve_band(grid, cloud, spacing, solution, params);
        }
    }
    Ok(solution)
}

/// Reconstructs a watertight surface from an oriented point cloud and
/// trims its least supported vertices.
pub fn reconstruct(cloud: &PointCloud, params: &Params) -> Result<Mesh> {
    if !cloud.has_normals() {
        let desc = "poisson reconstruction requires normals".to_string();
        return Err(Error::new(InconsistentState, desc));
    }

    let solution = solve_indicator(cloud, params)?;

    let iso = cloud
        .points
        .par_iter()
        .map(|p| solution.sample(p))
        .sum::<f64>()
        / cloud.len() as f64;

    let mut mesh = solution.extract(iso);
    debug!(
        "poisson surface: {} vertices, {} triangles",
        mesh.vertices.len(),
        mesh.faces.len()
    );
    if mesh.is_empty() {
        return Ok(mesh);
    }

    let densities = solution.densities(cloud, &mesh.vertices);
    if let Some(threshold) = quantile(&densities, params.density_quantile) {
        let remove: Vec<bool> =
            densities.iter().map(|&d| d < threshold).collect();
        mesh.remove_vertices_by_mask(&remove);
    }

    if cloud.has_colors() {
        let tree = index_points(&cloud.points)?;
        mesh.colors = mesh
            .vertices
            .par_iter()
            .map(|v| -> Result<Vector3> {
                let closest = nearest(&tree, v, 1)?;
                Ok(closest
                    .first()
                    .map(|&(_, i)| cloud.colors[i])
                    .unwrap_or_else(Vector3::zeros))
            })
            .collect::<Result<Vec<Vector3>>>()?;
    }

    Ok(mesh)
}
