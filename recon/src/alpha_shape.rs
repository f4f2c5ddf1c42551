use log::{debug, warn};
use rayon::prelude::*;

use base::defs::Result;

use crate::camera::Vector3;
use crate::isosurface::{extract_isosurface, DenseField};
use crate::mesh::Mesh;
use crate::point_cloud::{index_points, nearest, PointCloud};

pub const MAX_NODES_PER_AXIS: usize = 160;
pub const MIN_ALPHA: f64 = 1e-4;

/// Boundary of the union of balls of radius `alpha` around the samples.
/// Colors are carried over from the closest sample. On large clouds the
/// lattice is coarsened and `alpha` is raised to at least its spacing.
pub fn reconstruct(cloud: &PointCloud, alpha: f64) -> Result<Mesh> {
    let (min, max) = match cloud.bounds() {
        Some(bounds) => bounds,
        None => {
            warn!("alpha shape skipped: no points");
            return Ok(Mesh::default());
        }
    };

    let mut alpha = alpha.max(MIN_ALPHA);
    let padded = |alpha: f64| (max - min).max() + alpha * 3.0;
    let mut spacing = alpha / 2.0;
    let max_cells = (MAX_NODES_PER_AXIS - 1) as f64;
    if (padded(alpha) / spacing).ceil() as usize + 1 > MAX_NODES_PER_AXIS {
        spacing = padded(alpha) / max_cells;
        if alpha < spacing {
            alpha = spacing;
            spacing = padded(alpha) / max_cells;
        }
        warn!(
            "alpha shape lattice coarsened to spacing {:.4}, alpha {:.4}",
            spacing, alpha
        );
    }

    let pad = Vector3::repeat(alpha * 1.5);
    let (origin, extent) = (min - pad, (max - min) + pad * 2.0);
    let dims = [
        (extent.x / spacing).ceil() as usize + 1,
        (extent.y / spacing).ceil() as usize + 1,
        (extent.z / spacing).ceil() as usize + 1,
    ];
    debug!("alpha shape lattice {:?} spacing {:.4}", dims, spacing);

    let tree = index_points(&cloud.points)?;
    let mut field = DenseField::new(origin, spacing, dims);
    let samples = (0..field.values.len())
        .into_par_iter()
        .map(|idx| -> Result<(f64, usize)> {
            let (i, j, k) = (
                idx % dims[0],
                (idx / dims[0]) % dims[1],
                idx / (dims[0] * dims[1]),
            );
            let p = field.node_position(i, j, k);
            let closest = nearest(&tree, &p, 1)?;
            Ok(closest
                .first()
                .map(|&(d2, i)| (d2.sqrt() - alpha, i))
                .unwrap_or((f64::NAN, 0)))
        })
        .collect::<Result<Vec<(f64, usize)>>>()?;

    field.values = samples.iter().map(|s| s.0).collect();
    if cloud.has_colors() {
        field.colors = samples.iter().map(|s| cloud.colors[s.1]).collect();
    }

    Ok(extract_isosurface(&field))
}
