use std::cmp::Ordering;
use std::collections::BTreeMap;

use kiddo::distance::squared_euclidean;
use kiddo::KdTree;
use log::debug;
use nalgebra::SymmetricEigen;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::camera::{Matrix3, Point3, Vector3};
use crate::frame::ViewFrame;

pub type PointIndex = KdTree<f64, usize, 3>;

pub const OUTLIER_NEIGHBORS: usize = 20;
pub const OUTLIER_STD_RATIO: f64 = 2.0;
pub const NORMAL_MAX_NEIGHBORS: usize = 30;

/// Points with optional per-point colors (RGB in [0,1]) and normals.
/// Either attribute vector is empty or as long as `points`.
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    pub points: Vec<Point3>,
    pub colors: Vec<Vector3>,
    pub normals: Vec<Vector3>,
}

fn kd_err(err: kiddo::ErrorKind) -> Error {
    Error::new(MalformedData, format!("spatial index failure: {:?}", err))
}

pub fn index_points(points: &[Point3]) -> Result<PointIndex> {
    let mut tree = KdTree::new();
    for (i, p) in points.iter().enumerate() {
        tree.add(p.coords.as_ref(), i).map_err(kd_err)?;
    }
    Ok(tree)
}

/// Returns `(squared distance, index)` of the `k` nearest points.
pub fn nearest(
    tree: &PointIndex,
    p: &Point3,
    k: usize,
) -> Result<Vec<(f64, usize)>> {
    Ok(tree
        .nearest(p.coords.as_ref(), k, &squared_euclidean)
        .map_err(kd_err)?
        .into_iter()
        .map(|(d, &i)| (d, i))
        .collect())
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_colors(&self) -> bool {
        !self.colors.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    pub fn append(&mut self, mut other: PointCloud) {
        if self.is_empty() {
            *self = other;
            return;
        }
        if self.has_colors() != other.has_colors() {
            self.colors.clear();
            other.colors.clear();
        }
        if self.has_normals() != other.has_normals() {
            self.normals.clear();
            other.normals.clear();
        }
        self.points.append(&mut other.points);
        self.colors.append(&mut other.colors);
        self.normals.append(&mut other.normals);
    }

    pub fn bounds(&self) -> Option<(Point3, Point3)> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(p), hi.sup(p))
        }))
    }

    pub fn centroid(&self) -> Option<Point3> {
        if self.is_empty() {
            return None;
        }
        let sum: Vector3 = self.points.iter().map(|p| p.coords).sum();
        Some(Point3::from(sum / self.len() as f64))
    }

    // Keeps the points whose mask entry is set, preserving their order.
    fn retain_mask(&mut self, mask: &[bool]) {
        let mut j = 0;
        for i in 0..self.points.len() {
            if mask[i] {
                self.points.swap(i, j);
                if self.has_colors() {
                    self.colors.swap(i, j);
                }
                if self.has_normals() {
                    self.normals.swap(i, j);
                }
                j += 1;
            }
        }
        self.points.truncate(j);
        if self.has_colors() {
            self.colors.truncate(j);
        }
        if self.has_normals() {
            self.normals.truncate(j);
        }
    }

    fn select(&self, idxs: &[usize]) -> PointCloud {
        PointCloud {
            points: idxs.iter().map(|&i| self.points[i]).collect(),
            colors: if self.has_colors() {
                idxs.iter().map(|&i| self.colors[i]).collect()
            } else {
                vec![]
            },
            normals: if self.has_normals() {
                idxs.iter().map(|&i| self.normals[i]).collect()
            } else {
                vec![]
            },
        }
    }

    /// Replaces the points of every occupied voxel by their average.
    pub fn voxel_down_sample(&self, voxel_size: f64) -> PointCloud {
        let (lo, _) = match self.bounds() {
            Some(b) if voxel_size > 0.0 => b,
            _ => return self.clone(),
        };
        let origin = lo.coords - Vector3::repeat(voxel_size / 2.0);

        #[derive(Default)]
        struct Cell {
            point: Vector3,
            color: Vector3,
            normal: Vector3,
            count: usize,
        }

        let mut cells = BTreeMap::<[i64; 3], Cell>::new();
        for (i, p) in self.points.iter().enumerate() {
            let rel = (p.coords - origin) / voxel_size;
            let key = [
                rel[0].floor() as i64,
                rel[1].floor() as i64,
                rel[2].floor() as i64,
            ];
            let cell = cells.entry(key).or_default();
            cell.point += p.coords;
            if self.has_colors() {
                cell.color += self.colors[i];
            }
            if self.has_normals() {
                cell.normal += self.normals[i];
            }
            cell.count += 1;
        }

        let mut cloud = PointCloud::default();
        for cell in cells.values() {
            let n = cell.count as f64;
            cloud.points.push(Point3::from(cell.point / n));
            if self.has_colors() {
                cloud.colors.push(cell.color / n);
            }
            if self.has_normals() {
                let normal = cell.normal.try_normalize(1e-12);
                cloud.normals.push(normal.unwrap_or_else(Vector3::z));
            }
        }
        cloud
    }

    /// Drops points whose mean distance to their neighbours exceeds the
    /// global mean by more than `std_ratio` standard deviations.
    pub fn remove_statistical_outliers(
        &mut self,
        num_neighbors: usize,
        std_ratio: f64,
    ) -> Result<()> {
        if self.len() < 2 || num_neighbors == 0 {
            return Ok(());
        }

        let tree = index_points(&self.points)?;
        let avg_dists = self
            .points
            .par_iter()
            .map(|p| -> Result<f64> {
                let found = nearest(&tree, p, num_neighbors)?;
                let sum: f64 = found.iter().map(|(d, _)| d.sqrt()).sum();
                Ok(sum / found.len().max(1) as f64)
            })
            .collect::<Result<Vec<f64>>>()?;

        let n = avg_dists.len() as f64;
        let mean = avg_dists.iter().sum::<f64>() / n;
        let var = avg_dists.iter().map(|d| (d - mean).powi(2)).sum::<f64>()
            / (n - 1.0).max(1.0);
        let threshold = mean + std_ratio * var.sqrt();

        let mask: Vec<bool> = avg_dists.iter().map(|&d| d <= threshold).collect();
        self.retain_mask(&mask);
        Ok(())
    }

    /// Estimates normals by PCA over a hybrid neighbourhood: at most
    /// `max_neighbors` points within `radius`.
    pub fn estimate_normals(
        &mut self,
        radius: f64,
        max_neighbors: usize,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let tree = index_points(&self.points)?;
        let radius_sq = radius * radius;
        let points = &self.points;
        self.normals = points
            .par_iter()
            .map(|p| -> Result<Vector3> {
                let found = nearest(&tree, p, max_neighbors)?;
                let neighbours: Vec<Vector3> = found
                    .iter()
                    .filter(|(d, _)| *d <= radius_sq)
                    .map(|&(_, i)| points[i].coords)
                    .collect();
                Ok(pca_normal(&neighbours).unwrap_or_else(Vector3::z))
            })
            .collect::<Result<Vec<Vector3>>>()?;
        Ok(())
    }

    /// Flips normals so that they point away from the cloud centroid.
    pub fn orient_normals_outward(&mut self) {
        let center = match self.centroid() {
            Some(c) => c,
            None => return,
        };
        for (p, n) in self.points.iter().zip(self.normals.iter_mut()) {
            if n.dot(&(p - center)) < 0.0 {
                *n = -*n;
            }
        }
    }

    /// Preview subset: optional voxel pass, then a random subset of at
    /// most `max_points` points (0 means no limit).
    pub fn limited(&self, voxel_size: f64, max_points: usize) -> PointCloud {
        let cloud = if voxel_size > 0.0 {
            self.voxel_down_sample(voxel_size)
        } else {
            self.clone()
        };
        if max_points == 0 || cloud.len() <= max_points {
            return cloud;
        }

        let mut idxs: Vec<usize> = (0..cloud.len()).collect();
        select_random_indices(&mut idxs, max_points);
        idxs.sort_unstable();
        cloud.select(&idxs)
    }
}

fn pca_normal(neighbours: &[Vector3]) -> Option<Vector3> {
    if neighbours.len() < 3 {
        return None;
    }
    let n = neighbours.len() as f64;
    let mean: Vector3 = neighbours.iter().sum::<Vector3>() / n;
    let mut cov = Matrix3::zeros();
    for v in neighbours {
        let d = v - mean;
        cov += d * d.transpose();
    }
    let eigen = SymmetricEigen::new(cov / n);
    let (k, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))?;
    eigen.eigenvectors.column(k).into_owned().try_normalize(1e-12)
}

fn select_random_indices(idxs: &mut Vec<usize>, num: usize) {
    if num >= idxs.len() {
        return;
    }

    // Deterministic generator keeps repeated runs consistent.
    let mut rng = StdRng::seed_from_u64(0);

    for i in 0..num {
        let j = rng.gen_range(i..idxs.len());
        idxs.swap(i, j);
    }

    idxs.truncate(num);
}

/// Back-projects the valid depth pixels of a frame into world space,
/// colored from the (possibly differently sized) color image.
pub fn back_project_frame(frame: &ViewFrame, depth_far: f64) -> PointCloud {
    let (dw, dh) = frame.depth.dimensions();
    let (cw, ch) = frame.color.dimensions();
    let (sx, sy) = (cw as f64 / dw as f64, ch as f64 / dh as f64);

    let mut cloud = PointCloud::default();
    for (x, y, d) in frame.depth.enumerate_pixels() {
        let d = d[0] as f64;
        if d <= 0.0 || d > depth_far {
            continue;
        }
        let p_cam = frame.intrinsics.back_project(x as f64, y as f64, d);
        cloud.points.push(frame.pose.to_world(&p_cam));

        let cx = ((x as f64 * sx) as u32).min(cw - 1);
        let cy = ((y as f64 * sy) as u32).min(ch - 1);
        let c = frame.color.get_pixel(cx, cy);
        cloud.colors.push(
            Vector3::new(c[0] as f64, c[1] as f64, c[2] as f64) / 255.0,
        );
    }

    if let Some((lo, hi)) = cloud.bounds() {
        debug!(
            "view {} world bounds: X[{:.3},{:.3}] Y[{:.3},{:.3}] Z[{:.3},{:.3}]",
            frame.index, lo.x, hi.x, lo.y, hi.y, lo.z, hi.z
        );
    }
    cloud
}

#[cfg(test)]
mod test {
    use super::*;

    use base::assert_eq_f32;

    fn cloud_of(points: Vec<Point3>) -> PointCloud {
        let colors = vec![Vector3::new(1.0, 0.5, 0.0); points.len()];
        PointCloud {
            points,
            colors,
            normals: vec![],
        }
    }

    #[test]
    fn test_voxel_down_sample() {
        let cloud = cloud_of(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.2, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
        ]);
        let down = cloud.voxel_down_sample(1.0);
        assert_eq!(down.len(), 2);
        assert_eq!(down.colors.len(), 2);
        assert_eq_f32!(down.points[0].x, 0.1);
        assert_eq_f32!(down.points[1].x, 5.0);
        assert_eq_f32!(down.colors[0][1], 0.5);

        assert_eq!(cloud.voxel_down_sample(0.0).len(), 3);
    }

    #[test]
    fn test_remove_statistical_outliers() {
        let mut points = vec![];
        for i in 0..10 {
            for j in 0..10 {
                points.push(Point3::new(i as f64 * 0.1, j as f64 * 0.1, 0.0));
            }
        }
        points.push(Point3::new(50.0, 50.0, 50.0));
        let mut cloud = cloud_of(points);
        cloud.remove_statistical_outliers(20, 2.0).unwrap();
        assert_eq!(cloud.len(), 100);
        assert_eq!(cloud.colors.len(), 100);
        assert!(cloud.points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_estimate_normals_on_plane() {
        let mut points = vec![];
        for i in 0..8 {
            for j in 0..8 {
                points.push(Point3::new(i as f64 * 0.01, 1.0, j as f64 * 0.01));
            }
        }
        let mut cloud = cloud_of(points);
        cloud.estimate_normals(0.05, 30).unwrap();
        cloud.orient_normals_outward();
        assert_eq!(cloud.normals.len(), cloud.len());
        for n in &cloud.normals {
            assert_eq_f32!(n.y.abs(), 1.0, 1e-6);
        }
    }

    #[test]
    fn test_orient_normals_outward() {
        let mut cloud = cloud_of(vec![
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(-1.0, 0.0, 0.0),
        ]);
        cloud.normals = vec![Vector3::new(-1.0, 0.0, 0.0); 2];
        cloud.orient_normals_outward();
        assert_eq!(cloud.normals[0], Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(cloud.normals[1], Vector3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_limited() {
        let points = (0..100).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        let cloud = cloud_of(points);
        let limited = cloud.limited(0.0, 10);
        assert_eq!(limited.len(), 10);
        assert_eq!(limited.colors.len(), 10);
        assert!(limited.points.windows(2).all(|w| w[0].x < w[1].x));

        // Sampling is deterministic.
        assert_eq!(cloud.limited(0.0, 10).points, limited.points);
        assert_eq!(cloud.limited(0.0, 0).len(), 100);
    }
}
