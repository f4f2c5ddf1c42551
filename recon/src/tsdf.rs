use std::collections::{HashMap, HashSet};

use log::debug;
use rayon::prelude::*;

use crate::camera::{Point3, Vector3};
use crate::frame::ViewFrame;
use crate::isosurface::{extract_isosurface, NodeKey, ScalarField};
use crate::mesh::Mesh;
use crate::point_cloud::PointCloud;

pub const MIN_VOXEL_SIZE: f64 = 1e-4;
pub const TRUNCATION_VOXELS: f64 = 5.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct Voxel {
    pub tsdf: f64,
    pub weight: f64,
    pub color: Vector3,
}

/// Sparse truncated signed distance volume. Only voxels within the
/// truncation band of some observed surface are allocated.
pub struct TsdfVolume {
    pub voxel_size: f64,
    pub sdf_trunc: f64,
    voxels: HashMap<NodeKey, Voxel>,
}

impl TsdfVolume {
    pub fn new(voxel_size: f64) -> TsdfVolume {
        let voxel_size = voxel_size.max(MIN_VOXEL_SIZE);
        TsdfVolume {
            voxel_size,
            sdf_trunc: TRUNCATION_VOXELS * voxel_size,
            voxels: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn voxel(&self, key: NodeKey) -> Option<&Voxel> {
        self.voxels.get(&key)
    }

    pub fn key_of(&self, p: &Point3) -> NodeKey {
        let k = p.coords / self.voxel_size;
        [k.x.floor() as i64, k.y.floor() as i64, k.z.floor() as i64]
    }

    pub fn voxel_center(&self, key: NodeKey) -> Point3 {
        Point3::new(
            (key[0] as f64 + 0.5) * self.voxel_size,
            (key[1] as f64 + 0.5) * self.voxel_size,
            (key[2] as f64 + 0.5) * self.voxel_size,
        )
    }

    // Voxels crossed by the truncation band around every valid depth.
    fn band_voxels(
        &self,
        frame: &ViewFrame,
        depth_trunc: f64,
    ) -> HashSet<NodeKey> {
        let (w, h) = frame.depth.dimensions();
        let step = self.voxel_size / 2.0;
        (0..h)
            .into_par_iter()
            .map(|v| {
                let mut keys = HashSet::new();
                for u in 0..w {
                    let d = frame.depth.get_pixel(u, v)[0] as f64;
                    if d <= 0.0 || d > depth_trunc {
                        continue;
                    }
                    let mut s = (d - self.sdf_trunc).max(step);
                    while s <= d + self.sdf_trunc {
                        let c = frame
                            .intrinsics
                            .back_project(u as f64, v as f64, s);
                        keys.insert(self.key_of(&frame.pose.to_world(&c)));
                        s += step;
                    }
                }
                keys
            })
            .reduce(HashSet::new, |mut a, b| {
                a.extend(b);
                a
            })
    }

    // Signed distance and color observed for a voxel in one frame.
    fn observe(
        &self,
        frame: &ViewFrame,
        key: NodeKey,
        depth_trunc: f64,
    ) -> Option<(f64, Vector3)> {
        let center = self.voxel_center(key);
        let c = frame.pose.to_camera(&center);
        let px = frame.intrinsics.project(&c)?;
        let (u, v) = (px.x.round(), px.y.round());
        let (w, h) = frame.depth.dimensions();
        if u < 0.0 || v < 0.0 || u >= w as f64 || v >= h as f64 {
            return None;
        }

        let d = frame.depth.get_pixel(u as u32, v as u32)[0] as f64;
        if d <= 0.0 || d > depth_trunc {
            return None;
        }
        let sdf = d - c.z;
        if sdf < -self.sdf_trunc {
            return None;
        }

        let color = match frame.project_to_color(&center) {
            Some((uv, _)) => {
                let (cw, ch) = frame.color.dimensions();
                let x = (uv.x.round().max(0.0) as u32).min(cw - 1);
                let y = (uv.y.round().max(0.0) as u32).min(ch - 1);
                let p = frame.color.get_pixel(x, y);
                Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64) / 255.0
            }
            None => Vector3::zeros(),
        };

        Some(((sdf / self.sdf_trunc).min(1.0), color))
    }

    /// Fuses one frame into the volume with unit weight per observation.
    pub fn integrate(&mut self, frame: &ViewFrame, depth_trunc: f64) {
        let keys: Vec<NodeKey> =
            self.band_voxels(frame, depth_trunc).into_iter().collect();
        let updates: Vec<(NodeKey, f64, Vector3)> = keys
            .par_iter()
            .filter_map(|&key| {
                let (tsdf, color) = self.observe(frame, key, depth_trunc)?;
                Some((key, tsdf, color))
            })
            .collect();

        for (key, tsdf, color) in updates {
            let voxel = self.voxels.entry(key).or_default();
            let w = voxel.weight;
            voxel.tsdf = (voxel.tsdf * w + tsdf) / (w + 1.0);
            voxel.color = (voxel.color * w + color) / (w + 1.0);
            voxel.weight = w + 1.0;
        }

        debug!(
            "view {} integrated: {} voxels allocated",
            frame.index,
            self.voxels.len()
        );
    }

    pub fn extract_mesh(&self) -> Mesh {
        let mut mesh = extract_isosurface(self);
        mesh.compute_vertex_normals();
        mesh
    }

    /// Zero-crossing points of the volume with normals and colors.
    pub fn extract_point_cloud(&self) -> PointCloud {
        let mesh = self.extract_mesh();
        PointCloud {
            points: mesh.vertices,
            colors: mesh.colors,
            normals: mesh.normals,
        }
    }
}

impl ScalarField for TsdfVolume {
    fn value(&self, node: NodeKey) -> Option<f64> {
        self.voxels
            .get(&node)
            .filter(|v| v.weight > 0.0)
            .map(|v| v.tsdf)
    }

    fn position(&self, node: NodeKey) -> Point3 {
        self.voxel_center(node)
    }

    fn has_colors(&self) -> bool {
        true
    }

    fn color(&self, node: NodeKey) -> Option<Vector3> {
        self.voxels.get(&node).map(|v| v.color)
    }

    fn cells(&self) -> Box<dyn Iterator<Item = NodeKey> + '_> {
        Box::new(self.voxels.keys().cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use base::assert_eq_f32;
    use image::{Luma, Rgb, RgbImage};

    use crate::camera::{orbit_pose, Intrinsics};
    use crate::frame::DepthImage;

    // A camera two units in front of the z = 0 plane, looking at it.
    fn plane_frame() -> ViewFrame {
        ViewFrame {
            index: 0,
            color: RgbImage::from_pixel(64, 64, Rgb([255, 0, 0])),
            depth: DepthImage::from_pixel(64, 64, Luma([2.0])),
            pose: orbit_pose(0.0, 0.0, 2.0),
            intrinsics: Intrinsics::from_fov(64, 64, 35.0),
        }
    }

    #[test]
    fn test_truncation_follows_voxel_size() {
        let volume = TsdfVolume::new(0.01);
        assert_eq_f32!(volume.sdf_trunc, 0.05);
        let volume = TsdfVolume::new(0.0);
        assert_eq_f32!(volume.voxel_size, MIN_VOXEL_SIZE);
    }

    #[test]
    fn test_plane_integration() {
        let mut volume = TsdfVolume::new(0.02);
        let frame = plane_frame();
        volume.integrate(&frame, 3.0);
        assert!(!volume.is_empty());

        // In front of the plane the distance is positive, behind negative.
        let front = volume.voxel(volume.key_of(&Point3::new(0.0, 0.0, 0.05)));
        assert!(front.unwrap().tsdf > 0.0);
        let back = volume.voxel(volume.key_of(&Point3::new(0.0, 0.0, -0.05)));
        assert!(back.unwrap().tsdf < 0.0);

        let mesh = volume.extract_mesh();
        assert!(!mesh.is_empty());
        assert_eq!(mesh.normals.len(), mesh.vertices.len());
        for (v, c) in mesh.vertices.iter().zip(mesh.colors.iter()) {
            assert!(v.z.abs() < 0.02);
            assert_eq_f32!(c.x, 1.0);
        }

        // Faces look back at the camera.
        let towards_camera = mesh
            .faces
            .iter()
            .filter(|&&f| mesh.face_cross(f).z > 0.0)
            .count();
        assert!(towards_camera as f64 > 0.95 * mesh.faces.len() as f64);
    }

    #[test]
    fn test_repeated_integration_accumulates_weight() {
        let mut volume = TsdfVolume::new(0.02);
        let frame = plane_frame();
        volume.integrate(&frame, 3.0);
        let key = volume.key_of(&Point3::new(0.0, 0.0, 0.03));
        let once = *volume.voxel(key).unwrap();
        volume.integrate(&frame, 3.0);
        let twice = *volume.voxel(key).unwrap();
        assert_eq_f32!(twice.weight, 2.0 * once.weight);
        assert_eq_f32!(twice.tsdf, once.tsdf);
    }

    #[test]
    fn test_far_depth_is_ignored() {
        let mut volume = TsdfVolume::new(0.02);
        volume.integrate(&plane_frame(), 1.5);
        assert!(volume.is_empty());
        assert!(volume.extract_point_cloud().is_empty());
    }
}
