use log::info;

use crate::params::ReconParams;

pub type Point3 = nalgebra::Point3<f64>;
pub type Vector3 = nalgebra::Vector3<f64>;
pub type Vector2 = nalgebra::Vector2<f64>;
pub type Matrix3 = nalgebra::Matrix3<f64>;
pub type Matrix4 = nalgebra::Matrix4<f64>;

// Canonical output ordering of a six-view turntable generator: an upper
// ring (views 0-2) and a lower ring (views 3-5).
pub const TURNTABLE_AZIMUTHS_DEG: [f64; 6] =
    [30.0, 90.0, 150.0, 210.0, 270.0, 330.0];
pub const TURNTABLE_ELEVATIONS_DEG: [f64; 6] =
    [20.0, 20.0, 20.0, -20.0, -20.0, -20.0];

/// Returns `(azimuth, elevation)` in degrees for each of `count` views.
pub fn view_angles(count: usize, params: &ReconParams) -> Vec<(f64, f64)> {
    if let (Some(azimuths), Some(elevations)) =
        (&params.views_azimuths_deg, &params.views_elevations_deg)
    {
        let pairs: Vec<(f64, f64)> = azimuths
            .0
            .iter()
            .cloned()
            .zip(elevations.0.iter().cloned())
            .collect();
        if !pairs.is_empty() && pairs.len() >= count {
            return pairs[..count].to_vec();
        }
    }

    if count == TURNTABLE_AZIMUTHS_DEG.len() {
        return TURNTABLE_AZIMUTHS_DEG
            .iter()
            .cloned()
            .zip(TURNTABLE_ELEVATIONS_DEG.iter().cloned())
            .collect();
    }

    (0..count)
        .map(|i| (360.0 * i as f64 / count as f64, params.views_elev_deg))
        .collect()
}

/// Camera position on a sphere around the world origin.
pub fn orbit_eye(azimuth_deg: f64, elevation_deg: f64, radius: f64) -> Point3 {
    let (az, el) = (azimuth_deg.to_radians(), elevation_deg.to_radians());
    Point3::new(
        radius * el.cos() * az.sin(),
        radius * el.sin(),
        radius * el.cos() * az.cos(),
    )
}

/// Rigid camera pose. Camera axes follow the image convention: X points
/// right, Y points down the image rows, Z points into the scene.
#[derive(Clone, Debug, PartialEq)]
pub struct Pose {
    pub cam_to_world: Matrix4,
    pub world_to_cam: Matrix4,
    pub eye: Point3,
}

impl Pose {
    pub fn rotation(&self) -> Matrix3 {
        self.cam_to_world.fixed_slice::<3, 3>(0, 0).into_owned()
    }

    pub fn to_world(&self, p: &Point3) -> Point3 {
        self.cam_to_world.transform_point(p)
    }

    pub fn to_camera(&self, p: &Point3) -> Point3 {
        self.world_to_cam.transform_point(p)
    }
}

pub fn look_at(eye: Point3, target: Point3, world_up: Vector3) -> Pose {
    let forward = (target - eye).normalize();

    let mut right = forward.cross(&world_up);
    if right.norm() < 1e-9 {
        // Looking straight along the up axis.
        right = forward.cross(&Vector3::z());
    }
    let right = right.normalize();

    // Image rows grow downwards, which is the negated world-aligned up.
    let down = forward.cross(&right).normalize();

    let mut cam_to_world = Matrix4::identity();
    cam_to_world
        .fixed_slice_mut::<3, 1>(0, 0)
        .copy_from(&right);
    cam_to_world.fixed_slice_mut::<3, 1>(0, 1).copy_from(&down);
    cam_to_world
        .fixed_slice_mut::<3, 1>(0, 2)
        .copy_from(&forward);
    cam_to_world
        .fixed_slice_mut::<3, 1>(0, 3)
        .copy_from(&eye.coords);

    // The inverse of a rigid transform is its transposed rotation.
    let rot_t = cam_to_world.fixed_slice::<3, 3>(0, 0).transpose();
    let mut world_to_cam = Matrix4::identity();
    world_to_cam.fixed_slice_mut::<3, 3>(0, 0).copy_from(&rot_t);
    world_to_cam
        .fixed_slice_mut::<3, 1>(0, 3)
        .copy_from(&(-rot_t * eye.coords));

    Pose {
        cam_to_world,
        world_to_cam,
        eye,
    }
}

pub fn orbit_pose(azimuth_deg: f64, elevation_deg: f64, radius: f64) -> Pose {
    look_at(
        orbit_eye(azimuth_deg, elevation_deg, radius),
        Point3::origin(),
        Vector3::y(),
    )
}

/// Square-pixel pinhole intrinsics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn from_fov(width: u32, height: u32, fov_deg: f64) -> Intrinsics {
        let fx = 0.5 * width as f64 / (fov_deg.to_radians() / 2.0).tan();
        Intrinsics {
            fx,
            fy: fx,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
        }
    }

    pub fn scaled(&self, sx: f64, sy: f64) -> Intrinsics {
        Intrinsics {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
        }
    }

    pub fn back_project(&self, u: f64, v: f64, depth: f64) -> Point3 {
        Point3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Projects a camera-space point to pixel coordinates, `None` behind
    /// the camera.
    pub fn project(&self, p: &Point3) -> Option<Vector2> {
        if p.z <= 1e-6 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }
}

pub fn log_view_angles(angles: &[(f64, f64)]) {
    let desc: Vec<String> = angles
        .iter()
        .enumerate()
        .map(|(i, (az, el))| format!("view{}:az={:.0},el={:.0}", i, az, el))
        .collect();
    info!("camera angles for {} views: {}", angles.len(), desc.join(" "));
}

#[cfg(test)]
mod test {
    use super::*;

    use base::assert_eq_f32;
    use base::util::cli::List;

    #[test]
    fn test_pose_is_rigid() {
        for (az, el) in [(0.0, 0.0), (30.0, 20.0), (210.0, -20.0), (77.0, 89.0)]
        {
            let pose = orbit_pose(az, el, 1.2);
            let rot = pose.rotation();
            assert_eq_f32!(rot.determinant(), 1.0, 1e-6);
            assert!((rot.transpose() * rot - Matrix3::identity()).norm() < 1e-9);

            let product = pose.world_to_cam * pose.cam_to_world;
            assert!((product - Matrix4::identity()).norm() < 1e-9);

            let eye = pose.cam_to_world.column(3);
            assert_eq_f32!(eye[0], pose.eye.x);
            assert_eq_f32!(eye[1], pose.eye.y);
            assert_eq_f32!(eye[2], pose.eye.z);
        }
    }

    #[test]
    fn test_straight_up_pose() {
        let pose = orbit_pose(0.0, 90.0, 1.0);
        assert_eq_f32!(pose.rotation().determinant(), 1.0, 1e-6);
    }

    #[test]
    fn test_front_camera_convention() {
        let pose = orbit_pose(0.0, 0.0, 2.0);
        assert_eq_f32!(pose.eye.z, 2.0);

        // The origin lies straight ahead.
        let origin = pose.to_camera(&Point3::origin());
        assert_eq_f32!(origin.x, 0.0);
        assert_eq_f32!(origin.y, 0.0);
        assert_eq_f32!(origin.z, 2.0);

        // World up maps to image rows above the center.
        let top = pose.to_camera(&Point3::new(0.0, 0.5, 0.0));
        assert!(top.y < 0.0);

        // World +X is on the right of the image.
        let right = pose.to_camera(&Point3::new(0.5, 0.0, 0.0));
        assert!(right.x > 0.0);
    }

    #[test]
    fn test_projection_round_trip() {
        let intr = Intrinsics::from_fov(128, 96, 35.0);
        assert_eq_f32!(intr.cx, 64.0);
        assert_eq_f32!(intr.cy, 48.0);
        assert_eq_f32!(intr.fx, intr.fy);

        let p = intr.back_project(10.5, 70.25, 1.7);
        let uv = intr.project(&p).unwrap();
        assert_eq_f32!(uv[0], 10.5);
        assert_eq_f32!(uv[1], 70.25);

        assert!(intr.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_turntable_angles() {
        let params = ReconParams::default();
        let angles = view_angles(6, &params);
        let azimuths: Vec<f64> = angles.iter().map(|a| a.0).collect();
        let elevations: Vec<f64> = angles.iter().map(|a| a.1).collect();
        assert_eq!(azimuths, TURNTABLE_AZIMUTHS_DEG.to_vec());
        assert_eq!(elevations, TURNTABLE_ELEVATIONS_DEG.to_vec());
    }

    #[test]
    fn test_uniform_angles() {
        let params = ReconParams::default();
        let angles = view_angles(4, &params);
        assert_eq!(
            angles,
            vec![(0.0, 10.0), (90.0, 10.0), (180.0, 10.0), (270.0, 10.0)]
        );
    }

    #[test]
    fn test_explicit_angles() {
        let mut params = ReconParams::default();
        params.views_azimuths_deg = Some(List(vec![1.0, 2.0, 3.0]));
        params.views_elevations_deg = Some(List(vec![4.0, 5.0, 6.0]));
        assert_eq!(view_angles(2, &params), vec![(1.0, 4.0), (2.0, 5.0)]);

        // Too short to cover all views.
        let angles = view_angles(6, &params);
        assert_eq!(angles[0], (30.0, 20.0));
    }
}
