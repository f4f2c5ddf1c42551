use log::{info, warn};
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::alpha_shape;
use crate::frame::ViewFrame;
use crate::mesh::Mesh;
use crate::params::{FusionMode, ReconMethod, ReconParams, DEFAULT_VOXEL_SIZE};
use crate::point_cloud::{
    back_project_frame, PointCloud, NORMAL_MAX_NEIGHBORS, OUTLIER_NEIGHBORS,
    OUTLIER_STD_RATIO,
};
use crate::poisson;
use crate::progress::Reporter;
use crate::tsdf::TsdfVolume;

pub const MIN_NORMAL_RADIUS: f64 = 0.01;

pub const NO_USABLE_VIEWS: &str =
    "no valid views with depth available for reconstruction";

/// Fused geometry of one run.
pub struct Fused {
    pub cloud: PointCloud,
    pub mesh: Mesh,
}

fn fuse_points(
    frames: &[ViewFrame],
    params: &ReconParams,
    reporter: &mut Reporter,
) -> Result<(PointCloud, Mesh)> {
    reporter.progress(0.3, Some("Fusing points"));

    let clouds: Vec<PointCloud> = frames
        .par_iter()
        .map(|f| back_project_frame(f, params.depth_far))
        .collect();
    let mut cloud = PointCloud::default();
    for c in clouds {
        cloud.append(c);
    }
    info!("merged points: {}", cloud.len());

    let voxel_size = params.recon_voxel_size;
    if voxel_size > 0.0 {
        cloud = cloud.voxel_down_sample(voxel_size);
    }
    cloud.remove_statistical_outliers(OUTLIER_NEIGHBORS, OUTLIER_STD_RATIO)?;
    info!("filtered points: {}", cloud.len());
    if cloud.is_empty() {
        let desc = "fused point cloud is empty".to_string();
        return Err(Error::new(EmptyGeometry, desc));
    }
    reporter.progress(0.55, Some("Point fusion complete"));

    let mesh = match params.recon_method {
        ReconMethod::Poisson => {
            let radius = (voxel_size * 2.0).max(MIN_NORMAL_RADIUS);
            cloud.estimate_normals(radius, NORMAL_MAX_NEIGHBORS)?;
            cloud.orient_normals_outward();
            info!(
                "poisson: depth={} normal radius={:.4}",
                params.recon_poisson_depth, radius
            );
            let poisson_params = poisson::Params {
                depth: params.recon_poisson_depth,
                ..Default::default()
            };
            poisson::reconstruct(&cloud, &poisson_params)?
        }
        ReconMethod::Alpha => {
            info!("alpha shape: alpha={}", params.recon_alpha);
            alpha_shape::reconstruct(&cloud, params.recon_alpha)?
        }
    };
    reporter.progress(0.7, Some("Meshing complete"));

    Ok((cloud, mesh))
}

fn fuse_tsdf(
    frames: &[ViewFrame],
    params: &ReconParams,
    reporter: &mut Reporter,
) -> Result<(PointCloud, Mesh)> {
    reporter.progress(0.3, Some("Fusing TSDF"));

    let voxel_size = if params.recon_voxel_size > 0.0 {
        params.recon_voxel_size
    } else {
        warn!(
            "tsdf needs a positive voxel size, using {}",
            DEFAULT_VOXEL_SIZE
        );
        DEFAULT_VOXEL_SIZE
    };
    let mut volume = TsdfVolume::new(voxel_size);
    info!(
        "tsdf: voxel={} sdf_trunc={}",
        volume.voxel_size, volume.sdf_trunc
    );
    for frame in frames {
        volume.integrate(frame, params.depth_far);
    }
    info!("tsdf voxels: {}", volume.len());

    let mesh = volume.extract_mesh();
    let cloud = PointCloud {
        points: mesh.vertices.clone(),
        colors: mesh.colors.clone(),
        normals: mesh.normals.clone(),
    };
    info!("tsdf points: {}", cloud.len());
    reporter.progress(0.65, Some("TSDF fusion complete"));

    Ok((cloud, mesh))
}

/// Fuses the frames into a point cloud and a cleaned, optionally
/// decimated mesh with vertex normals.
pub fn fuse(
    frames: &[ViewFrame],
    params: &ReconParams,
    reporter: &mut Reporter,
) -> Result<Fused> {
    if frames.is_empty() {
        return Err(Error::new(NoUsableViews, NO_USABLE_VIEWS.to_string()));
    }

    let (cloud, mut mesh) = match params.recon_fusion {
        FusionMode::Points => fuse_points(frames, params, reporter)?,
        FusionMode::Tsdf => fuse_tsdf(frames, params, reporter)?,
    };
    info!(
        "raw mesh: {} vertices, {} triangles",
        mesh.vertices.len(),
        mesh.faces.len()
    );

    mesh.cleanup();
    if mesh.faces.is_empty() {
        let desc = "reconstructed mesh has no triangles".to_string();
        return Err(Error::new(EmptyGeometry, desc));
    }
    reporter.progress(0.8, Some("Mesh cleanup complete"));

    let target = params.recon_target_tris;
    if target > 0 && mesh.faces.len() > target {
        mesh = mesh.decimate(target);
        info!(
            "decimated mesh: {} vertices, {} triangles",
            mesh.vertices.len(),
            mesh.faces.len()
        );
        reporter.progress(0.85, Some("Mesh simplified"));
    }
    mesh.compute_vertex_normals();

    Ok(Fused { cloud, mesh })
}

#[cfg(test)]
mod test {
    use super::*;

    use image::{Luma, Rgb, RgbImage};

    use crate::camera::{orbit_pose, Intrinsics};
    use crate::frame::DepthImage;
    use crate::progress::ReconEvent;

    // A disc of constant depth seen from six directions around the
    // vertical axis.
    fn disc_frames() -> Vec<ViewFrame> {
        (0..6)
            .map(|i| {
                let depth = DepthImage::from_fn(48, 48, |x, y| {
                    let (dx, dy) = (x as f64 - 24.0, y as f64 - 24.0);
                    Luma([if dx * dx + dy * dy < 18.0 * 18.0 { 1.0 } else { 0.0 }])
                });
                ViewFrame {
                    index: i,
                    color: RgbImage::from_pixel(48, 48, Rgb([180, 90, 40])),
                    depth,
                    pose: orbit_pose(60.0 * i as f64, 0.0, 1.2),
                    intrinsics: Intrinsics::from_fov(48, 48, 35.0),
                }
            })
            .collect()
    }

    fn run(params: &ReconParams) -> (Result<Fused>, Vec<f64>) {
        let mut progress = vec![];
        let mut emit = |e: &ReconEvent| progress.extend(e.progress);
        let mut reporter = Reporter::new("test", &mut emit);
        let fused = fuse(&disc_frames(), params, &mut reporter);
        drop(reporter);
        (fused, progress)
    }

    #[test]
    fn test_points_alpha() {
        let mut params = ReconParams::default();
        params.recon_method = ReconMethod::Alpha;
        params.recon_alpha = 0.03;
        params.recon_voxel_size = 0.01;
        params.recon_target_tris = 500;
        let (fused, progress) = run(&params);
        let fused = fused.unwrap();
        assert!(!fused.cloud.is_empty());
        assert!(fused.mesh.faces.len() <= 500);
        assert!(!fused.mesh.faces.is_empty());
        assert_eq!(fused.mesh.normals.len(), fused.mesh.vertices.len());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.first(), Some(&0.3));
    }

    #[test]
    fn test_points_alpha_zero_radius() {
        let mut params = ReconParams::default();
        params.recon_method = ReconMethod::Alpha;
        params.recon_alpha = 0.0;
        params.validate().unwrap();
        let (fused, _) = run(&params);
        assert!(!fused.unwrap().mesh.faces.is_empty());
    }

    #[test]
    fn test_tsdf() {
        let mut params = ReconParams::default();
        params.recon_fusion = FusionMode::Tsdf;
        params.recon_voxel_size = 0.02;
        params.recon_target_tris = 0;
        let (fused, progress) = run(&params);
        let fused = fused.unwrap();
        assert!(!fused.mesh.faces.is_empty());
        assert_eq!(fused.cloud.len(), fused.cloud.colors.len());
        assert!(progress.contains(&0.65));
        assert!(!progress.contains(&0.85));
    }

    #[test]
    fn test_no_frames() {
        let mut emit = |_: &ReconEvent| {};
        let mut reporter = Reporter::new("test", &mut emit);
        let err = fuse(&[], &ReconParams::default(), &mut reporter)
            .err()
            .unwrap();
        assert_eq!(err.kind, NoUsableViews);
        assert_eq!(err.description, NO_USABLE_VIEWS);
    }

    #[test]
    fn test_everything_beyond_far_plane() {
        let mut params = ReconParams::default();
        params.depth_far = 0.5;
        let (fused, _) = run(&params);
        assert_eq!(fused.err().unwrap().kind, EmptyGeometry);
    }
}
