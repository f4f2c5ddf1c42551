use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::info;

use base::defs::{Error, ErrorKind::*, Result};
use base::util::fs::create_dir;

use crate::bake::{bake, BakeBackends};
use crate::export::write_ply;
use crate::frame::load_frames;
use crate::fusion::{fuse, NO_USABLE_VIEWS};
use crate::params::ReconParams;
use crate::progress::{ReconEvent, Reporter};
use crate::select::select_views;

pub const POINTS_FILE_NAME: &str = "points.ply";

/// Files produced by a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconOutputs {
    pub mesh: PathBuf,
    pub texture: Option<PathBuf>,
    pub point_cloud: Option<PathBuf>,
}

pub struct Reconstructor {
    params: ReconParams,
}

impl Reconstructor {
    pub fn new(params: ReconParams) -> Result<Reconstructor> {
        params.validate()?;
        Ok(Reconstructor { params })
    }

    pub fn params(&self) -> &ReconParams {
        &self.params
    }

    /// Reconstructs a textured mesh from color views and their depth maps
    /// (keyed by view index), writing the outputs into `out_dir`.
    pub fn run(
        &self,
        view_paths: &[PathBuf],
        depth_paths: &BTreeMap<usize, PathBuf>,
        out_dir: &Path,
        emit: &mut dyn FnMut(&ReconEvent),
        stage: &str,
    ) -> Result<ReconOutputs> {
        let backends = BakeBackends::detect(&self.params);
        self.run_with_backends(
            view_paths,
            depth_paths,
            out_dir,
            emit,
            stage,
            &backends,
        )
    }

    pub fn run_with_backends(
        &self,
        view_paths: &[PathBuf],
        depth_paths: &BTreeMap<usize, PathBuf>,
        out_dir: &Path,
        emit: &mut dyn FnMut(&ReconEvent),
        stage: &str,
        backends: &BakeBackends,
    ) -> Result<ReconOutputs> {
        let params = &self.params;
        let mut reporter = Reporter::new(stage, emit);
        reporter.progress(0.0, Some("Rebuild started"));
        create_dir(out_dir)?;

        let selected = select_views(view_paths.len(), params);
        info!(
            "recon inputs: views={} depth={} selected={:?}",
            view_paths.len(),
            depth_paths.len(),
            selected
        );
        info!(
            "recon params: method={} fusion={} voxel={:.4} alpha={:.4} \
             poisson_depth={} target_tris={}",
            params.recon_method,
            params.recon_fusion,
            params.recon_voxel_size,
            params.recon_alpha,
            params.recon_poisson_depth,
            params.recon_target_tris
        );
        info!(
            "recon camera: fov={:.1} radius={:.2} elev={:.1} \
             depth invert={} near={:.2} far={:.2}",
            params.camera_fov_deg,
            params.camera_radius,
            params.views_elev_deg,
            params.depth_invert,
            params.depth_near,
            params.depth_far
        );

        let frames = load_frames(view_paths, depth_paths, &selected, params)?;
        if frames.is_empty() {
            return Err(Error::new(NoUsableViews, NO_USABLE_VIEWS.to_string()));
        }
        reporter.progress(0.2, Some("Prepared views"));

        let fused = fuse(&frames, params, &mut reporter)?;

        let mut outputs = ReconOutputs::default();
        if params.points_enabled {
            let path = out_dir.join(POINTS_FILE_NAME);
            let cloud = fused
                .cloud
                .limited(params.points_voxel_size, params.points_max_points);
            write_ply(&path, &cloud)?;
            info!("exported {} points", cloud.len());
            reporter.artifact("points", &path);
            outputs.point_cloud = Some(path);
            reporter.progress(0.9, Some("Point cloud exported"));
        }

        let outcome = bake(&fused.mesh, &frames, params, backends, out_dir)?;
        if let Some(texture) = &outcome.texture {
            reporter.artifact("texture", texture);
            reporter.progress(0.95, Some("Texture baked"));
        }
        reporter.artifact("mesh", &outcome.mesh);
        outputs.mesh = outcome.mesh;
        outputs.texture = outcome.texture;

        reporter.progress(1.0, Some("Rebuild complete"));
        Ok(outputs)
    }
}
