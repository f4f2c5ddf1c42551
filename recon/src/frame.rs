use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use log::{debug, info};
use rayon::prelude::*;

use base::defs::{IntoResult, Result};

use crate::camera::{
    log_view_angles, orbit_pose, view_angles, Intrinsics, Point3, Pose,
    Vector2,
};
use crate::params::ReconParams;

/// Alpha below which a pixel is treated as background.
pub const ALPHA_THRESHOLD: f32 = 0.05;

pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// One posed RGB-D view. Depth is metric, 0 marks invalid pixels.
pub struct ViewFrame {
    pub index: usize,
    pub color: RgbImage,
    pub depth: DepthImage,
    pub pose: Pose,
    // Intrinsics of the depth image.
    pub intrinsics: Intrinsics,
}

impl ViewFrame {
    pub fn eye(&self) -> Point3 {
        self.pose.eye
    }

    /// Intrinsics rescaled to the color image resolution.
    pub fn color_intrinsics(&self) -> Intrinsics {
        let (cw, ch) = self.color.dimensions();
        let (dw, dh) = self.depth.dimensions();
        if (cw, ch) == (dw, dh) {
            self.intrinsics
        } else {
            self.intrinsics
                .scaled(cw as f64 / dw as f64, ch as f64 / dh as f64)
        }
    }

    pub fn num_valid_depths(&self) -> usize {
        self.depth.pixels().filter(|p| p[0] > 0.0).count()
    }

    /// Projects a world point into the color image.
    pub fn project_to_color(&self, p: &Point3) -> Option<(Vector2, f64)> {
        let c = self.pose.to_camera(p);
        let uv = self.color_intrinsics().project(&c)?;
        Some((uv, c.z))
    }
}

pub struct ColorImage {
    pub rgb: RgbImage,
    pub alpha: GrayImage,
}

pub fn decode_color(image: DynamicImage) -> ColorImage {
    let rgba = image.into_rgba8();
    let (w, h) = rgba.dimensions();
    let mut rgb = RgbImage::new(w, h);
    let mut alpha = GrayImage::new(w, h);
    for (x, y, p) in rgba.enumerate_pixels() {
        rgb.put_pixel(x, y, image::Rgb([p[0], p[1], p[2]]));
        alpha.put_pixel(x, y, Luma([p[3]]));
    }
    ColorImage { rgb, alpha }
}

/// Normalizes a depth image to [0,1] by its bit depth, optionally inverts
/// it, and maps it to the metric range [near, far].
pub fn decode_depth(image: DynamicImage, params: &ReconParams) -> DepthImage {
    let normalized: DepthImage = match image {
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => {
            let img = image.into_luma16();
            let (w, h) = img.dimensions();
            ImageBuffer::from_fn(w, h, |x, y| {
                Luma([img.get_pixel(x, y)[0] as f32 / 65535.0])
            })
        }
        _ => {
            let img = image.into_luma8();
            let (w, h) = img.dimensions();
            ImageBuffer::from_fn(w, h, |x, y| {
                Luma([img.get_pixel(x, y)[0] as f32 / 255.0])
            })
        }
    };

    let (near, far) = (params.depth_near as f32, params.depth_far as f32);
    let invert = params.depth_invert;
    let mut depth = normalized;
    for p in depth.pixels_mut() {
        let d = if invert { 1.0 - p[0] } else { p[0] };
        p[0] = near + d * (far - near);
    }
    depth
}

/// Zeroes depth wherever the alpha mask marks background. Returns false
/// and leaves the depth untouched when resolutions differ.
pub fn mask_depth(depth: &mut DepthImage, alpha: &GrayImage) -> bool {
    if depth.dimensions() != alpha.dimensions() {
        return false;
    }
    for (p, a) in depth.pixels_mut().zip(alpha.pixels()) {
        if (a[0] as f32 / 255.0) < ALPHA_THRESHOLD {
            p[0] = 0.0;
        }
    }
    true
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path)
        .res(|| format!("failed to decode image '{}'", path.display()))
}

pub fn load(
    index: usize,
    color_path: &Path,
    depth_path: &Path,
    pose: Pose,
    params: &ReconParams,
) -> Result<ViewFrame> {
    let ColorImage { rgb, alpha } = decode_color(open_image(color_path)?);
    let mut depth = decode_depth(open_image(depth_path)?, params);

    if !mask_depth(&mut depth, &alpha) {
        debug!(
            "view {} alpha/depth mismatch: alpha={:?} depth={:?}",
            index,
            alpha.dimensions(),
            depth.dimensions()
        );
    }

    let (w, h) = depth.dimensions();
    let intrinsics = Intrinsics::from_fov(w, h, params.camera_fov_deg);

    let frame = ViewFrame {
        index,
        color: rgb,
        depth,
        pose,
        intrinsics,
    };
    log_depth_stats(&frame);
    Ok(frame)
}

fn log_depth_stats(frame: &ViewFrame) {
    let valid: Vec<f32> = frame
        .depth
        .pixels()
        .map(|p| p[0])
        .filter(|&d| d > 0.0)
        .collect();
    if valid.is_empty() {
        return;
    }
    let min = valid.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = valid.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = valid.iter().map(|&d| d as f64).sum::<f64>() / valid.len() as f64;
    let (w, h) = frame.color.dimensions();
    debug!(
        "view {} size={}x{} depth: min={:.3} max={:.3} mean={:.3} nonzero={}/{}",
        frame.index,
        w,
        h,
        min,
        max,
        mean,
        valid.len(),
        frame.depth.len()
    );
}

/// Loads the selected views. Views without a depth map are skipped, as
/// are views whose depth has no valid samples.
pub fn load_frames(
    view_paths: &[PathBuf],
    depth_paths: &BTreeMap<usize, PathBuf>,
    indices: &[usize],
    params: &ReconParams,
) -> Result<Vec<ViewFrame>> {
    let total = view_paths.len();
    let angles = view_angles(total, params);
    log_view_angles(&angles);

    let jobs: Vec<(usize, &PathBuf)> = indices
        .iter()
        .filter(|&&i| i < total)
        .filter_map(|&i| match depth_paths.get(&i) {
            Some(path) => Some((i, path)),
            None => {
                debug!("view {} skipped: missing depth", i);
                None
            }
        })
        .collect();

    let frames = jobs
        .into_par_iter()
        .map(|(i, depth_path)| {
            let (az, el) = angles[i];
            let pose = orbit_pose(az, el, params.camera_radius);
            info!(
                "view {}: az={:.1} el={:.1} eye=[{:.3},{:.3},{:.3}] det={:.3}",
                i,
                az,
                el,
                pose.eye.x,
                pose.eye.y,
                pose.eye.z,
                pose.rotation().determinant()
            );
            load(i, &view_paths[i], depth_path, pose, params)
        })
        .collect::<Result<Vec<ViewFrame>>>()?;

    Ok(frames
        .into_iter()
        .filter(|f| {
            let usable = f.num_valid_depths() > 0;
            if !usable {
                debug!("view {} skipped: no valid depth", f.index);
            }
            usable
        })
        .collect())
}
