use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::{ImageBuffer, Luma, Rgba, RgbaImage};

use recon::params::ReconParams;

pub const SIZE: u32 = 128;
pub const RADIUS: f64 = 50.0;

/// Six turntable views sharing one constant depth map of 1.0 and a
/// centered circular alpha mask.
pub fn write_views(dir: &Path) -> (Vec<PathBuf>, BTreeMap<usize, PathBuf>) {
    let center = SIZE as f64 / 2.0;
    let depth: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_pixel(SIZE, SIZE, Luma([32768]));
    let depth_path = dir.join("depth.png");
    depth.save(&depth_path).unwrap();

    let mut views = vec![];
    let mut depths = BTreeMap::new();
    for i in 0..6 {
        let color = RgbaImage::from_fn(SIZE, SIZE, |x, y| {
            let (dx, dy) = (x as f64 - center, y as f64 - center);
            let alpha = if dx * dx + dy * dy <= RADIUS * RADIUS {
                255
            } else {
                0
            };
            Rgba([40 * i as u8, 120, 200 - 20 * i as u8, alpha])
        });
        let path = dir.join(format!("view_{}.png", i));
        color.save(&path).unwrap();
        views.push(path);
        depths.insert(i, depth_path.clone());
    }
    (views, depths)
}

/// Decodes depth linearly into [0, 2], so that the shared map sits at 1.0.
pub fn scenario_params() -> ReconParams {
    ReconParams {
        depth_invert: false,
        depth_near: 0.0,
        depth_far: 2.0,
        recon_poisson_depth: 5,
        texture_enabled: false,
        ..Default::default()
    }
}

/// Number of vertices declared by a PLY header.
pub fn ply_vertex_count(path: &Path) -> usize {
    let bytes = std::fs::read(path).unwrap();
    let end = bytes
        .windows(10)
        .position(|w| w == b"end_header")
        .unwrap();
    let header = std::str::from_utf8(&bytes[..end]).unwrap();
    header
        .lines()
        .find_map(|l| l.strip_prefix("element vertex "))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}
