use image::{Rgb, RgbImage};
use rayon::prelude::*;

use crate::camera::{Point3, Vector2, Vector3};
use crate::frame::ViewFrame;

use super::atlas::UvMesh;

const MIN_DENOMINATOR: f64 = 1e-8;

/// Sum of samples and their count for every texel.
pub struct TextureAccumulator {
    pub width: u32,
    pub height: u32,
    sums: Vec<Vector3>,
    weights: Vec<u32>,
}

impl TextureAccumulator {
    pub fn new(width: u32, height: u32) -> TextureAccumulator {
        let len = (width * height) as usize;
        TextureAccumulator {
            width,
            height,
            sums: vec![Vector3::zeros(); len],
            weights: vec![0; len],
        }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    pub fn add(&mut self, x: u32, y: u32, color: Vector3) {
        let idx = self.index(x, y);
        self.sums[idx] += color;
        self.weights[idx] += 1;
    }

    pub fn weight(&self, x: u32, y: u32) -> u32 {
        self.weights[self.index(x, y)]
    }

    pub fn num_covered(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0).count()
    }

    /// Averages every texel that received samples. The others stay black.
    pub fn to_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let idx = self.index(x, y);
            match self.weights[idx] {
                0 => Rgb([0, 0, 0]),
                w => {
                    let c = self.sums[idx] / w as f64;
                    let q = |v: f64| v.max(0.0).min(255.0) as u8;
                    Rgb([q(c.x), q(c.y), q(c.z)])
                }
            }
        })
    }
}

/// Texels inside a triangle given in normalized UV coordinates, each
/// with the barycentric weights of the three corners. The V axis is
/// flipped to match image rows.
pub fn rasterize(
    uvs: [Vector2; 3],
    width: u32,
    height: u32,
) -> Vec<(u32, u32, Vector3)> {
    let (w1, h1) = ((width - 1) as f64, (height - 1) as f64);
    let px: Vec<Vector2> = uvs
        .iter()
        .map(|uv| Vector2::new(uv.x * w1, (1.0 - uv.y) * h1))
        .collect();
    let (a, b, c) = (px[0], px[1], px[2]);

    let lo = a.inf(&b).inf(&c);
    let hi = a.sup(&b).sup(&c);
    let min_u = lo.x.floor().max(0.0) as i64;
    let max_u = (hi.x.ceil() as i64).min(width as i64 - 1);
    let min_v = lo.y.floor().max(0.0) as i64;
    let max_v = (hi.y.ceil() as i64).min(height as i64 - 1);
    if min_u >= max_u || min_v >= max_v {
        return vec![];
    }

    let (v0, v1) = (b - a, c - a);
    let denom = v0.x * v1.y - v1.x * v0.y;
    if denom.abs() < MIN_DENOMINATOR {
        return vec![];
    }

    let mut texels = vec![];
    for y in min_v..=max_v {
        for x in min_u..=max_u {
            let v2 = Vector2::new(x as f64, y as f64) - a;
            let u = (v2.x * v1.y - v1.x * v2.y) / denom;
            let v = (v0.x * v2.y - v2.x * v0.y) / denom;
            let w = 1.0 - u - v;
            if u < 0.0 || v < 0.0 || w < 0.0 {
                continue;
            }
            texels.push((x as u32, y as u32, Vector3::new(w, u, v)));
        }
    }
    texels
}

/// Bilinear sample at pixel coordinates, `None` unless the whole 2x2
/// neighbourhood lies inside the image.
pub fn sample_bilinear(image: &RgbImage, u: f64, v: f64) -> Option<Vector3> {
    let (w, h) = image.dimensions();
    if u < 0.0 || v < 0.0 || u >= (w - 1) as f64 || v >= (h - 1) as f64 {
        return None;
    }
    let (x0, y0) = (u.floor() as u32, v.floor() as u32);
    let (fx, fy) = (u - x0 as f64, v - y0 as f64);
    let px = |x: u32, y: u32| {
        let p = image.get_pixel(x, y);
        Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
    };
    Some(
        px(x0, y0) * ((1.0 - fx) * (1.0 - fy))
            + px(x0 + 1, y0) * (fx * (1.0 - fy))
            + px(x0, y0 + 1) * ((1.0 - fx) * fy)
            + px(x0 + 1, y0 + 1) * (fx * fy),
    )
}

/// Color of a world point as seen from the view, in [0, 255].
pub fn sample_view(frame: &ViewFrame, p: &Point3) -> Option<Vector3> {
    let (uv, _) = frame.project_to_color(p)?;
    sample_bilinear(&frame.color, uv.x, uv.y)
}

/// Projects every face's assigned view into its texture footprint.
pub fn bake_texture(
    uv_mesh: &UvMesh,
    frames: &[ViewFrame],
    choices: &[Option<usize>],
    size: u32,
) -> TextureAccumulator {
    let mesh = &uv_mesh.mesh;
    let samples: Vec<Vec<(u32, u32, Vector3)>> = mesh
        .faces
        .par_iter()
        .zip(choices.par_iter())
        .map(|(&[a, b, c], choice)| {
            let frame = match choice {
                Some(i) => &frames[*i],
                None => return vec![],
            };
            let uvs = [uv_mesh.uvs[a], uv_mesh.uvs[b], uv_mesh.uvs[c]];
            let tri = [mesh.vertices[a], mesh.vertices[b], mesh.vertices[c]];
            rasterize(uvs, size, size)
                .into_iter()
                .filter_map(|(x, y, bary)| {
                    let p = tri[0].coords * bary[0]
                        + tri[1].coords * bary[1]
                        + tri[2].coords * bary[2];
                    let color = sample_view(frame, &Point3::from(p))?;
                    Some((x, y, color))
                })
                .collect()
        })
        .collect();

    let mut acc = TextureAccumulator::new(size, size);
    for (x, y, color) in samples.into_iter().flatten() {
        acc.add(x, y, color);
    }
    acc
}
