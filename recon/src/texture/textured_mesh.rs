use image::RgbImage;
use log::info;

use base::defs::{Error, ErrorKind::*, Result};

use crate::frame::ViewFrame;
use crate::mesh::Mesh;

use super::atlas::{unwrap, UvMesh};
use super::baking::bake_texture;
use super::selection::choose_views;

pub struct TexturedMesh {
    pub atlas: UvMesh,
    pub image: RgbImage,
}

impl TexturedMesh {
    /// Unwraps the mesh and bakes a square albedo texture of `size`
    /// texels from the most face-on view of every face.
    pub fn bake(
        mesh: &Mesh,
        frames: &[ViewFrame],
        size: u32,
    ) -> Result<TexturedMesh> {
        if frames.is_empty() {
            let desc = "no views to bake the texture from".to_string();
            return Err(Error::new(NoUsableViews, desc));
        }

        info!("  unwrapping {} faces...", mesh.faces.len());
        let atlas = unwrap(mesh)?;

        info!("  choosing texture sources for mesh faces...");
        let choices = choose_views(&atlas.mesh, frames);
        info!(
            "  texture sources obtained for {:.1}% of the faces",
            choices.iter().filter(|c| c.is_some()).count() as f64
                / atlas.mesh.faces.len() as f64
                * 100.0
        );

        info!("  baking {}x{} texture...", size, size);
        let acc = bake_texture(&atlas, frames, &choices, size);
        info!(
            "  finished with texture coverage: {:.1}%",
            acc.num_covered() as f64 / (size as f64 * size as f64) * 100.0
        );

        Ok(TexturedMesh {
            atlas,
            image: acc.to_image(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use image::{Luma, Rgb};

    use crate::camera::{orbit_pose, Intrinsics, Point3};
    use crate::frame::DepthImage;

    fn square() -> Mesh {
        Mesh {
            vertices: vec![
                Point3::new(-0.5, -0.5, 0.0),
                Point3::new(0.5, -0.5, 0.0),
                Point3::new(0.5, 0.5, 0.0),
                Point3::new(-0.5, 0.5, 0.0),
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
            ..Default::default()
        }
    }

    #[test]
    fn test_bake_square() {
        let frame = ViewFrame {
            index: 0,
            color: RgbImage::from_pixel(64, 64, Rgb([0, 128, 255])),
            depth: DepthImage::from_pixel(64, 64, Luma([2.0])),
            pose: orbit_pose(0.0, 0.0, 2.0),
            intrinsics: Intrinsics::from_fov(64, 64, 60.0),
        };
        let textured = TexturedMesh::bake(&square(), &[frame], 64).unwrap();
        assert_eq!(textured.image.dimensions(), (64, 64));
        assert_eq!(textured.atlas.mesh.faces.len(), 2);
        let lit = textured
            .image
            .pixels()
            .filter(|p| p.0 != [0, 0, 0])
            .count();
        assert!(lit > 64 * 64 / 4, "{} texels baked", lit);
    }

    #[test]
    fn test_bake_needs_views() {
        let err = TexturedMesh::bake(&square(), &[], 16).err().unwrap();
        assert_eq!(err.kind, NoUsableViews);
    }
}
