use rayon::prelude::*;

use crate::camera::{Point3, Vector3};
use crate::frame::ViewFrame;
use crate::mesh::Mesh;

const MIN_NORMAL_NORM: f64 = 1e-8;

/// Picks the source view of one face: the view whose direction from the
/// face center is most nearly parallel to the face normal. Orientation is
/// ignored, so a view behind the face may win. The first view wins ties.
pub fn choose_view(
    tri: [Point3; 3],
    eyes: &[Point3],
) -> Option<usize> {
    let normal = (tri[1] - tri[0]).cross(&(tri[2] - tri[0]));
    let norm = normal.norm();
    if norm < MIN_NORMAL_NORM {
        return None;
    }
    let normal = normal / norm;
    let center = Point3::from((tri[0].coords + tri[1].coords + tri[2].coords) / 3.0);

    let mut best: Option<usize> = None;
    let mut best_score = 0.0;
    for (i, eye) in eyes.iter().enumerate() {
        let to_eye: Vector3 = eye - center;
        let view_dir = to_eye / (to_eye.norm() + MIN_NORMAL_NORM);
        let score = normal.dot(&view_dir).abs();
        if score > best_score {
            best_score = score;
            best = Some(i);
        }
    }
    best
}

/// Source view index into `frames` for every face of the mesh.
pub fn choose_views(mesh: &Mesh, frames: &[ViewFrame]) -> Vec<Option<usize>> {
    let eyes: Vec<Point3> = frames.iter().map(|f| f.eye()).collect();
    mesh.faces
        .par_iter()
        .map(|&[a, b, c]| {
            let tri = [mesh.vertices[a], mesh.vertices[b], mesh.vertices[c]];
            choose_view(tri, &eyes)
        })
        .collect()
}
