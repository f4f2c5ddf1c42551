use std::collections::HashMap;

use log::{debug, info};

use base::defs::{Error, ErrorKind::*, Result};

use crate::camera::Vector2;
use crate::mesh::Mesh;

use super::packing::{globalize_uv, pack_rectangles_with_automatic_stretching};
use super::patching::{choose_uv_patches, LocalPatch};
use super::FaceTopology;

/// Gap kept around every chart, in units of the texture side.
pub const PATCH_SPACING: f64 = 0.005;

/// Mesh re-indexed so that every vertex carries a single UV coordinate.
/// Faces keep the order of the source mesh.
#[derive(Clone, Debug, Default)]
pub struct UvMesh {
    pub mesh: Mesh,
    pub uvs: Vec<Vector2>,
    // Source vertex of every unwrapped vertex.
    pub vmapping: Vec<usize>,
}

/// Charts the mesh into non-overlapping patches and packs them into the
/// unit square. UV origin is the lower left corner of the texture.
pub fn unwrap(mesh: &Mesh) -> Result<UvMesh> {
    if mesh.faces.is_empty() {
        let desc = "cannot unwrap a mesh without faces".to_string();
        return Err(Error::new(EmptyGeometry, desc));
    }

    let mut source = mesh.clone();
    if !source.has_normals() {
        source.compute_vertex_normals();
    }

    let topo = FaceTopology::new(&source);
    let patches: Vec<LocalPatch> = choose_uv_patches(&source, &topo)
        .iter()
        .map(|(chunk, major)| LocalPatch::calculate_from(chunk, *major, &source))
        .collect();
    debug!("uv atlas: {} charts", patches.len());

    let sizes: Vec<[f64; 2]> = patches.iter().map(|p| p.size).collect();
    let (placements, scale) =
        pack_rectangles_with_automatic_stretching(&sizes, PATCH_SPACING)
            .ok_or_else(|| {
                let desc = format!("failed to pack {} uv charts", sizes.len());
                Error::new(InconsistentState, desc)
            })?;
    let face_uvs = globalize_uv(&patches, &placements, source.faces.len());

    // A vertex shared by several charts gets one copy per chart.
    let mut chart_of_face = vec![0; source.faces.len()];
    for (c, patch) in patches.iter().enumerate() {
        for &f in &patch.chunk {
            chart_of_face[f] = c;
        }
    }

    let mut unwrapped = UvMesh::default();
    let mut copies = HashMap::<(usize, usize), usize>::new();
    for (f, face) in source.faces.iter().enumerate() {
        let mut new_face = [0; 3];
        for k in 0..3 {
            let v = face[k];
            new_face[k] = *copies.entry((chart_of_face[f], v)).or_insert_with(|| {
                unwrapped.push_vertex(&source, v, face_uvs[f][k]);
                unwrapped.vmapping.len() - 1
            });
        }
        unwrapped.mesh.faces.push(new_face);
    }

    info!(
        "uv atlas: {} charts, {} -> {} vertices, scale {:.3}",
        patches.len(),
        source.vertices.len(),
        unwrapped.mesh.vertices.len(),
        scale
    );
    Ok(unwrapped)
}

impl UvMesh {
    fn push_vertex(&mut self, source: &Mesh, v: usize, uv: Vector2) {
        self.mesh.vertices.push(source.vertices[v]);
        if source.has_normals() {
            self.mesh.normals.push(source.normals[v]);
        }
        if source.has_colors() {
            self.mesh.colors.push(source.colors[v]);
        }
        self.uvs.push(uv);
        self.vmapping.push(v);
    }
}
