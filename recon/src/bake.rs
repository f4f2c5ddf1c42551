use std::path::{Path, PathBuf};

use log::{info, warn};

use base::defs::{Error, ErrorKind::*, IntoResult, Result};

use crate::blender::{bake_with_blender, resolve_blender_path};
use crate::export::write_glb;
use crate::frame::ViewFrame;
use crate::mesh::Mesh;
use crate::params::{ReconParams, TextureBackend};
use crate::texture::TexturedMesh;

pub const MESH_FILE_NAME: &str = "model.glb";
pub const TEXTURE_FILE_NAME: &str = "albedo.png";

/// Texturing backends available to a run.
#[derive(Clone, Debug, PartialEq)]
pub struct BakeBackends {
    pub atlas: bool,
    pub blender: Option<PathBuf>,
}

impl BakeBackends {
    pub fn detect(params: &ReconParams) -> BakeBackends {
        let blender = if params.texture_enabled
            && params.texture_backend.allows_blender()
        {
            resolve_blender_path(params.blender_path.as_deref())
        } else {
            None
        };
        BakeBackends {
            atlas: true,
            blender,
        }
    }

    pub fn none() -> BakeBackends {
        BakeBackends {
            atlas: false,
            blender: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BakeStrategy {
    Atlas,
    Blender(PathBuf),
    Untextured,
}

/// Ordered strategies to attempt. The last one is always `Untextured`.
pub fn plan(
    params: &ReconParams,
    backends: &BakeBackends,
) -> Vec<BakeStrategy> {
    let mut strategies = vec![];
    if params.texture_enabled {
        let backend = params.texture_backend;
        if backend.allows_atlas() {
            if backends.atlas {
                strategies.push(BakeStrategy::Atlas);
            } else if backend == TextureBackend::Atlas {
                warn!("texture atlas not available, disabling texture bake");
            } else {
                info!("texture atlas not available, falling back");
            }
        }
        if backend.allows_blender() {
            match &backends.blender {
                Some(path) => {
                    strategies.push(BakeStrategy::Blender(path.clone()))
                }
                None if backend == TextureBackend::Blender => {
                    warn!("Blender not found, disabling texture bake")
                }
                None => {}
            }
        }
    }
    strategies.push(BakeStrategy::Untextured);
    strategies
}

/// Files written by the strategy that succeeded.
#[derive(Clone, Debug, PartialEq)]
pub struct BakeOutcome {
    pub strategy: BakeStrategy,
    pub mesh: PathBuf,
    pub texture: Option<PathBuf>,
}

fn bake_atlas(
    mesh: &Mesh,
    frames: &[ViewFrame],
    params: &ReconParams,
    out_dir: &Path,
) -> Result<BakeOutcome> {
    let textured = TexturedMesh::bake(mesh, frames, params.texture_size)?;
    let mesh_path = out_dir.join(MESH_FILE_NAME);
    let texture_path = out_dir.join(TEXTURE_FILE_NAME);
    write_glb(
        &mesh_path,
        &textured.atlas.mesh,
        Some(&textured.atlas.uvs),
        Some(&textured.image),
    )?;
    textured
        .image
        .save(&texture_path)
        .res(|| format!("failed to save '{}'", texture_path.display()))?;
    Ok(BakeOutcome {
        strategy: BakeStrategy::Atlas,
        mesh: mesh_path,
        texture: Some(texture_path),
    })
}

fn attempt(
    strategy: &BakeStrategy,
    mesh: &Mesh,
    frames: &[ViewFrame],
    params: &ReconParams,
    out_dir: &Path,
) -> Result<BakeOutcome> {
    match strategy {
        BakeStrategy::Atlas => bake_atlas(mesh, frames, params, out_dir),
        BakeStrategy::Blender(executable) => {
            let files = bake_with_blender(executable, mesh, out_dir, params)?;
            Ok(BakeOutcome {
                strategy: strategy.clone(),
                mesh: files.mesh,
                texture: Some(files.texture),
            })
        }
        BakeStrategy::Untextured => {
            let mesh_path = out_dir.join(MESH_FILE_NAME);
            write_glb(&mesh_path, mesh, None, None)?;
            Ok(BakeOutcome {
                strategy: BakeStrategy::Untextured,
                mesh: mesh_path,
                texture: None,
            })
        }
    }
}

/// Runs the strategies in order until one succeeds. Texturing failures
/// are logged and fall through; only a failed untextured export is
/// returned as an error.
pub fn bake(
    mesh: &Mesh,
    frames: &[ViewFrame],
    params: &ReconParams,
    backends: &BakeBackends,
    out_dir: &Path,
) -> Result<BakeOutcome> {
    for strategy in plan(params, backends) {
        info!("exporting mesh with {:?} strategy...", strategy);
        match attempt(&strategy, mesh, frames, params, out_dir) {
            Ok(outcome) => return Ok(outcome),
            Err(err) if strategy != BakeStrategy::Untextured => {
                warn!("{:?} bake failed, falling back: {}", strategy, err)
            }
            Err(err) => return Err(err),
        }
    }
    let desc = "no bake strategy left to attempt".to_string();
    Err(Error::new(InconsistentState, desc))
}
