use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use tempfile::TempDir;

use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::fs::write_file;

use crate::export::write_glb;
use crate::mesh::Mesh;
use crate::params::ReconParams;

pub const BAKE_SCRIPT: &str = include_str!("../assets/blender_bake.py");
pub const DEFAULT_INSTALL_PATH: &str =
    "/Applications/Blender.app/Contents/MacOS/Blender";

const EXECUTABLE_NAME: &str = "blender";

/// First regular file called `name` in the directories of a `PATH`-style
/// list, searched in list order.
fn find_in_paths(name: &str, paths: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// Locates the Blender executable: the explicit path if it exists, then
/// `blender` on `PATH`, then the default macOS install location.
pub fn resolve_blender_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!("configured blender '{}' does not exist", path.display());
    }
    if let Some(path) = std::env::var_os("PATH")
        .and_then(|paths| find_in_paths(EXECUTABLE_NAME, &paths))
    {
        return Some(path);
    }
    let default = Path::new(DEFAULT_INSTALL_PATH);
    if default.exists() {
        return Some(default.to_path_buf());
    }
    None
}

// Per-run scratch directory, removed on drop.
fn scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("recon_blender_")
        .tempdir()
        .res(|| "failed to create Blender scratch directory".to_string())
}

/// Output files of a successful external bake.
#[derive(Clone, Debug, PartialEq)]
pub struct BakedFiles {
    pub mesh: PathBuf,
    pub texture: PathBuf,
}

/// Bakes the mesh with Blender into `model.glb` and `albedo.png` under
/// `out_dir`. Blocks until the tool exits.
pub fn bake_with_blender(
    executable: &Path,
    mesh: &Mesh,
    out_dir: &Path,
    params: &ReconParams,
) -> Result<BakedFiles> {
    let scratch = scratch_dir()?;
    let input = scratch.path().join("input.glb");
    let script = scratch.path().join("blender_bake.py");
    write_glb(&input, mesh, None, None)?;
    write_file(&script, BAKE_SCRIPT.as_bytes())?;

    let files = BakedFiles {
        mesh: out_dir.join("model.glb"),
        texture: out_dir.join("albedo.png"),
    };
    for path in [&files.mesh, &files.texture] {
        if path.exists() {
            std::fs::remove_file(path)
                .res(|| format!("failed to remove '{}'", path.display()))?;
        }
    }

    info!("running {}...", executable.display());
    let output = Command::new(executable)
        .args(["-b", "--factory-startup", "-P"])
        .arg(&script)
        .arg("--")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&files.mesh)
        .arg("--texture")
        .arg(&files.texture)
        .arg("--size")
        .arg(params.texture_size.to_string())
        .arg("--samples")
        .arg(params.blender_bake_samples.to_string())
        .arg("--margin")
        .arg(params.blender_bake_margin.to_string())
        .output()
        .res(|| format!("failed to run '{}'", executable.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = match stderr.trim() {
            "" => stdout.trim(),
            stderr => stderr,
        };
        let desc = if detail.is_empty() {
            "Blender bake failed".to_string()
        } else {
            detail.to_string()
        };
        return Err(Error::new(ExternalToolError, desc));
    }

    if !files.mesh.exists() || !files.texture.exists() {
        let desc = "Blender bake did not produce expected outputs".to_string();
        return Err(Error::new(ExternalToolError, desc));
    }
    Ok(files)
}
