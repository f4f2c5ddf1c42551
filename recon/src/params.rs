use std::path::PathBuf;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use structopt::StructOpt;

use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::cli::List;

pub const DEFAULT_VOXEL_SIZE: f64 = 0.006;
pub const DEFAULT_ALPHA: f64 = 0.02;
pub const DEFAULT_POISSON_DEPTH: u32 = 8;
pub const DEFAULT_TARGET_TRIS: usize = 2000;
pub const DEFAULT_TEXTURE_SIZE: u32 = 1024;
pub const DEFAULT_BAKE_SAMPLES: u32 = 64;
pub const DEFAULT_BAKE_MARGIN: f64 = 0.02;
pub const DEFAULT_CAMERA_FOV_DEG: f64 = 35.0;
pub const DEFAULT_CAMERA_RADIUS: f64 = 1.2;
pub const DEFAULT_VIEWS_ELEV_DEG: f64 = 10.0;
pub const DEFAULT_DEPTH_NEAR: f64 = 0.2;
pub const DEFAULT_DEPTH_FAR: f64 = 2.0;

pub const MIN_POISSON_DEPTH: u32 = 4;
pub const MAX_POISSON_DEPTH: u32 = 12;
pub const MIN_TARGET_TRIS: usize = 100;
pub const MAX_TEXTURE_SIZE: u32 = 16384;

// Keys that may be overridden per run; anything else is ignored.
pub const OVERRIDE_KEYS: [&str; 25] = [
    "recon_method",
    "recon_fusion",
    "recon_voxel_size",
    "recon_alpha",
    "recon_poisson_depth",
    "recon_target_tris",
    "recon_images",
    "recon_view_indices",
    "points_enabled",
    "points_voxel_size",
    "points_max_points",
    "texture_enabled",
    "texture_size",
    "texture_backend",
    "blender_path",
    "blender_bake_samples",
    "blender_bake_margin",
    "camera_fov_deg",
    "camera_radius",
    "views_elev_deg",
    "views_azimuths_deg",
    "views_elevations_deg",
    "depth_invert",
    "depth_near",
    "depth_far",
];

macro_rules! define_choice {
    ($name:ident, $what:expr, { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text $(, alias = $alias)*)]
                $variant,
            )+
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_lowercase().as_str() {
                    $($text $(| $alias)* => Ok($name::$variant),)+
                    _ => {
                        let desc = format!("unknown {} '{}'", $what, s);
                        Err(Error::new(InvalidParams, desc))
                    }
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($name::$variant => write!(f, $text),)+
                }
            }
        }
    };
}

define_choice!(ReconMethod, "reconstruction method", {
    Poisson => "poisson",
    Alpha => "alpha",
});

define_choice!(FusionMode, "fusion mode", {
    Points => "points",
    Tsdf => "tsdf",
});

define_choice!(TextureBackend, "texture backend", {
    Auto => "auto",
    Atlas => "atlas" | "pyxatlas",
    Blender => "blender",
});

impl TextureBackend {
    pub fn allows_atlas(self) -> bool {
        matches!(self, TextureBackend::Auto | TextureBackend::Atlas)
    }

    pub fn allows_blender(self) -> bool {
        matches!(self, TextureBackend::Auto | TextureBackend::Blender)
    }
}

#[derive(Clone, Debug, PartialEq, StructOpt, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconParams {
    #[structopt(
        help = "Surface reconstruction method (poisson, alpha)",
        long,
        default_value = "poisson"
    )]
    pub recon_method: ReconMethod,

    #[structopt(
        help = "Fusion strategy (points, tsdf)",
        long,
        default_value = "points"
    )]
    pub recon_fusion: FusionMode,

    #[structopt(
        help = "Fusion voxel size in world units (0 to disable)",
        long,
        default_value = "0.006"
    )]
    pub recon_voxel_size: f64,

    #[structopt(help = "Alpha-shape radius", long, default_value = "0.02")]
    pub recon_alpha: f64,

    #[structopt(
        help = "Poisson reconstruction depth",
        long,
        default_value = "8"
    )]
    pub recon_poisson_depth: u32,

    #[structopt(
        help = "Decimation target triangle count (0 to disable)",
        long,
        default_value = "2000"
    )]
    pub recon_target_tris: usize,

    #[structopt(help = "Maximum number of views to fuse", long)]
    pub recon_images: Option<usize>,

    #[structopt(help = "Explicit view indices to fuse, e.g. 0,2,4", long)]
    pub recon_view_indices: Option<List<usize>>,

    #[structopt(
        help = "Export point cloud preview",
        long,
        parse(try_from_str),
        default_value = "true"
    )]
    pub points_enabled: bool,

    #[structopt(
        help = "Point cloud preview voxel size (0 to disable)",
        long,
        default_value = "0"
    )]
    pub points_voxel_size: f64,

    #[structopt(
        help = "Point cloud preview point budget (0 for unlimited)",
        long,
        default_value = "0"
    )]
    pub points_max_points: usize,

    #[structopt(
        help = "Bake albedo texture",
        long,
        parse(try_from_str),
        default_value = "true"
    )]
    pub texture_enabled: bool,

    #[structopt(help = "Texture resolution", long, default_value = "1024")]
    pub texture_size: u32,

    #[structopt(
        help = "Texture backend (auto, atlas, blender)",
        long,
        default_value = "auto"
    )]
    pub texture_backend: TextureBackend,

    #[structopt(help = "Blender executable", long, parse(from_os_str))]
    pub blender_path: Option<PathBuf>,

    #[structopt(help = "Blender bake samples", long, default_value = "64")]
    pub blender_bake_samples: u32,

    #[structopt(
        help = "Blender UV island margin",
        long,
        default_value = "0.02"
    )]
    pub blender_bake_margin: f64,

    #[structopt(
        help = "Camera field of view in degrees",
        long,
        default_value = "35"
    )]
    pub camera_fov_deg: f64,

    #[structopt(help = "Camera orbit radius", long, default_value = "1.2")]
    pub camera_radius: f64,

    #[structopt(
        help = "Camera elevation for evenly spaced views, in degrees",
        long,
        default_value = "10"
    )]
    pub views_elev_deg: f64,

    #[structopt(help = "Explicit per-view azimuths in degrees", long)]
    pub views_azimuths_deg: Option<List<f64>>,

    #[structopt(help = "Explicit per-view elevations in degrees", long)]
    pub views_elevations_deg: Option<List<f64>>,

    #[structopt(
        help = "Invert depth images (bright is near)",
        long,
        parse(try_from_str),
        default_value = "true"
    )]
    pub depth_invert: bool,

    #[structopt(help = "Depth near plane", long, default_value = "0.2")]
    pub depth_near: f64,

    #[structopt(help = "Depth far plane", long, default_value = "2.0")]
    pub depth_far: f64,
}

impl Default for ReconParams {
    fn default() -> Self {
        Self {
            recon_method: ReconMethod::Poisson,
            recon_fusion: FusionMode::Points,
            recon_voxel_size: DEFAULT_VOXEL_SIZE,
            recon_alpha: DEFAULT_ALPHA,
            recon_poisson_depth: DEFAULT_POISSON_DEPTH,
            recon_target_tris: DEFAULT_TARGET_TRIS,
            recon_images: None,
            recon_view_indices: None,
            points_enabled: true,
            points_voxel_size: 0.0,
            points_max_points: 0,
            texture_enabled: true,
            texture_size: DEFAULT_TEXTURE_SIZE,
            texture_backend: TextureBackend::Auto,
            blender_path: None,
            blender_bake_samples: DEFAULT_BAKE_SAMPLES,
            blender_bake_margin: DEFAULT_BAKE_MARGIN,
            camera_fov_deg: DEFAULT_CAMERA_FOV_DEG,
            camera_radius: DEFAULT_CAMERA_RADIUS,
            views_elev_deg: DEFAULT_VIEWS_ELEV_DEG,
            views_azimuths_deg: None,
            views_elevations_deg: None,
            depth_invert: true,
            depth_near: DEFAULT_DEPTH_NEAR,
            depth_far: DEFAULT_DEPTH_FAR,
        }
    }
}

fn invalid(desc: String) -> Error {
    Error::new(InvalidParams, desc)
}

impl ReconParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.depth_near < self.depth_far) {
            return Err(invalid(format!(
                "depth near plane {} must be less than far plane {}",
                self.depth_near, self.depth_far
            )));
        }
        if !(self.camera_fov_deg > 0.0 && self.camera_fov_deg < 180.0) {
            return Err(invalid(format!(
                "camera field of view {} must lie in (0, 180)",
                self.camera_fov_deg
            )));
        }
        if !(self.camera_radius > 0.0) {
            return Err(invalid(format!(
                "camera radius {} must be positive",
                self.camera_radius
            )));
        }

        for (name, value) in [
            ("recon_voxel_size", self.recon_voxel_size),
            ("recon_alpha", self.recon_alpha),
            ("points_voxel_size", self.points_voxel_size),
            ("blender_bake_margin", self.blender_bake_margin),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if !(MIN_POISSON_DEPTH..=MAX_POISSON_DEPTH)
            .contains(&self.recon_poisson_depth)
        {
            return Err(invalid(format!(
                "poisson depth {} must lie in [{}, {}]",
                self.recon_poisson_depth, MIN_POISSON_DEPTH, MAX_POISSON_DEPTH
            )));
        }
        if self.recon_target_tris != 0
            && self.recon_target_tris < MIN_TARGET_TRIS
        {
            return Err(invalid(format!(
                "target triangle count {} must be 0 or at least {}",
                self.recon_target_tris, MIN_TARGET_TRIS
            )));
        }

        if self.texture_size == 0 || self.texture_size > MAX_TEXTURE_SIZE {
            return Err(invalid(format!(
                "texture size {} must lie in [1, {}]",
                self.texture_size, MAX_TEXTURE_SIZE
            )));
        }
        if !self.texture_size.is_power_of_two() {
            warn!("texture size {} is not a power of two", self.texture_size);
        }
        if self.blender_bake_samples == 0 {
            return Err(invalid("blender bake samples must be positive".into()));
        }

        match (&self.views_azimuths_deg, &self.views_elevations_deg) {
            (Some(_), None) | (None, Some(_)) => Err(invalid(
                "per-view azimuths and elevations must be given together"
                    .into(),
            )),
            _ => Ok(()),
        }
    }

    /// Applies a JSON object of overrides. Keys outside of the known
    /// override set are ignored.
    pub fn with_overrides(&self, overrides: &Value) -> Result<ReconParams> {
        let overrides = overrides.as_object().ok_or_else(|| {
            invalid("overrides must be a JSON object".to_string())
        })?;

        let mut merged = match serde_json::to_value(self)
            .res(|| "failed to serialize parameters".to_string())?
        {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        for (key, value) in overrides {
            if OVERRIDE_KEYS.contains(&key.as_str()) {
                merged.insert(key.clone(), value.clone());
            }
        }

        let params: ReconParams = serde_json::from_value(Value::Object(merged))
            .map_err(|err| invalid(format!("malformed overrides: {}", err)))?;
        params.validate()?;
        Ok(params)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        let params = ReconParams::default();
        params.validate().unwrap();
        assert_eq!(params.recon_method, ReconMethod::Poisson);
        assert_eq!(params.texture_backend, TextureBackend::Auto);
        assert_eq!(params.recon_target_tris, 2000);
    }

    #[test]
    fn test_cli_defaults_match() {
        let params = ReconParams::from_iter(&["recon"]);
        assert_eq!(params, ReconParams::default());

        let params = ReconParams::from_iter(&[
            "recon",
            "--recon-fusion",
            "tsdf",
            "--texture-enabled",
            "false",
            "--views-azimuths-deg",
            "0,90",
            "--views-elevations-deg",
            "5,5",
        ]);
        assert_eq!(params.recon_fusion, FusionMode::Tsdf);
        assert!(!params.texture_enabled);
        assert_eq!(params.views_azimuths_deg, Some(List(vec![0.0, 90.0])));
    }

    #[test]
    fn test_validation() {
        let mut params = ReconParams::default();
        params.depth_near = 2.0;
        assert_eq!(params.validate().unwrap_err().kind, InvalidParams);

        let mut params = ReconParams::default();
        params.camera_fov_deg = 180.0;
        assert!(params.validate().is_err());

        let mut params = ReconParams::default();
        params.recon_poisson_depth = 13;
        assert!(params.validate().is_err());

        let mut params = ReconParams::default();
        params.recon_target_tris = 50;
        assert!(params.validate().is_err());
        params.recon_target_tris = 0;
        assert!(params.validate().is_ok());

        let mut params = ReconParams::default();
        params.views_azimuths_deg = Some(List(vec![0.0]));
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let params = ReconParams::default()
            .with_overrides(&json!({
                "recon_method": "alpha",
                "texture_backend": "pyxatlas",
                "recon_view_indices": [0, 2],
                "depth_invert": false,
                "unknown_key": 42,
            }))
            .unwrap();
        assert_eq!(params.recon_method, ReconMethod::Alpha);
        assert_eq!(params.texture_backend, TextureBackend::Atlas);
        assert_eq!(params.recon_view_indices, Some(List(vec![0, 2])));
        assert!(!params.depth_invert);

        let err = ReconParams::default()
            .with_overrides(&json!({"depth_far": 0.1}))
            .unwrap_err();
        assert_eq!(err.kind, InvalidParams);

        assert!(ReconParams::default().with_overrides(&json!([])).is_err());
    }

    #[test]
    fn test_choice_parsing() {
        assert_eq!("TSDF".parse::<FusionMode>().unwrap(), FusionMode::Tsdf);
        assert_eq!(
            "pyxatlas".parse::<TextureBackend>().unwrap(),
            TextureBackend::Atlas
        );
        assert!("marching".parse::<ReconMethod>().is_err());
        assert_eq!(TextureBackend::Blender.to_string(), "blender");
        assert!(TextureBackend::Auto.allows_atlas());
        assert!(!TextureBackend::Blender.allows_atlas());
    }
}
