// This file makes `recon` into a rust library crate.

// The file `main.rs` still exists to make `recon` into an executable.

pub mod alpha_shape;
pub mod bake;
pub mod blender;
pub mod camera;
pub mod command;
pub mod export;
pub mod frame;
pub mod fusion;
pub mod isosurface;
pub mod mesh;
pub mod params;
pub mod point_cloud;
pub mod poisson;
pub mod progress;
pub mod reconstruct;
pub mod select;
pub mod texture;
pub mod tsdf;

pub use base;
pub use reconstruct::{ReconOutputs, Reconstructor};
