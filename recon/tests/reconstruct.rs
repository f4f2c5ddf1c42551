mod common;

use std::path::Path;

use recon::bake::{BakeBackends, BakeStrategy};
use recon::export::decode_glb;
use recon::params::{
    FusionMode, ReconMethod, ReconParams, TextureBackend, DEFAULT_POISSON_DEPTH,
};
use recon::progress::{EventKind, ReconEvent};
use recon::Reconstructor;

use common::{ply_vertex_count, scenario_params, write_views};

fn triangle_count(glb: &serde_json::Value) -> u64 {
    let indices = glb["meshes"][0]["primitives"][0]["indices"]
        .as_u64()
        .unwrap() as usize;
    glb["accessors"][indices]["count"].as_u64().unwrap() / 3
}

#[test]
fn test_points_poisson_untextured() {
    let dir = tempfile::tempdir().unwrap();
    let (views, depths) = write_views(dir.path());
    let out_dir = dir.path().join("out");

    let params = scenario_params();
    assert_eq!(params.recon_fusion, FusionMode::Points);
    assert_eq!(params.recon_method, ReconMethod::Poisson);
    let recon = Reconstructor::new(params).unwrap();

    let mut events: Vec<ReconEvent> = vec![];
    let mut emit = |e: &ReconEvent| events.push(e.clone());
    let outputs = recon
        .run(&views, &depths, &out_dir, &mut emit, "rebuild")
        .unwrap();

    assert_eq!(outputs.mesh, out_dir.join("model.glb"));
    assert_eq!(outputs.texture, None);
    let glb = std::fs::read(&outputs.mesh).unwrap();
    let (doc, _) = decode_glb(&glb).unwrap();
    assert!(triangle_count(&doc) > 0);
    assert!(doc.get("images").is_none());

    let points = outputs.point_cloud.unwrap();
    assert!(ply_vertex_count(&points) > 0);

    let progress: Vec<f64> =
        events.iter().filter_map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    for milestone in [0.0, 0.2, 0.3, 0.55, 0.7, 0.8, 0.9, 1.0] {
        assert!(progress.contains(&milestone), "missing {}", milestone);
    }
    assert_eq!(progress.last(), Some(&1.0));
    assert!(!progress.contains(&0.95));

    let artifacts: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::Artifact)
        .map(|e| e.artifact.as_ref().unwrap().name.as_str())
        .collect();
    assert_eq!(artifacts, vec!["points", "mesh"]);
    assert!(events.iter().all(|e| e.stage == "rebuild"));
}

fn mesh_triangles(params: ReconParams, dir: &Path) -> u64 {
    let (views, depths) = write_views(dir);
    let recon = Reconstructor::new(params).unwrap();
    let outputs = recon
        .run_with_backends(
            &views,
            &depths,
            &dir.join("out"),
            &mut |_: &ReconEvent| {},
            "rebuild",
            &BakeBackends::none(),
        )
        .unwrap();
    let (doc, _) = decode_glb(&std::fs::read(&outputs.mesh).unwrap()).unwrap();
    triangle_count(&doc)
}

#[test]
fn test_default_poisson_depth_refines_mesh() {
    let mut params = scenario_params();
    params.points_enabled = false;
    params.recon_target_tris = 0;

    params.recon_poisson_depth = 5;
    let coarse_dir = tempfile::tempdir().unwrap();
    let coarse = mesh_triangles(params.clone(), coarse_dir.path());

    params.recon_poisson_depth = DEFAULT_POISSON_DEPTH;
    let fine_dir = tempfile::tempdir().unwrap();
    let fine = mesh_triangles(params, fine_dir.path());

    assert!(coarse > 0);
    assert!(fine > 2 * coarse, "depth 8: {}, depth 5: {}", fine, coarse);
}

#[test]
fn test_missing_texture_backends_fall_back() {
    let dir = tempfile::tempdir().unwrap();
    let (views, depths) = write_views(dir.path());
    let out_dir = dir.path().join("out");

    let mut params = scenario_params();
    params.texture_enabled = true;
    params.points_enabled = false;
    let recon = Reconstructor::new(params).unwrap();
    let outputs = recon
        .run_with_backends(
            &views,
            &depths,
            &out_dir,
            &mut |_: &ReconEvent| {},
            "rebuild",
            &BakeBackends::none(),
        )
        .unwrap();

    assert_eq!(outputs.texture, None);
    assert_eq!(outputs.point_cloud, None);
    assert!(!out_dir.join("points.ply").exists());
    let (doc, _) = decode_glb(&std::fs::read(&outputs.mesh).unwrap()).unwrap();
    assert!(triangle_count(&doc) > 0);
}

#[test]
fn test_atlas_texture_and_point_budget() {
    let dir = tempfile::tempdir().unwrap();
    let (views, depths) = write_views(dir.path());
    let out_dir = dir.path().join("out");

    let mut params = scenario_params();
    params.texture_enabled = true;
    params.texture_backend = TextureBackend::Atlas;
    params.texture_size = 256;
    params.points_max_points = 500;
    let recon = Reconstructor::new(params.clone()).unwrap();
    let backends = BakeBackends {
        atlas: true,
        blender: None,
    };
    assert_eq!(
        recon::bake::plan(&params, &backends),
        vec![BakeStrategy::Atlas, BakeStrategy::Untextured]
    );

    let mut progress = vec![];
    let mut emit = |e: &ReconEvent| progress.extend(e.progress);
    let outputs = recon
        .run_with_backends(
            &views, &depths, &out_dir, &mut emit, "rebuild", &backends,
        )
        .unwrap();

    let texture = outputs.texture.unwrap();
    assert_eq!(texture, out_dir.join("albedo.png"));
    assert_eq!(image::open(&texture).unwrap().width(), 256);
    let (doc, _) = decode_glb(&std::fs::read(&outputs.mesh).unwrap()).unwrap();
    assert!(doc["meshes"][0]["primitives"][0]["attributes"]
        .get("TEXCOORD_0")
        .is_some());
    assert!(progress.contains(&0.95));

    let points = outputs.point_cloud.unwrap();
    let count = ply_vertex_count(&points);
    assert!(count > 0 && count <= 500, "{} points", count);
}

#[test]
fn test_tsdf_alpha_independent() {
    let dir = tempfile::tempdir().unwrap();
    let (views, depths) = write_views(dir.path());

    let mut params = scenario_params();
    params.recon_fusion = FusionMode::Tsdf;
    params.recon_voxel_size = 0.02;
    let recon = Reconstructor::new(params).unwrap();
    let outputs = recon
        .run_with_backends(
            &views,
            &depths,
            &dir.path().join("out"),
            &mut |_: &ReconEvent| {},
            "tsdf",
            &BakeBackends::none(),
        )
        .unwrap();
    let (doc, _) = decode_glb(&std::fs::read(&outputs.mesh).unwrap()).unwrap();
    assert!(triangle_count(&doc) > 0);
}

#[test]
fn test_panicking_emitter_does_not_abort() {
    let dir = tempfile::tempdir().unwrap();
    let (views, depths) = write_views(dir.path());

    let recon = Reconstructor::new(scenario_params()).unwrap();
    let mut calls = 0;
    let mut emit = |_: &ReconEvent| {
        calls += 1;
        panic!("emitter failure");
    };
    let outputs = recon
        .run_with_backends(
            &views,
            &depths,
            &dir.path().join("out"),
            &mut emit,
            "rebuild",
            &BakeBackends::none(),
        )
        .unwrap();
    assert!(outputs.mesh.exists());
    assert!(calls > 0);
}
