use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use structopt::StructOpt;

use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::cli::parse_key_val;
use base::util::fs::read_file;

use crate::params::ReconParams;
use crate::progress::ReconEvent;
use crate::reconstruct::Reconstructor;

#[derive(StructOpt)]
#[structopt(about = "Reconstruct a textured mesh from RGB-D views")]
pub struct RebuildCommand {
    #[structopt(
        help = "Color image of a view, in view order",
        long = "view",
        short = "v",
        parse(from_os_str),
        number_of_values = 1
    )]
    pub views: Vec<PathBuf>,

    #[structopt(
        help = "Depth image of a view, e.g. 0=depth_0.png",
        long = "depth",
        short = "d",
        parse(try_from_str = parse_key_val),
        number_of_values = 1
    )]
    pub depths: Vec<(usize, PathBuf)>,

    #[structopt(
        help = "Output directory",
        long = "output",
        short = "o",
        parse(from_os_str)
    )]
    pub out_dir: PathBuf,

    #[structopt(
        help = "Stage label attached to events",
        long,
        default_value = "rebuild"
    )]
    pub stage: String,

    #[structopt(
        help = "JSON file with parameter overrides",
        long,
        parse(from_os_str)
    )]
    pub overrides: Option<PathBuf>,

    #[structopt(help = "Log verbosity", long, default_value = "info")]
    pub log_level: LevelFilter,

    #[structopt(flatten)]
    pub params: ReconParams,
}

impl RebuildCommand {
    pub fn init_logging(&self) -> Result<()> {
        TermLogger::init(
            self.log_level,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        )
        .res(|| "failed to initialize logging".to_string())
    }

    /// Command line parameters with the overrides file applied.
    pub fn params(&self) -> Result<ReconParams> {
        let path = match &self.overrides {
            Some(path) => path,
            None => return Ok(self.params.clone()),
        };
        let data = read_file(path)?;
        let overrides: serde_json::Value = serde_json::from_slice(&data)
            .map_err(|err| {
                let desc = format!(
                    "malformed overrides file '{}': {}",
                    path.display(),
                    err
                );
                Error::new(MalformedData, desc)
            })?;
        self.params.with_overrides(&overrides)
    }

    pub fn depth_paths(&self) -> BTreeMap<usize, PathBuf> {
        self.depths.iter().cloned().collect()
    }

    /// Runs the reconstruction, printing every event to stdout as a line
    /// of JSON.
    pub fn run(&self) -> Result<()> {
        let recon = Reconstructor::new(self.params()?)?;
        let stdout = std::io::stdout();
        let mut emit = |event: &ReconEvent| {
            if let Ok(line) = serde_json::to_string(event) {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", line);
                let _ = out.flush();
            }
        };

        let outputs = recon.run(
            &self.views,
            &self.depth_paths(),
            &self.out_dir,
            &mut emit,
            &self.stage,
        )?;
        info!("mesh written to {}", outputs.mesh.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::params::ReconMethod;

    #[test]
    fn test_arguments() {
        let cmd = RebuildCommand::from_iter(&[
            "recon",
            "--view",
            "a.png",
            "-v",
            "b.png",
            "--depth",
            "1=b_depth.png",
            "-o",
            "out",
            "--recon-method",
            "alpha",
        ]);
        assert_eq!(cmd.views.len(), 2);
        assert_eq!(
            cmd.depth_paths().get(&1),
            Some(&PathBuf::from("b_depth.png"))
        );
        assert_eq!(cmd.stage, "rebuild");
        assert_eq!(cmd.log_level, LevelFilter::Info);
        assert_eq!(cmd.params.recon_method, ReconMethod::Alpha);
    }

    #[test]
    fn test_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        std::fs::write(&path, br#"{"recon_fusion": "tsdf"}"#).unwrap();
        let cmd = RebuildCommand::from_iter(&[
            "recon",
            "-o",
            "out",
            "--overrides",
            path.to_str().unwrap(),
        ]);
        let params = cmd.params().unwrap();
        assert_eq!(params.recon_fusion.to_string(), "tsdf");

        std::fs::write(&path, b"{").unwrap();
        assert_eq!(cmd.params().unwrap_err().kind, MalformedData);
    }

    #[test]
    fn test_malformed_depth_argument() {
        let res = RebuildCommand::from_iter_safe(&[
            "recon", "--depth", "nope", "-o", "out",
        ]);
        assert!(res.is_err());
    }
}
