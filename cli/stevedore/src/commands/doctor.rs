//! Doctor command.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use stevedore_builder::daemon::DEFAULT_DOCKER_EXECUTABLE;
use stevedore_builder::{BuildError, DaemonClient};

use crate::output::{print_field, print_json, print_success, OutputFormat};

use super::CommandContext;

/// Check the local build environment.
#[derive(Debug, Args)]
pub struct DoctorCommand {
    /// Docker CLI to check.
    #[arg(long, value_name = "PATH", env = "STEVEDORE_DOCKER")]
    docker: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    executable: PathBuf,
    daemon_reachable: bool,
    server_version: Option<String>,
    cache_dir: PathBuf,
    max_concurrent_layers: usize,
}

impl DoctorCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let executable = self
            .docker
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_EXECUTABLE));
        let client = DaemonClient::new(&executable, BTreeMap::new())
            .with_timeout(ctx.config.daemon_timeout());

        // Unreachable daemons surface as errors with a hint.
        let output = client.info().await.map_err(BuildError::from)?;

        let report = DoctorReport {
            executable,
            daemon_reachable: true,
            server_version: server_version(&output.stdout),
            cache_dir: ctx.config.cache_dir.clone(),
            max_concurrent_layers: ctx.config.max_concurrent_layers,
        };

        match ctx.format {
            OutputFormat::Json => print_json(&report),
            OutputFormat::Text => {
                print_success("Docker daemon is reachable");
                print_field("docker", &report.executable.display().to_string());
                if let Some(version) = &report.server_version {
                    print_field("server", version);
                }
                print_field("cache", &report.cache_dir.display().to_string());
                print_field("workers", &report.max_concurrent_layers.to_string());
            }
        }

        Ok(())
    }
}

/// Pull `Server Version: x` out of `docker info` output.
fn server_version(info: &str) -> Option<String> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("Server Version:"))
        .map(|version| version.trim().to_string())
        .find(|version| !version.is_empty())
}
