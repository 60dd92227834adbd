//! Build command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, ValueEnum};
use stevedore_builder::{
    ArchiveTarget, BuildResult, Credential, DaemonTarget, LayerCache, RegistryTarget, TargetImage,
};
use stevedore_reference::ImageReference;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::buildfile::BuildFile;
use crate::error::CliError;
use crate::output::{print_field, print_json, print_success, OutputFormat};

use super::CommandContext;

/// Where a build is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetArg {
    /// Load into the local daemon with `docker load`.
    Docker,
    /// Push to a remote registry.
    Registry,
    /// Write a `docker save` tarball.
    Tar,
}

/// Build an image.
#[derive(Debug, Args)]
pub struct BuildCommand {
    /// Build file (TOML).
    #[arg(long, short = 'f', value_name = "PATH", default_value = "build.toml")]
    file: PathBuf,

    /// Build target.
    #[arg(long, value_enum, default_value_t = TargetArg::Docker)]
    to: TargetArg,

    /// Image reference. Overrides `image` in the build file.
    #[arg(long, value_name = "REF")]
    image: Option<String>,

    /// Additional tag. May be repeated.
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Docker CLI used for `--to docker`.
    #[arg(long, value_name = "PATH", env = "STEVEDORE_DOCKER")]
    docker: Option<PathBuf>,

    /// Environment for the Docker CLI. When given, replaces the inherited
    /// environment. May be repeated.
    #[arg(long = "docker-env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    docker_env: Vec<(String, String)>,

    /// Output path for `--to tar`.
    #[arg(long, short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Registry username for `--to registry`.
    #[arg(long, env = "STEVEDORE_REGISTRY_USERNAME")]
    username: Option<String>,

    /// Registry password for `--to registry`.
    #[arg(long, env = "STEVEDORE_REGISTRY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Talk plain HTTP to the target registry.
    #[arg(long)]
    insecure: bool,
}

impl BuildCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let build_file = BuildFile::load(&self.file).map_err(CliError::from)?;
        let target = self.target(&build_file)?;

        let cache = LayerCache::open(&ctx.config.cache_dir).map_err(|e| {
            anyhow::anyhow!(
                "failed to open layer cache {}: {e}",
                ctx.config.cache_dir.display()
            )
        })?;
        let context = build_file
            .into_context(Arc::new(cache), ctx.config.settings())
            .map_err(CliError::from)?;

        info!(
            kind = %target.kind(),
            image = %target.reference(),
            layers = context.layers.len(),
            "Starting build"
        );

        let plan = target.to_build_plan(context);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl-C, cancelling build");
                let _ = shutdown_tx.send(true);
            }
        });

        let result = plan.execute_until(shutdown_rx).await?;
        print_result(&result, ctx.format);
        Ok(())
    }

    /// Resolve the delivery target from flags and the build file.
    fn target(&self, build_file: &BuildFile) -> Result<TargetImage> {
        let reference = self
            .image
            .as_deref()
            .or(build_file.image.as_deref())
            .ok_or_else(|| CliError::MissingImage(self.file.clone()))?;
        let reference = ImageReference::parse(reference)?;

        let tags = build_file.tags.iter().chain(&self.tags);

        let target = match self.to {
            TargetArg::Docker => {
                let mut target = DaemonTarget::from_reference(reference);
                if let Some(docker) = &self.docker {
                    target.set_executable(docker);
                }
                target.set_environment(self.docker_env.iter().cloned().collect::<BTreeMap<_, _>>());
                for tag in tags {
                    target.add_tag(tag)?;
                }
                TargetImage::from(target)
            }
            TargetArg::Registry => {
                let mut target = RegistryTarget::from_reference(reference);
                match (&self.username, &self.password) {
                    (Some(username), Some(password)) => {
                        target = target.with_credential(Credential::new(username, password));
                    }
                    (None, None) => {}
                    _ => return Err(CliError::IncompleteCredential.into()),
                }
                target.set_insecure(self.insecure);
                for tag in tags {
                    target.add_tag(tag)?;
                }
                TargetImage::from(target)
            }
            TargetArg::Tar => {
                let output = self.output.clone().ok_or(CliError::MissingOutput)?;
                let mut target = ArchiveTarget::from_reference(reference, output);
                for tag in tags {
                    target.add_tag(tag)?;
                }
                TargetImage::from(target)
            }
        };

        Ok(target)
    }
}

fn print_result(result: &BuildResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(result),
        OutputFormat::Text => {
            match &result.tag {
                Some(tag) => print_success(&format!("Built {tag} ({})", result.target)),
                None => print_success(&format!("Built image ({})", result.target)),
            }
            print_field("digest", &result.image_digest);
            print_field("image id", &result.image_id);
            for tag in result.tags.iter().skip(1) {
                print_field("tag", tag);
            }
            if let Some(output) = &result.output {
                print_field("output", &output.display().to_string());
            }
            print_field("layers", &result.layers.len().to_string());
            print_field("duration", &format!("{}ms", result.duration_ms));
        }
    }
}

/// Parse a `KEY=VALUE` pair.
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;
    use stevedore_builder::TargetKind;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        build: BuildCommand,
    }

    fn parse(args: &[&str]) -> BuildCommand {
        let argv = std::iter::once("build").chain(args.iter().copied());
        Harness::try_parse_from(argv).unwrap().build
    }

    fn build_file(toml: &str) -> BuildFile {
        BuildFile::from_toml_str(toml, ".").unwrap()
    }

    #[rstest]
    #[case("A=1", ("A", "1"))]
    #[case("DOCKER_HOST=unix:///run/docker.sock", ("DOCKER_HOST", "unix:///run/docker.sock"))]
    #[case("EMPTY=", ("EMPTY", ""))]
    #[case("X=a=b", ("X", "a=b"))]
    fn env_pairs(#[case] input: &str, #[case] expected: (&str, &str)) {
        let (key, value) = parse_env_pair(input).unwrap();
        assert_eq!((key.as_str(), value.as_str()), expected);
    }

    #[rstest]
    #[case("NOVALUE")]
    #[case("=value")]
    fn bad_env_pairs(#[case] input: &str) {
        assert!(parse_env_pair(input).is_err());
    }

    #[test]
    fn docker_target_from_flags() {
        let cmd = parse(&[
            "--image",
            "myimage:dev",
            "--docker",
            "/opt/docker",
            "--docker-env",
            "DOCKER_HOST=tcp://10.0.0.1:2375",
            "--tag",
            "extra",
        ]);
        let target = cmd.target(&build_file("image = \"ignored\"\ntags = [\"stable\"]")).unwrap();

        assert_eq!(target.kind(), TargetKind::Daemon);
        assert_eq!(
            target.to_image_configuration().repo_tags(),
            ["myimage:dev", "myimage:stable", "myimage:extra"]
        );
        match target {
            TargetImage::Daemon(daemon) => {
                assert_eq!(daemon.executable(), std::path::Path::new("/opt/docker"));
                assert_eq!(
                    daemon.environment().get("DOCKER_HOST").map(String::as_str),
                    Some("tcp://10.0.0.1:2375")
                );
            }
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn image_falls_back_to_build_file() {
        let cmd = parse(&["--to", "registry"]);
        let target = cmd.target(&build_file("image = \"ghcr.io/org/app:1.0\"")).unwrap();
        assert_eq!(target.kind(), TargetKind::Registry);
        assert_eq!(target.reference().registry(), "ghcr.io");

        let err = cmd.target(&build_file("")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::MissingImage(_))
        ));
    }

    #[test]
    fn tar_target_requires_output() {
        let file = build_file("image = \"app\"");

        let err = parse(&["--to", "tar"]).target(&file).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::MissingOutput)));

        let target = parse(&["--to", "tar", "-o", "app.tar"]).target(&file).unwrap();
        assert_eq!(target.kind(), TargetKind::Archive);
    }

    #[test]
    fn registry_credentials_come_in_pairs() {
        let file = build_file("image = \"ghcr.io/org/app\"");

        let err = parse(&["--to", "registry", "--username", "bot"])
            .target(&file)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::IncompleteCredential)
        ));

        let target = parse(&["--to", "registry", "--username", "bot", "--password", "token"])
            .target(&file)
            .unwrap();
        let config = target.to_image_configuration();
        assert_eq!(config.credential().map(|c| c.username.as_str()), Some("bot"));
    }

    #[test]
    fn invalid_reference_is_rejected_before_building() {
        let err = parse(&["--image", "Not A Ref"]).target(&BuildFile::default()).unwrap_err();
        assert!(err.downcast_ref::<stevedore_reference::ReferenceError>().is_some());
    }
}
