//! CLI commands.

mod build;
mod doctor;
mod inspect;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use stevedore_builder::BuilderConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::output::OutputFormat;

/// stevedore - Build container images without a Dockerfile.
#[derive(Debug, Parser)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Log format on stderr (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Builder configuration file (TOML).
    #[arg(long, global = true, value_name = "PATH", env = "STEVEDORE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build an image from a build file and deliver it.
    Build(build::BuildCommand),

    /// Check that the container daemon is reachable.
    Doctor(doctor::DoctorCommand),

    /// Parse an image reference and print its components.
    Inspect(inspect::InspectCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let config = BuilderConfig::load(self.config.as_deref())?;
        init_tracing(self.log_format, &config.log_level);

        let ctx = CommandContext {
            config,
            format: self.format,
        };

        match self.command {
            Commands::Build(cmd) => cmd.run(ctx).await,
            Commands::Doctor(cmd) => cmd.run(ctx).await,
            Commands::Inspect(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("stevedore {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: BuilderConfig,
    pub format: OutputFormat,
}

/// Logs go to stderr so `--format json` output stays parseable.
fn init_tracing(format: LogFormat, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "inspect",
            "alpine",
            "--format",
            "json",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Inspect(_)));
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(Cli::try_parse_from(["stevedore", "--format", "yaml", "version"]).is_err());
    }
}
