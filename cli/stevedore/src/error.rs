//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use stevedore_builder::{BuildError, PlanError, RegistryError};
use thiserror::Error;

use crate::buildfile::BuildFileError;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No image reference given. Pass --image or set `image` in {}.", .0.display())]
    MissingImage(PathBuf),

    #[error("--output is required when building to a tarball")]
    MissingOutput,

    #[error("--username and --password must be given together")]
    IncompleteCredential,

    #[error("{0}")]
    BuildFile(#[from] BuildFileError),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = hint_for(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::BuildFile(BuildFileError::Read { .. }) => {
                Some("Pass the build file with --file, or run from its directory.")
            }
            CliError::BuildFile(BuildFileError::MissingEnv(_)) => {
                Some("Export the base registry password before building.")
            }
            _ => None,
        };
    }

    let build_err = match err.downcast_ref::<PlanError>() {
        Some(plan_err) => &plan_err.error,
        None => err.downcast_ref::<BuildError>()?,
    };
    match build_err {
        BuildError::DaemonUnavailable { .. } => {
            Some("Is Docker installed? Point --docker at the daemon CLI, or run `stevedore doctor`.")
        }
        BuildError::DaemonTimeout { .. } => {
            Some("Raise daemon_timeout_secs or STEVEDORE_DAEMON_TIMEOUT for large images.")
        }
        BuildError::Registry(RegistryError::AuthRequired) => {
            Some("The registry rejected the request. Check --username and --password.")
        }
        BuildError::Registry(RegistryError::Http(_) | RegistryError::Timeout) => {
            Some("Check the registry host and your network connection. Use --insecure for plain-HTTP registries.")
        }
        BuildError::LayerBuild { .. } => {
            Some("Check the layer's source paths; they are relative to the build file.")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stevedore_builder::Stage;

    #[test]
    fn hints_for_daemon_failures() {
        let err = anyhow::Error::new(PlanError::new(
            Stage::Deliver,
            BuildError::DaemonTimeout {
                timeout: Duration::from_secs(1),
            },
        ));
        assert!(hint_for(&err).unwrap().contains("STEVEDORE_DAEMON_TIMEOUT"));

        let err = anyhow::Error::new(PlanError::new(Stage::Deliver, BuildError::Cancelled));
        assert!(hint_for(&err).is_none());

        let err = anyhow::Error::new(BuildError::DaemonUnavailable {
            executable: PathBuf::from("docker"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert!(hint_for(&err).unwrap().contains("--docker"));
    }

    #[test]
    fn hints_for_cli_errors() {
        let err = anyhow::Error::new(CliError::BuildFile(BuildFileError::MissingEnv(
            "TOKEN".to_string(),
        )));
        assert!(hint_for(&err).is_some());
        assert!(hint_for(&anyhow::Error::new(CliError::MissingOutput)).is_none());
    }
}
