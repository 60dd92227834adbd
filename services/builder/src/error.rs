//! Error types for build plans.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use stevedore_reference::ReferenceError;
use thiserror::Error;

use crate::daemon::DaemonError;
use crate::registry::RegistryError;

/// A step of a build plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ResolveBaseImage,
    BuildLayers,
    AssembleManifest,
    Deliver,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 4] = [
        Stage::ResolveBaseImage,
        Stage::BuildLayers,
        Stage::AssembleManifest,
        Stage::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolveBaseImage => "resolve-base-image",
            Stage::BuildLayers => "build-layers",
            Stage::AssembleManifest => "assemble-manifest",
            Stage::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from constructing or executing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid image reference: {0}")]
    InvalidReference(#[from] ReferenceError),

    #[error("docker executable '{}' is unavailable: {source}", .executable.display())]
    DaemonUnavailable {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("docker load failed ({}): {stderr}", describe_exit(.exit_code))]
    Daemon {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("docker load did not finish within {}s", .timeout.as_secs())]
    DaemonTimeout { timeout: Duration },

    #[error("layer '{layer}' failed to build: {message}")]
    LayerBuild { layer: String, message: String },

    #[error("base image: {0}")]
    BaseImage(String),

    #[error("manifest assembly: {0}")]
    Manifest(String),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl BuildError {
    /// Standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BuildError::InvalidReference(_) => "invalid_reference",
            BuildError::DaemonUnavailable { .. } => "daemon_unavailable",
            BuildError::Daemon { .. } => "daemon_error",
            BuildError::DaemonTimeout { .. } => "daemon_timeout",
            BuildError::LayerBuild { .. } => "layer_build_error",
            BuildError::BaseImage(_) => "base_image_error",
            BuildError::Manifest(_) => "manifest_error",
            BuildError::Registry(_) => "registry_error",
            BuildError::Delivery(_) => "delivery_error",
            BuildError::Cancelled => "cancelled",
            BuildError::Io(_) => "io_error",
            BuildError::Json(_) => "json_error",
        }
    }

    /// Captured standard error of a failed daemon invocation.
    pub fn daemon_stderr(&self) -> Option<&str> {
        match self {
            BuildError::Daemon { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

impl From<DaemonError> for BuildError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Unavailable { executable, source } => {
                BuildError::DaemonUnavailable { executable, source }
            }
            DaemonError::Failed { exit_code, stderr } => BuildError::Daemon { exit_code, stderr },
            DaemonError::Timeout { timeout } => BuildError::DaemonTimeout { timeout },
            DaemonError::Io(e) => BuildError::Io(e),
        }
    }
}

/// A build error tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct PlanError {
    pub stage: Stage,
    #[source]
    pub error: BuildError,
}

impl PlanError {
    pub fn new(stage: Stage, error: impl Into<BuildError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }

    pub fn into_error(self) -> BuildError {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = Stage::ALL.iter().map(Stage::as_str).collect();
        assert_eq!(
            names,
            ["resolve-base-image", "build-layers", "assemble-manifest", "deliver"]
        );
    }

    #[test]
    fn test_daemon_error_display_includes_stderr() {
        let err = PlanError::new(
            Stage::Deliver,
            BuildError::Daemon {
                exit_code: Some(1),
                stderr: "no such image\n".to_string(),
            },
        );
        let text = err.to_string();
        assert!(text.starts_with("deliver stage failed"));
        assert!(text.contains("exit code 1"));
        assert!(text.contains("no such image"));
        assert_eq!(err.error.reason_code(), "daemon_error");
    }

    #[test]
    fn test_daemon_error_mapping() {
        let err: BuildError = DaemonError::Timeout {
            timeout: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(err, BuildError::DaemonTimeout { .. }));
    }
}
