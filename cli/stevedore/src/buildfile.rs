//! Build file parsing.
//!
//! A build file is TOML describing the base image, the layers to add and the
//! container runtime settings:
//!
//! ```toml
//! image = "myimage:latest"
//! tags = ["stable"]
//!
//! [base]
//! image = "gcr.io/distroless/cc"
//!
//! [container]
//! entrypoint = ["/app/server"]
//! exposed_ports = ["8080"]
//!
//! [[layers]]
//! name = "app"
//!
//! [[layers.files]]
//! source = "target/release/server"
//! target = "/app/server"
//! mode = 0o755
//! ```
//!
//! Relative `source` paths are resolved against the build file's directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use stevedore_builder::{
    BaseImage, BuildContext, BuildSettings, ContainerConfig, Credential, LayerCache, LayerEntry,
    LayerSource,
};
use stevedore_reference::{ImageReference, ReferenceError};
use thiserror::Error;

/// Errors from loading a build file.
#[derive(Debug, Error)]
pub enum BuildFileError {
    #[error("failed to read build file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse build file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid base image: {0}")]
    BaseImage(#[from] ReferenceError),

    #[error("layer '{layer}': {message}")]
    Layer { layer: String, message: String },

    #[error("{0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

/// Parsed build file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildFile {
    /// Default image reference for the build.
    pub image: Option<String>,
    /// Additional tags applied alongside the reference's own.
    #[serde(default)]
    pub tags: Vec<String>,
    pub base: Option<BaseSection>,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub layers: Vec<LayerSection>,

    /// Directory relative sources are resolved against.
    #[serde(skip)]
    root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseSection {
    pub image: String,
    pub username: Option<String>,
    /// Name of the environment variable holding the registry password.
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSection {
    pub name: String,
    #[serde(default)]
    pub files: Vec<FileSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSection {
    /// Host path to copy from.
    pub source: Option<PathBuf>,
    /// Inline file content.
    pub content: Option<String>,
    /// Absolute path inside the container.
    pub target: String,
    pub mode: Option<u32>,
}

impl BuildFile {
    /// Read and validate a build file.
    pub fn load(path: &Path) -> Result<Self, BuildFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| BuildFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::from_toml_str(&contents, root).map_err(|e| match e {
            BuildFileError::Parse { source, .. } => BuildFileError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse build file contents, resolving sources against `root`.
    pub fn from_toml_str(contents: &str, root: impl Into<PathBuf>) -> Result<Self, BuildFileError> {
        let mut file: BuildFile =
            toml::from_str(contents).map_err(|source| BuildFileError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        file.root = root.into();
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), BuildFileError> {
        if let Some(base) = &self.base {
            ImageReference::parse(&base.image)?;
            if base.password_env.is_some() != base.username.is_some() {
                return Err(BuildFileError::Invalid(
                    "base.username and base.password_env must be set together".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for layer in &self.layers {
            if layer.name.trim().is_empty() {
                return Err(BuildFileError::Invalid("layer name must not be empty".to_string()));
            }
            if !names.insert(layer.name.as_str()) {
                return Err(layer_error(&layer.name, "duplicate layer name"));
            }
            for file in &layer.files {
                file.validate(&layer.name)?;
            }
        }

        Ok(())
    }

    /// Base image for the build, reading any password through `lookup`.
    pub fn base_image<F>(&self, lookup: F) -> Result<BaseImage, BuildFileError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(base) = &self.base else {
            return Ok(BaseImage::Scratch);
        };

        let reference = ImageReference::parse(&base.image)?;
        let credential = match (&base.username, &base.password_env) {
            (Some(username), Some(var)) => {
                let password = lookup(var).ok_or_else(|| BuildFileError::MissingEnv(var.clone()))?;
                Some(Credential::new(username, password))
            }
            _ => None,
        };

        Ok(BaseImage::from_reference(reference, credential))
    }

    /// Layer sources with host paths resolved.
    pub fn layer_sources(&self) -> Vec<LayerSource> {
        self.layers
            .iter()
            .map(|layer| {
                layer
                    .files
                    .iter()
                    .fold(LayerSource::new(&layer.name), |source, file| {
                        source.with_entry(file.to_entry(&self.root))
                    })
            })
            .collect()
    }

    /// Turn the build file into a build context.
    pub fn into_context(
        self,
        cache: Arc<LayerCache>,
        settings: BuildSettings,
    ) -> Result<Arc<BuildContext>, BuildFileError> {
        let base_image = self.base_image(|var| std::env::var(var).ok())?;
        let layers = self.layer_sources();

        Ok(BuildContext::builder(cache)
            .base_image(base_image)
            .layers(layers)
            .container(self.container)
            .settings(settings)
            .build())
    }
}

impl FileSection {
    fn validate(&self, layer: &str) -> Result<(), BuildFileError> {
        if !self.target.starts_with('/') {
            return Err(layer_error(
                layer,
                format!("target '{}' must be an absolute path", self.target),
            ));
        }
        match (&self.source, &self.content) {
            (Some(_), Some(_)) => Err(layer_error(
                layer,
                format!("'{}' sets both source and content", self.target),
            )),
            (None, None) => Err(layer_error(
                layer,
                format!("'{}' needs a source or content", self.target),
            )),
            _ => match self.mode {
                Some(mode) if mode > 0o7777 => Err(layer_error(
                    layer,
                    format!("'{}' has invalid mode {mode:o}", self.target),
                )),
                _ => Ok(()),
            },
        }
    }

    fn to_entry(&self, root: &Path) -> LayerEntry {
        let entry = match (&self.source, &self.content) {
            (Some(source), _) => LayerEntry::file(root.join(source), &self.target),
            (None, content) => {
                LayerEntry::bytes(&self.target, content.clone().unwrap_or_default())
            }
        };

        match self.mode {
            Some(mode) => entry.with_mode(mode),
            None => entry,
        }
    }
}

fn layer_error(layer: &str, message: impl Into<String>) -> BuildFileError {
    BuildFileError::Layer {
        layer: layer.to_string(),
        message: message.into(),
    }
}
