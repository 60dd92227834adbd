//! Build context: everything a plan needs besides the delivery target.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stevedore_reference::ImageReference;

use crate::image::Credential;
use crate::layer::LayerCache;

/// The image a build starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    /// No base layers.
    Scratch,
    /// Pull manifest, config and layers from a registry.
    Registry {
        reference: ImageReference,
        credential: Option<Credential>,
    },
}

impl BaseImage {
    /// `scratch` maps to [`BaseImage::Scratch`]; anything else is pulled.
    pub fn from_reference(reference: ImageReference, credential: Option<Credential>) -> Self {
        if reference.is_scratch() {
            BaseImage::Scratch
        } else {
            BaseImage::Registry {
                reference,
                credential,
            }
        }
    }
}

/// Where a layer entry's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One file placed into a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Absolute path inside the container.
    pub target: String,
    pub source: EntrySource,
    pub mode: u32,
}

impl LayerEntry {
    pub const DEFAULT_FILE_MODE: u32 = 0o644;

    pub fn file(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: EntrySource::File(source.into()),
            mode: Self::DEFAULT_FILE_MODE,
        }
    }

    pub fn bytes(target: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            target: target.into(),
            source: EntrySource::Bytes(data.into()),
            mode: Self::DEFAULT_FILE_MODE,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// A named group of entries that becomes one image layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSource {
    pub name: String,
    pub entries: Vec<LayerEntry>,
}

impl LayerSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: LayerEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

/// Manifest flavour written for the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Docker,
    Oci,
}

/// Runtime configuration recorded in the image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Ports in `port[/protocol]` form, e.g. `8080/tcp`.
    pub exposed_ports: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub format: ImageFormat,
    pub architecture: String,
    pub os: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            entrypoint: None,
            cmd: None,
            env: BTreeMap::new(),
            working_dir: None,
            user: None,
            exposed_ports: BTreeSet::new(),
            labels: BTreeMap::new(),
            format: ImageFormat::Docker,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

/// Execution settings for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Worker pool size for the build-layers stage.
    pub max_concurrent_layers: usize,
    /// Deadline for the daemon subprocess.
    pub daemon_timeout: Option<Duration>,
    /// Timeout for each registry request.
    pub registry_timeout: Duration,
    /// Allow plain-HTTP registries for base images.
    pub allow_insecure_registries: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_concurrent_layers: 4,
            daemon_timeout: Some(Duration::from_secs(600)),
            registry_timeout: Duration::from_secs(300),
            allow_insecure_registries: false,
        }
    }
}

/// Shared, read-only input to every stage of a plan.
#[derive(Debug)]
pub struct BuildContext {
    pub base_image: BaseImage,
    pub layers: Vec<LayerSource>,
    pub container: ContainerConfig,
    pub cache: Arc<LayerCache>,
    pub settings: BuildSettings,
}

impl BuildContext {
    pub fn builder(cache: Arc<LayerCache>) -> BuildContextBuilder {
        BuildContextBuilder {
            base_image: BaseImage::Scratch,
            layers: Vec::new(),
            container: ContainerConfig::default(),
            cache,
            settings: BuildSettings::default(),
        }
    }
}

/// Builder for [`BuildContext`].
#[derive(Debug)]
pub struct BuildContextBuilder {
    base_image: BaseImage,
    layers: Vec<LayerSource>,
    container: ContainerConfig,
    cache: Arc<LayerCache>,
    settings: BuildSettings,
}

impl BuildContextBuilder {
    pub fn base_image(mut self, base_image: BaseImage) -> Self {
        self.base_image = base_image;
        self
    }

    pub fn layer(mut self, layer: LayerSource) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn layers(mut self, layers: impl IntoIterator<Item = LayerSource>) -> Self {
        self.layers.extend(layers);
        self
    }

    pub fn container(mut self, container: ContainerConfig) -> Self {
        self.container = container;
        self
    }

    pub fn settings(mut self, settings: BuildSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Arc<BuildContext> {
        Arc::new(BuildContext {
            base_image: self.base_image,
            layers: self.layers,
            container: self.container,
            cache: self.cache,
            settings: self.settings,
        })
    }
}
