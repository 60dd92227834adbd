//! Image manifest and config assembly.
//!
//! Produces the image config JSON and a Docker V2.2 or OCI manifest from the
//! resolved base image and the freshly built layers. All timestamps are
//! fixed, so the same inputs always produce the same digests.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::base::ResolvedBase;
use crate::context::{ContainerConfig, ImageFormat};
use crate::error::BuildError;
use crate::layer::{sha256_digest, CachedLayer};

pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// `created` value stamped on the config and on every history entry.
pub const REPRODUCIBLE_CREATED: &str = "1970-01-01T00:00:00Z";

const CREATED_BY: &str = "stevedore";

impl ImageFormat {
    pub fn manifest_media_type(self) -> &'static str {
        match self {
            ImageFormat::Docker => DOCKER_MANIFEST_MEDIA_TYPE,
            ImageFormat::Oci => OCI_MANIFEST_MEDIA_TYPE,
        }
    }

    pub fn config_media_type(self) -> &'static str {
        match self {
            ImageFormat::Docker => DOCKER_CONFIG_MEDIA_TYPE,
            ImageFormat::Oci => OCI_CONFIG_MEDIA_TYPE,
        }
    }

    pub fn layer_media_type(self) -> &'static str {
        match self {
            ImageFormat::Docker => DOCKER_LAYER_MEDIA_TYPE,
            ImageFormat::Oci => OCI_LAYER_MEDIA_TYPE,
        }
    }
}

/// Whether `media_type` names a manifest list or image index.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE || media_type == OCI_INDEX_MEDIA_TYPE
}

/// Image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Image config blob.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// The `config` section of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// A layer that was built for this image, with the name it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltLayer {
    pub name: String,
    pub layer: CachedLayer,
}

/// Output of the assemble stage: everything delivery needs.
///
/// Layer blobs are not held in memory; they are read from the layer
/// cache's blob store by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledImage {
    pub format: ImageFormat,
    pub manifest: Manifest,
    pub manifest_bytes: Vec<u8>,
    pub manifest_digest: String,
    pub config: ImageConfig,
    pub config_bytes: Vec<u8>,
    pub config_digest: String,
}

impl AssembledImage {
    /// Image ID as reported by the daemon: the config digest.
    pub fn image_id(&self) -> &str {
        &self.config_digest
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.config.rootfs.diff_ids
    }
}

/// Assemble config and manifest from the base image and built layers.
pub fn assemble(
    base: &ResolvedBase,
    built: &[BuiltLayer],
    container: &ContainerConfig,
) -> Result<AssembledImage, BuildError> {
    let format = container.format;
    let config = merge_config(&base.config, built, container);
    let config_bytes = serde_json::to_vec(&config)?;
    let config_digest = sha256_digest(&config_bytes);

    let mut layers = Vec::with_capacity(base.layers.len() + built.len());
    for descriptor in &base.layers {
        layers.push(Descriptor {
            media_type: layer_media_type_for(format, &descriptor.media_type)?,
            digest: descriptor.digest.clone(),
            size: descriptor.size,
        });
    }
    for built in built {
        layers.push(Descriptor {
            media_type: format.layer_media_type().to_string(),
            digest: built.layer.digest.clone(),
            size: built.layer.size,
        });
    }

    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(format.manifest_media_type().to_string()),
        config: Descriptor {
            media_type: format.config_media_type().to_string(),
            digest: config_digest.clone(),
            size: config_bytes.len() as u64,
        },
        layers,
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = sha256_digest(&manifest_bytes);

    debug!(
        manifest_digest = %manifest_digest,
        config_digest = %config_digest,
        layers = manifest.layers.len(),
        "Assembled image"
    );

    Ok(AssembledImage {
        format,
        manifest,
        manifest_bytes,
        manifest_digest,
        config,
        config_bytes,
        config_digest,
    })
}

fn layer_media_type_for(format: ImageFormat, media_type: &str) -> Result<String, BuildError> {
    match media_type {
        DOCKER_LAYER_MEDIA_TYPE | OCI_LAYER_MEDIA_TYPE => Ok(format.layer_media_type().to_string()),
        other => Err(BuildError::Manifest(format!(
            "unsupported base layer media type '{other}'"
        ))),
    }
}

fn merge_config(base: &ImageConfig, built: &[BuiltLayer], container: &ContainerConfig) -> ImageConfig {
    let inherited = &base.config;

    let entrypoint = container
        .entrypoint
        .clone()
        .or_else(|| inherited.entrypoint.clone());

    // A new entrypoint invalidates the base image's default arguments.
    let cmd = match (&container.cmd, &container.entrypoint) {
        (Some(cmd), _) => Some(cmd.clone()),
        (None, Some(_)) => None,
        (None, None) => inherited.cmd.clone(),
    };

    let env = merge_env(inherited.env.as_deref().unwrap_or_default(), &container.env);

    let mut ports: BTreeSet<String> = inherited
        .exposed_ports
        .iter()
        .flat_map(|ports| ports.keys().cloned())
        .collect();
    ports.extend(container.exposed_ports.iter().map(|p| normalize_port(p)));

    let mut labels = inherited.labels.clone().unwrap_or_default();
    labels.extend(container.labels.clone());

    let mut diff_ids = base.rootfs.diff_ids.clone();
    diff_ids.extend(built.iter().map(|b| b.layer.diff_id.clone()));

    let mut history = base.history.clone();
    history.extend(built.iter().map(|b| History {
        created: Some(REPRODUCIBLE_CREATED.to_string()),
        created_by: Some(CREATED_BY.to_string()),
        comment: Some(b.name.clone()),
        empty_layer: None,
    }));

    ImageConfig {
        created: Some(REPRODUCIBLE_CREATED.to_string()),
        architecture: container.architecture.clone(),
        os: container.os.clone(),
        config: RuntimeConfig {
            entrypoint,
            cmd,
            env: (!env.is_empty()).then_some(env),
            working_dir: container
                .working_dir
                .clone()
                .or_else(|| inherited.working_dir.clone()),
            user: container.user.clone().or_else(|| inherited.user.clone()),
            exposed_ports: (!ports.is_empty())
                .then(|| ports.into_iter().map(|p| (p, EmptyObject {})).collect()),
            labels: (!labels.is_empty()).then_some(labels),
        },
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids,
        },
        history,
    }
}

/// Base `K=V` entries keep their order; overridden keys are replaced in
/// place and new keys are appended in name order.
fn merge_env(base: &[String], overrides: &BTreeMap<String, String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut env: Vec<String> = base
        .iter()
        .map(|entry| {
            let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
            match overrides.get(key) {
                Some(value) => {
                    seen.insert(key.to_string());
                    format!("{key}={value}")
                }
                None => entry.clone(),
            }
        })
        .collect();

    for (key, value) in overrides {
        if !seen.contains(key) {
            env.push(format!("{key}={value}"));
        }
    }
    env
}

fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{port}/tcp")
    }
}
