//! Base image resolution.

use std::time::Instant;

use tracing::info;

use crate::context::{BaseImage, BuildSettings};
use crate::error::BuildError;
use crate::layer::BlobStore;
use crate::manifest::{Descriptor, ImageConfig};
use crate::registry::{RegistryClient, RegistryConfig};

/// The base image's config and layers, with every layer blob in the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedBase {
    pub config: ImageConfig,
    pub layers: Vec<Descriptor>,
}

impl ResolvedBase {
    pub fn scratch() -> Self {
        Self::default()
    }
}

/// Resolve `base` into config and layers, pulling missing blobs into `store`.
pub async fn resolve(
    base: &BaseImage,
    store: &BlobStore,
    settings: &BuildSettings,
) -> Result<ResolvedBase, BuildError> {
    let (reference, credential) = match base {
        BaseImage::Scratch => return Ok(ResolvedBase::scratch()),
        BaseImage::Registry {
            reference,
            credential,
        } => (reference, credential),
    };

    let start = Instant::now();
    let config = RegistryConfig::for_registry(
        reference.registry(),
        settings.allow_insecure_registries,
        settings.registry_timeout,
    )
    .with_credential(credential.clone());
    let client = RegistryClient::new(config)?;

    let repo = reference.repository();
    let pulled = client.pull_manifest(repo, &reference.reference()).await?;

    let config_bytes = client
        .pull_blob_bytes(repo, &pulled.manifest.config.digest)
        .await?;
    let config: ImageConfig = serde_json::from_slice(&config_bytes)
        .map_err(|e| BuildError::BaseImage(format!("invalid config for {reference}: {e}")))?;

    if config.rootfs.diff_ids.len() != pulled.manifest.layers.len() {
        return Err(BuildError::BaseImage(format!(
            "{reference} lists {} layers but {} diff ids",
            pulled.manifest.layers.len(),
            config.rootfs.diff_ids.len()
        )));
    }

    for layer in &pulled.manifest.layers {
        client.pull_blob(repo, &layer.digest, store).await?;
    }

    info!(
        base = %reference,
        digest = %pulled.digest,
        layers = pulled.manifest.layers.len(),
        size = pulled.manifest.total_layer_size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Resolved base image"
    );

    Ok(ResolvedBase {
        config,
        layers: pulled.manifest.layers,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stevedore_reference::ImageReference;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::layer::sha256_digest;
    use crate::manifest::{DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE};

    fn settings() -> BuildSettings {
        BuildSettings {
            allow_insecure_registries: true,
            registry_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scratch_resolves_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(&BaseImage::Scratch, &BlobStore::new(dir.path()), &settings())
            .await
            .unwrap();
        assert_eq!(resolved, ResolvedBase::scratch());
    }

    #[tokio::test]
    async fn test_pulls_manifest_config_and_layers() {
        let server = MockServer::start().await;
        let host = server.address().to_string();

        let layer = b"layer-bytes".to_vec();
        let layer_digest = sha256_digest(&layer);
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Cmd": ["sh"], "Env": ["PATH=/bin"]},
            "rootfs": {"type": "layers", "diff_ids": [sha256_digest(b"layer-tar")]}
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = sha256_digest(&config_bytes);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_MEDIA_TYPE,
            "config": {"mediaType": DOCKER_CONFIG_MEDIA_TYPE, "digest": config_digest, "size": config_bytes.len()},
            "layers": [{"mediaType": DOCKER_LAYER_MEDIA_TYPE, "digest": layer_digest, "size": layer.len()}]
        });

        Mock::given(method("GET"))
            .and(path("/v2/base/manifests/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/base/blobs/{config_digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(config_bytes.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/base/blobs/{layer_digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let base = BaseImage::from_reference(
            ImageReference::parse(&format!("{host}/base:1.0")).unwrap(),
            None,
        );

        let resolved = resolve(&base, &store, &settings()).await.unwrap();
        assert_eq!(resolved.layers.len(), 1);
        assert_eq!(resolved.config.config.cmd, Some(vec!["sh".to_string()]));
        assert!(store.exists(&layer_digest));

        // Second resolve reuses the stored layer blob.
        resolve(&base, &store, &settings()).await.unwrap();
    }
}
