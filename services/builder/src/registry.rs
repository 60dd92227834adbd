//! OCI distribution client for pulling base images and pushing built ones.
//!
//! Supports the subset of the distribution API the builder needs: manifest
//! and blob GETs, blob existence checks, monolithic blob uploads and
//! manifest PUTs. Authentication is HTTP basic auth only.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

use crate::image::Credential;
use crate::layer::{sha256_digest, BlobStore};
use crate::manifest::{
    is_index_media_type, AssembledImage, Manifest, DOCKER_MANIFEST_MEDIA_TYPE,
    OCI_MANIFEST_MEDIA_TYPE,
};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Unsupported manifest type: {0}")]
    UnsupportedManifest(String),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Upload session response carried no Location header")]
    MissingLocation,

    #[error("Registry request timed out")]
    Timeout,
}

/// Configuration for a registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL, e.g. `https://ghcr.io`.
    pub registry_url: String,
    pub credential: Option<Credential>,
    /// Timeout applied to each request.
    pub timeout: Duration,
}

impl RegistryConfig {
    /// Config for `registry` (a host with optional port), over plain HTTP when
    /// `insecure` is set.
    pub fn for_registry(registry: &str, insecure: bool, timeout: Duration) -> Self {
        let scheme = if insecure { "http" } else { "https" };
        Self {
            registry_url: format!("{scheme}://{registry}"),
            credential: None,
            timeout,
        }
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }
}

/// A manifest fetched from a registry with its digest.
#[derive(Debug, Clone)]
pub struct PulledManifest {
    pub manifest: Manifest,
    pub digest: String,
}

/// Registry HTTP client.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    config: RegistryConfig,
    client: Client,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self { config, client })
    }

    pub fn registry_url(&self) -> &str {
        &self.config.registry_url
    }

    /// Pull an image manifest by tag or digest.
    ///
    /// Digest references are verified against the body. Manifest lists and
    /// image indexes are rejected.
    pub async fn pull_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<PulledManifest, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, repo, reference
        );

        debug!(url = %url, "Pulling manifest");

        let request = self.client.get(&url).header(
            ACCEPT,
            format!("{OCI_MANIFEST_MEDIA_TYPE}, {DOCKER_MANIFEST_MEDIA_TYPE}"),
        );
        let response = self.send(request).await?;
        let response = check_status(response, &url, reference, &[StatusCode::OK])?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(map_reqwest)?;

        let digest = sha256_digest(&body);
        if reference.contains(':') && digest != reference {
            return Err(RegistryError::DigestMismatch {
                expected: reference.to_string(),
                actual: digest,
            });
        }

        let value: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = value
            .get("mediaType")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or(content_type)
            .unwrap_or_default();
        if is_index_media_type(&media_type) || value.get("manifests").is_some() {
            return Err(RegistryError::UnsupportedManifest(media_type));
        }

        let manifest: Manifest = serde_json::from_value(value)?;
        Ok(PulledManifest { manifest, digest })
    }

    /// Pull a blob into memory, verifying its digest.
    pub async fn pull_blob_bytes(&self, repo: &str, digest: &str) -> Result<Bytes, RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.registry_url, repo, digest);

        debug!(url = %url, "Pulling blob");

        let response = self.send(self.client.get(&url)).await?;
        let response = check_status(response, &url, digest, &[StatusCode::OK])?;
        let bytes = response.bytes().await.map_err(map_reqwest)?;

        let computed = sha256_digest(&bytes);
        if computed != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        Ok(bytes)
    }

    /// Pull a blob into `store`, skipping the download if it is already there.
    pub async fn pull_blob(
        &self,
        repo: &str,
        digest: &str,
        store: &BlobStore,
    ) -> Result<u64, RegistryError> {
        let path = store.blob_path(digest);
        if store.exists(digest) {
            debug!(digest = %digest, "Blob already present");
            return Ok(tokio::fs::metadata(&path).await?.len());
        }

        let bytes = self.pull_blob_bytes(repo, digest).await?;
        let store = store.clone();
        let digest_owned = digest.to_string();
        let size = bytes.len() as u64;
        tokio::task::spawn_blocking(move || store.write(&digest_owned, &bytes))
            .await
            .map_err(std::io::Error::other)??;

        info!(digest = %digest, size = size, "Blob downloaded");

        Ok(size)
    }

    /// Check whether the registry already has a blob.
    pub async fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool, RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.registry_url, repo, digest);

        let response = self.send(self.client.head(&url)).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired),
            status => Err(RegistryError::UnexpectedStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Upload a blob in a single request: open a session, then PUT the bytes.
    pub async fn push_blob(
        &self,
        repo: &str,
        digest: &str,
        bytes: Bytes,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.config.registry_url, repo);

        let response = self.send(self.client.post(&url)).await?;
        let response = check_status(response, &url, repo, &[StatusCode::ACCEPTED])?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(RegistryError::MissingLocation)?;
        let upload_url = self.upload_url(location, digest);

        let size = bytes.len();
        let request = self
            .client
            .put(&upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let response = self.send(request).await?;
        check_status(response, &upload_url, digest, &[StatusCode::CREATED])?;

        debug!(digest = %digest, size = size, "Blob pushed");

        Ok(())
    }

    /// PUT a manifest under `reference`, returning its digest.
    pub async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<String, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, repo, reference
        );
        let computed = sha256_digest(&body);

        let request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, media_type)
            .body(body);
        let response = self.send(request).await?;
        let response = check_status(response, &url, reference, &[StatusCode::CREATED])?;

        let digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(computed);

        info!(repo = %repo, reference = %reference, digest = %digest, "Manifest pushed");

        Ok(digest)
    }

    /// Push every blob of `image` that the registry lacks, then its manifest
    /// under each of `references`. Returns the manifest digest.
    pub async fn push_image(
        &self,
        repo: &str,
        references: &[String],
        image: &AssembledImage,
        store: &BlobStore,
    ) -> Result<String, RegistryError> {
        for layer in image.layers() {
            if self.blob_exists(repo, &layer.digest).await? {
                debug!(digest = %layer.digest, "Layer already in registry");
                continue;
            }
            let bytes = tokio::fs::read(store.blob_path(&layer.digest)).await?;
            self.push_blob(repo, &layer.digest, Bytes::from(bytes)).await?;
        }

        if !self.blob_exists(repo, &image.config_digest).await? {
            self.push_blob(
                repo,
                &image.config_digest,
                Bytes::from(image.config_bytes.clone()),
            )
            .await?;
        }

        let mut digest = image.manifest_digest.clone();
        for reference in references {
            digest = self
                .push_manifest(
                    repo,
                    reference,
                    image.format.manifest_media_type(),
                    image.manifest_bytes.clone(),
                )
                .await?;
        }

        Ok(digest)
    }

    fn upload_url(&self, location: &str, digest: &str) -> String {
        let base = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{}", self.config.registry_url, location)
        };
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}digest={digest}")
    }

    async fn send(&self, mut request: RequestBuilder) -> Result<Response, RegistryError> {
        if let Some(credential) = &self.config.credential {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }
        request.send().await.map_err(map_reqwest)
    }
}

fn map_reqwest(e: reqwest::Error) -> RegistryError {
    if e.is_timeout() {
        RegistryError::Timeout
    } else {
        RegistryError::Http(e)
    }
}

fn check_status(
    response: Response,
    url: &str,
    subject: &str,
    expected: &[StatusCode],
) -> Result<Response, RegistryError> {
    match response.status() {
        status if expected.contains(&status) => Ok(response),
        StatusCode::NOT_FOUND => Err(RegistryError::NotFound(subject.to_string())),
        StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired),
        status => Err(RegistryError::UnexpectedStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> RegistryClient {
        RegistryClient::new(RegistryConfig {
            registry_url: server.uri(),
            credential: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_for_registry_scheme() {
        let secure = RegistryConfig::for_registry("ghcr.io", false, Duration::from_secs(1));
        assert_eq!(secure.registry_url, "https://ghcr.io");
        let insecure = RegistryConfig::for_registry("localhost:5000", true, Duration::from_secs(1));
        assert_eq!(insecure.registry_url, "http://localhost:5000");
    }

    #[test]
    fn test_upload_url() {
        let client = RegistryClient::new(RegistryConfig::for_registry(
            "registry.local",
            false,
            Duration::from_secs(1),
        ))
        .unwrap();

        assert_eq!(
            client.upload_url("/v2/app/blobs/uploads/abc", "sha256:1"),
            "https://registry.local/v2/app/blobs/uploads/abc?digest=sha256:1"
        );
        assert_eq!(
            client.upload_url("https://up.local/session?_state=x", "sha256:1"),
            "https://up.local/session?_state=x&digest=sha256:1"
        );
    }

    #[tokio::test]
    async fn test_blob_exists() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/v2/app/blobs/sha256:present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/v2/app/blobs/sha256:absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.blob_exists("app", "sha256:present").await.unwrap());
        assert!(!client.blob_exists("app", "sha256:absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_blob_verifies_digest() {
        let server = MockServer::start().await;
        let digest = sha256_digest(b"expected");
        Mock::given(method("GET"))
            .and(path(format!("/v2/app/blobs/{digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .pull_blob_bytes("app", &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_pull_manifest_rejects_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/library/alpine/manifests/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": []
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .pull_manifest("library/alpine", "latest")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedManifest(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/private/manifests/latest"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .pull_manifest("private", "latest")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AuthRequired));
    }

    #[tokio::test]
    async fn test_basic_auth_header_sent() {
        let server = MockServer::start().await;
        // "user:secret"
        Mock::given(method("HEAD"))
            .and(path("/v2/app/blobs/sha256:abc"))
            .and(header("authorization", "Basic dXNlcjpzZWNyZXQ="))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = RegistryClient::new(RegistryConfig {
            registry_url: server.uri(),
            credential: Some(Credential::new("user", "secret")),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert!(client.blob_exists("app", "sha256:abc").await.unwrap());
    }
}
