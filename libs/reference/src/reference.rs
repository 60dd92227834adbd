//! The parsed image reference type.

use std::fmt;
use std::str::FromStr;

use crate::error::ReferenceError;
use crate::grammar::{is_valid_digest, is_valid_registry, is_valid_repository, is_valid_tag};

/// A validated `[registry/]repository[:tag|@digest]` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Registry used when a reference names none.
    pub const DEFAULT_REGISTRY: &'static str = "registry-1.docker.io";

    /// Tag implied when a reference names neither tag nor digest.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Repository namespace for single-component Docker Hub names.
    const LIBRARY_NAMESPACE: &'static str = "library";

    /// Aliases that all mean Docker Hub.
    const DOCKER_HUB_ALIASES: [&'static str; 3] =
        ["docker.io", "index.docker.io", Self::DEFAULT_REGISTRY];

    /// Parses a reference from its textual form.
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }

        if reference.chars().any(char::is_whitespace) {
            return Err(ReferenceError::InvalidFormat {
                reference: reference.to_string(),
                reason: "contains whitespace".to_string(),
            });
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (reference, None),
        };

        // A ':' after the last '/' introduces a tag; earlier ones belong to a registry port.
        let tag_start = name.rfind(':').filter(|&colon| {
            name.rfind('/').map_or(true, |slash| colon > slash)
        });
        let (name, tag) = match tag_start {
            Some(colon) => (&name[..colon], Some(&name[colon + 1..])),
            None => (name, None),
        };

        if tag.is_some() && digest.is_some() {
            return Err(ReferenceError::InvalidFormat {
                reference: reference.to_string(),
                reason: "both tag and digest are set".to_string(),
            });
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => (Some(first), rest),
            _ => (None, name),
        };

        Self::build(registry, repository, tag, digest)
    }

    /// Creates a reference from its components, validating each.
    ///
    /// `tag_or_digest` is treated as a digest when it contains a ':'.
    pub fn of(
        registry: Option<&str>,
        repository: &str,
        tag_or_digest: Option<&str>,
    ) -> Result<Self, ReferenceError> {
        match tag_or_digest {
            Some(value) if value.contains(':') => Self::build(registry, repository, None, Some(value)),
            tag => Self::build(registry, repository, tag, None),
        }
    }

    /// Returns the scratch (empty) base image reference.
    pub fn scratch() -> Self {
        Self {
            registry: Self::DEFAULT_REGISTRY.to_string(),
            repository: format!("{}/scratch", Self::LIBRARY_NAMESPACE),
            tag: None,
            digest: None,
        }
    }

    fn build(
        registry: Option<&str>,
        repository: &str,
        tag: Option<&str>,
        digest: Option<&str>,
    ) -> Result<Self, ReferenceError> {
        let registry = match registry {
            Some(registry) if Self::DOCKER_HUB_ALIASES.contains(&registry) => {
                Self::DEFAULT_REGISTRY
            }
            Some(registry) => registry,
            None => Self::DEFAULT_REGISTRY,
        };
        if !is_valid_registry(registry) {
            return Err(ReferenceError::InvalidRegistry(registry.to_string()));
        }

        if !is_valid_repository(repository) {
            return Err(ReferenceError::InvalidRepository(repository.to_string()));
        }
        let repository = if registry == Self::DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{}/{}", Self::LIBRARY_NAMESPACE, repository)
        } else {
            repository.to_string()
        };

        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(ReferenceError::InvalidTag(tag.to_string()));
            }
        }
        if let Some(digest) = digest {
            if !is_valid_digest(digest) {
                return Err(ReferenceError::InvalidDigest(digest.to_string()));
            }
        }

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: tag.map(str::to_string),
            digest: digest.map(str::to_string),
        })
    }

    /// Returns a copy of this reference pointing at `tag` instead.
    pub fn with_tag(&self, tag: &str) -> Result<Self, ReferenceError> {
        Self::build(Some(&self.registry), &self.repository, Some(tag), None)
    }

    /// Registry host, e.g. `ghcr.io` or `registry-1.docker.io`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path, e.g. `library/alpine`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Explicit tag, if one was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if the reference is pinned to one.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The tag or digest used to address the manifest.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(Self::DEFAULT_TAG)
    }

    /// True if neither tag nor digest was given.
    pub fn uses_default_tag(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// True if the reference is pinned to a digest.
    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// True if the registry is Docker Hub.
    pub fn is_docker_hub(&self) -> bool {
        self.registry == Self::DEFAULT_REGISTRY
    }

    /// True if this names the empty `scratch` base image.
    pub fn is_scratch(&self) -> bool {
        self.is_docker_hub()
            && self.repository == "library/scratch"
            && self.digest.is_none()
    }

    /// Formats the reference with the tag always spelled out,
    /// e.g. `myimage:latest` even when parsed from `myimage`.
    pub fn to_string_with_tag(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.short_name(), digest),
            None => format!(
                "{}:{}",
                self.short_name(),
                self.tag.as_deref().unwrap_or(Self::DEFAULT_TAG)
            ),
        }
    }

    /// Name without Docker Hub defaults: `alpine` rather than
    /// `registry-1.docker.io/library/alpine`.
    fn short_name(&self) -> String {
        if !self.is_docker_hub() {
            return format!("{}/{}", self.registry, self.repository);
        }

        let library_prefix = format!("{}/", Self::LIBRARY_NAMESPACE);
        let name = self
            .repository
            .strip_prefix(&library_prefix)
            .unwrap_or(&self.repository);

        // `docker.io/foo.bar/app` must not read back as registry `foo.bar`.
        match name.split_once('/') {
            Some((first, _)) if looks_like_registry(first) => format!("docker.io/{name}"),
            _ => name.to_string(),
        }
    }
}

/// The first path component is a registry if it is a valid host that looks
/// like one. Anything else, e.g. `my_org.v2/app`, stays part of a Docker Hub
/// repository path.
fn looks_like_registry(component: &str) -> bool {
    (component.contains('.') || component.contains(':') || component == "localhost")
        && is_valid_registry(component)
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")
        } else if let Some(tag) = &self.tag {
            write!(f, ":{tag}")
        } else {
            Ok(())
        }
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ImageReference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ImageReference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    #[test]
    fn test_parse_simple() {
        let r = ImageReference::parse("alpine:latest").unwrap();
        assert_eq!(r.registry(), "registry-1.docker.io");
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn test_parse_no_tag() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.tag(), None);
        assert!(r.uses_default_tag());
        assert_eq!(r.reference(), "latest");
        assert_eq!(r.to_string(), "alpine");
        assert_eq!(r.to_string_with_tag(), "alpine:latest");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/myapp").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "myapp");
        assert_eq!(r.tag(), None);
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{DIGEST}")).unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "org/app");
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.tag(), None);
        assert_eq!(r.reference(), DIGEST);
        assert!(r.is_digest());
    }

    #[test]
    fn test_docker_hub_aliases_normalize() {
        let a = ImageReference::parse("docker.io/alpine").unwrap();
        let b = ImageReference::parse("index.docker.io/library/alpine").unwrap();
        let c = ImageReference::parse("alpine").unwrap();
        assert_eq!(a, c);
        assert_eq!(b, c);
    }

    #[test]
    fn test_hub_repository_with_dotted_namespace() {
        let r = ImageReference::parse("my_org.v2/app").unwrap();
        assert!(r.is_docker_hub());
        assert_eq!(r.repository(), "my_org.v2/app");
        assert_eq!(r.to_string(), "my_org.v2/app");

        let r = ImageReference::parse("docker.io/foo.bar/app:1").unwrap();
        assert_eq!(r.repository(), "foo.bar/app");
        assert_eq!(r.to_string(), "docker.io/foo.bar/app:1");
        assert_eq!(ImageReference::parse(&r.to_string()).unwrap(), r);
    }

    #[test]
    fn test_tag_and_digest_rejected() {
        let err = ImageReference::parse(&format!("alpine:3.18@{DIGEST}")).unwrap_err();
        assert!(matches!(err, ReferenceError::InvalidFormat { .. }));
    }

    #[test]
    fn test_invalid_references() {
        assert_eq!(ImageReference::parse("").unwrap_err(), ReferenceError::Empty);
        assert!(matches!(
            ImageReference::parse("bad ref!!").unwrap_err(),
            ReferenceError::InvalidFormat { .. }
        ));
        assert!(matches!(
            ImageReference::parse("bad!!").unwrap_err(),
            ReferenceError::InvalidRepository(_)
        ));
        assert!(matches!(
            ImageReference::parse("alpine:-tag").unwrap_err(),
            ReferenceError::InvalidTag(_)
        ));
        assert!(matches!(
            ImageReference::parse("alpine@sha256:short").unwrap_err(),
            ReferenceError::InvalidDigest(_)
        ));
    }

    #[test]
    fn test_with_tag_clears_digest() {
        let r = ImageReference::parse(&format!("alpine@{DIGEST}")).unwrap();
        let tagged = r.with_tag("edge").unwrap();
        assert_eq!(tagged.tag(), Some("edge"));
        assert_eq!(tagged.digest(), None);
        assert_eq!(tagged.to_string(), "alpine:edge");
    }

    #[test]
    fn test_of() {
        let r = ImageReference::of(Some("gcr.io"), "project/image", Some("v1")).unwrap();
        assert_eq!(r.to_string(), "gcr.io/project/image:v1");

        let r = ImageReference::of(None, "busybox", Some(DIGEST)).unwrap();
        assert_eq!(r.digest(), Some(DIGEST));
    }

    #[test]
    fn test_scratch() {
        assert!(ImageReference::scratch().is_scratch());
        assert!(ImageReference::parse("scratch").unwrap().is_scratch());
        assert!(!ImageReference::parse("alpine").unwrap().is_scratch());
    }

    #[test]
    fn test_serde_roundtrip() {
        let r = ImageReference::parse("ghcr.io/org/app:v2").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"ghcr.io/org/app:v2\"");
        let parsed: ImageReference = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, r);
    }
}
