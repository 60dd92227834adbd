//! Image configuration: the reference a build is tagged with, plus credentials.

use std::fmt;

use serde::{Deserialize, Serialize};
use stevedore_reference::{ImageReference, ReferenceError};

/// Username/password pair for registry authentication.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable description of the image being produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfiguration {
    reference: ImageReference,
    credential: Option<Credential>,
    additional_tags: Vec<String>,
}

impl ImageConfiguration {
    pub fn builder(reference: ImageReference) -> ImageConfigurationBuilder {
        ImageConfigurationBuilder {
            reference,
            credential: None,
            additional_tags: Vec::new(),
        }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn additional_tags(&self) -> &[String] {
        &self.additional_tags
    }

    /// The primary reference followed by one reference per additional tag.
    pub fn tagged_references(&self) -> Vec<ImageReference> {
        let mut refs = vec![self.reference.clone()];
        for tag in &self.additional_tags {
            // Tags were validated when added.
            if let Ok(tagged) = self.reference.with_tag(tag) {
                refs.push(tagged);
            }
        }
        refs
    }

    /// Names the daemon should record for the image, e.g. `myimage:latest`.
    ///
    /// Digest references cannot be applied as tags and are skipped.
    pub fn repo_tags(&self) -> Vec<String> {
        self.tagged_references()
            .iter()
            .filter(|r| !r.is_digest())
            .map(ImageReference::to_string_with_tag)
            .collect()
    }
}

/// Builder for [`ImageConfiguration`].
#[derive(Debug, Clone)]
pub struct ImageConfigurationBuilder {
    reference: ImageReference,
    credential: Option<Credential>,
    additional_tags: Vec<String>,
}

impl ImageConfigurationBuilder {
    pub fn credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Add an extra tag to apply to the built image.
    pub fn add_tag(mut self, tag: &str) -> Result<Self, ReferenceError> {
        self.reference.with_tag(tag)?;
        if !self.additional_tags.iter().any(|t| t == tag) {
            self.additional_tags.push(tag.to_string());
        }
        Ok(self)
    }

    /// Append tags that were already checked against the reference.
    pub(crate) fn validated_tags(mut self, tags: &[String]) -> Self {
        for tag in tags {
            if !self.additional_tags.contains(tag) {
                self.additional_tags.push(tag.clone());
            }
        }
        self
    }

    pub fn build(self) -> ImageConfiguration {
        ImageConfiguration {
            reference: self.reference,
            credential: self.credential,
            additional_tags: self.additional_tags,
        }
    }
}
