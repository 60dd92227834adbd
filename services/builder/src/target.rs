//! Build targets: where a built image is delivered.
//!
//! Every target turns into an [`ImageConfiguration`] and a [`BuildPlan`].
//! Plans share the resolve, layer and assemble stages and differ only in the
//! delivery client wired into the final stage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use stevedore_reference::{ImageReference, ReferenceError};

use crate::archive::ArchiveWriter;
use crate::context::BuildContext;
use crate::daemon::{DaemonClient, DaemonSettings};
use crate::image::{Credential, ImageConfiguration};
use crate::plan::{BuildPlan, Delivery};
use crate::registry::RegistryConfig;

/// Which kind of target a plan delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Daemon,
    Registry,
    Archive,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Daemon => "daemon",
            TargetKind::Registry => "registry",
            TargetKind::Archive => "archive",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn validated_tag(reference: &ImageReference, tags: &mut Vec<String>, tag: &str) -> Result<(), ReferenceError> {
    reference.with_tag(tag)?;
    if !tags.iter().any(|t| t == tag) {
        tags.push(tag.to_string());
    }
    Ok(())
}

fn image_configuration(
    reference: &ImageReference,
    credential: Option<Credential>,
    tags: &[String],
) -> ImageConfiguration {
    ImageConfiguration::builder(reference.clone())
        .credential(credential)
        .validated_tags(tags)
        .build()
}

/// Builds to the local container daemon via `<executable> load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonTarget {
    reference: ImageReference,
    settings: DaemonSettings,
    additional_tags: Vec<String>,
}

impl DaemonTarget {
    /// Target tagged with `reference`, which is parsed immediately.
    pub fn named(reference: &str) -> Result<Self, ReferenceError> {
        Ok(Self::from_reference(ImageReference::parse(reference)?))
    }

    pub fn from_reference(reference: ImageReference) -> Self {
        Self {
            reference,
            settings: DaemonSettings::default(),
            additional_tags: Vec::new(),
        }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Path to the daemon CLI. Relative names are looked up on `PATH` when the
    /// plan runs.
    pub fn set_executable(&mut self, executable: impl Into<PathBuf>) -> &mut Self {
        self.settings.executable = executable.into();
        self
    }

    pub fn executable(&self) -> &Path {
        &self.settings.executable
    }

    /// Environment for the daemon CLI. A non-empty map replaces the inherited
    /// environment; an empty one restores inheritance.
    pub fn set_environment(&mut self, environment: BTreeMap<String, String>) -> &mut Self {
        self.settings.environment = environment;
        self
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.settings.environment
    }

    pub fn add_tag(&mut self, tag: &str) -> Result<&mut Self, ReferenceError> {
        validated_tag(&self.reference, &mut self.additional_tags, tag)?;
        Ok(self)
    }

    /// Snapshot of the current executable and environment.
    pub fn settings(&self) -> DaemonSettings {
        self.settings.clone()
    }

    pub fn to_image_configuration(&self) -> ImageConfiguration {
        image_configuration(&self.reference, None, &self.additional_tags)
    }

    pub fn to_build_plan(&self, context: Arc<BuildContext>) -> BuildPlan {
        let client = DaemonClient::from_settings(self.settings())
            .with_timeout(context.settings.daemon_timeout);
        BuildPlan::new(
            self.to_image_configuration(),
            context,
            Delivery::Daemon(client),
        )
    }
}

/// Pushes to a remote registry over the distribution API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTarget {
    reference: ImageReference,
    credential: Option<Credential>,
    insecure: bool,
    additional_tags: Vec<String>,
}

impl RegistryTarget {
    pub fn named(reference: &str) -> Result<Self, ReferenceError> {
        Ok(Self::from_reference(ImageReference::parse(reference)?))
    }

    pub fn from_reference(reference: ImageReference) -> Self {
        Self {
            reference,
            credential: None,
            insecure: false,
            additional_tags: Vec::new(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Talk plain HTTP to the registry.
    pub fn set_insecure(&mut self, insecure: bool) -> &mut Self {
        self.insecure = insecure;
        self
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    pub fn add_tag(&mut self, tag: &str) -> Result<&mut Self, ReferenceError> {
        validated_tag(&self.reference, &mut self.additional_tags, tag)?;
        Ok(self)
    }

    pub fn to_image_configuration(&self) -> ImageConfiguration {
        image_configuration(&self.reference, self.credential.clone(), &self.additional_tags)
    }

    pub fn to_build_plan(&self, context: Arc<BuildContext>) -> BuildPlan {
        let config = RegistryConfig::for_registry(
            self.reference.registry(),
            self.insecure,
            context.settings.registry_timeout,
        )
        .with_credential(self.credential.clone());
        BuildPlan::new(
            self.to_image_configuration(),
            context,
            Delivery::Registry(config),
        )
    }
}

/// Writes a `docker save` tarball to a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    reference: ImageReference,
    output_path: PathBuf,
    additional_tags: Vec<String>,
}

impl ArchiveTarget {
    pub fn named(reference: &str, output_path: impl Into<PathBuf>) -> Result<Self, ReferenceError> {
        Ok(Self::from_reference(
            ImageReference::parse(reference)?,
            output_path,
        ))
    }

    pub fn from_reference(reference: ImageReference, output_path: impl Into<PathBuf>) -> Self {
        Self {
            reference,
            output_path: output_path.into(),
            additional_tags: Vec::new(),
        }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn add_tag(&mut self, tag: &str) -> Result<&mut Self, ReferenceError> {
        validated_tag(&self.reference, &mut self.additional_tags, tag)?;
        Ok(self)
    }

    pub fn to_image_configuration(&self) -> ImageConfiguration {
        image_configuration(&self.reference, None, &self.additional_tags)
    }

    pub fn to_build_plan(&self, context: Arc<BuildContext>) -> BuildPlan {
        BuildPlan::new(
            self.to_image_configuration(),
            context,
            Delivery::Archive(ArchiveWriter::new(self.output_path.clone())),
        )
    }
}

/// A delivery destination for a built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetImage {
    Daemon(DaemonTarget),
    Registry(RegistryTarget),
    Archive(ArchiveTarget),
}

impl TargetImage {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetImage::Daemon(_) => TargetKind::Daemon,
            TargetImage::Registry(_) => TargetKind::Registry,
            TargetImage::Archive(_) => TargetKind::Archive,
        }
    }

    pub fn reference(&self) -> &ImageReference {
        match self {
            TargetImage::Daemon(target) => target.reference(),
            TargetImage::Registry(target) => target.reference(),
            TargetImage::Archive(target) => target.reference(),
        }
    }

    pub fn to_image_configuration(&self) -> ImageConfiguration {
        match self {
            TargetImage::Daemon(target) => target.to_image_configuration(),
            TargetImage::Registry(target) => target.to_image_configuration(),
            TargetImage::Archive(target) => target.to_image_configuration(),
        }
    }

    pub fn to_build_plan(&self, context: Arc<BuildContext>) -> BuildPlan {
        match self {
            TargetImage::Daemon(target) => target.to_build_plan(context),
            TargetImage::Registry(target) => target.to_build_plan(context),
            TargetImage::Archive(target) => target.to_build_plan(context),
        }
    }
}

impl From<DaemonTarget> for TargetImage {
    fn from(target: DaemonTarget) -> Self {
        TargetImage::Daemon(target)
    }
}

impl From<RegistryTarget> for TargetImage {
    fn from(target: RegistryTarget) -> Self {
        TargetImage::Registry(target)
    }
}

impl From<ArchiveTarget> for TargetImage {
    fn from(target: ArchiveTarget) -> Self {
        TargetImage::Archive(target)
    }
}
