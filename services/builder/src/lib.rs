//! stevedore builder library
//!
//! Builds container images from a [`BuildContext`] and delivers them to one
//! of three targets: the local daemon (`docker load`), a remote registry, or
//! a `docker save` tarball on disk.
//!
//! ## Pipeline
//!
//! ```text
//! TargetImage ──► ImageConfiguration
//!      │
//!      └──► BuildPlan
//!             ├── resolve-base-image   (registry pull or scratch)
//!             ├── build-layers         (parallel, content-keyed cache)
//!             ├── assemble-manifest    (config + Docker/OCI manifest)
//!             └── deliver              (DaemonClient | RegistryClient | ArchiveWriter)
//! ```
//!
//! Only the deliver stage depends on the target, so the same context yields
//! the same digests whichever target is chosen.
//!
//! ## Modules
//!
//! - `target`: daemon, registry and archive targets
//! - `plan`: stage execution and cancellation
//! - `layer`: reproducible layer tarballs and the layer cache
//! - `manifest`: image config and manifest assembly
//! - `daemon`: `docker` subprocess client
//! - `registry`: distribution API client
//! - `archive`: `docker save` archive writer
//! - `config`: layered builder configuration

pub mod archive;
pub mod base;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod plan;
pub mod registry;
pub mod target;

// Re-export commonly used types
pub use config::{BuilderConfig, ConfigError};
pub use context::{
    BaseImage, BuildContext, BuildSettings, ContainerConfig, ImageFormat, LayerEntry, LayerSource,
};
pub use daemon::{DaemonClient, DaemonError, DaemonOutput, DaemonSettings};
pub use error::{BuildError, PlanError, Stage};
pub use image::{Credential, ImageConfiguration};
pub use layer::LayerCache;
pub use manifest::AssembledImage;
pub use plan::{BuildPlan, BuildResult, Delivery};
pub use registry::{RegistryClient, RegistryConfig, RegistryError};
pub use stevedore_reference::{ImageReference, ReferenceError};
pub use target::{ArchiveTarget, DaemonTarget, RegistryTarget, TargetImage, TargetKind};
