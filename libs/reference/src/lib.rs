//! # stevedore-reference
//!
//! Parsing and validation of container image references.
//!
//! ## Reference Format
//!
//! ```text
//! [registry/]repository[:tag|@digest]
//! ```
//!
//! Examples:
//! - `alpine` -> `registry-1.docker.io`, `library/alpine`, default tag `latest`
//! - `ghcr.io/org/app:v1` -> `ghcr.io`, `org/app`, tag `v1`
//! - `localhost:5000/app@sha256:...` -> `localhost:5000`, `app`, digest
//!
//! ## Design Principles
//!
//! - References are validated when parsed, never later
//! - A parsed reference is immutable
//! - At most one of tag or digest is set; neither means `latest`
//! - Parsing the canonical string form yields the same reference again

mod error;
mod grammar;
mod reference;

pub use error::ReferenceError;
pub use grammar::{is_valid_digest, is_valid_registry, is_valid_repository, is_valid_tag};
pub use reference::ImageReference;
