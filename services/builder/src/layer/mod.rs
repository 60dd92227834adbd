//! Layer construction and caching.
//!
//! This module handles:
//! - Writing reproducible gzip'd tar layers from [`LayerSource`]s
//! - Content keys so identical sources map to the same cached layer
//! - A digest-addressed blob store shared with base-image pulls
//! - At-most-one in-flight build per content key
//!
//! [`LayerSource`]: crate::context::LayerSource

mod builder;
mod cache;

pub use builder::{build_layer, content_key, write_layer_tar, REPRODUCIBLE_MTIME};
pub use cache::{BlobStore, CacheStats, CachedLayer, LayerCache};

use sha2::{Digest, Sha256};

/// `sha256:<hex>` digest of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
