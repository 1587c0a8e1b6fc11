//! # Content-Addressed Pipeline Store
//!
//! Compiled images are keyed by their structural hash; an alias table
//! maps human names onto hashes, and a syntactic index keyed by
//! `(syntactic hash, registry hash)` lets the caching compiler skip
//! parsing, checking, and compilation entirely when it has seen the
//! same source under the same module registry.
//!
//! The in-memory store is the default; persistent backends implement
//! [`StoreBackend`] and are out of scope here beyond the contract.

use crate::dag::{structural_hash, PipelineImage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Store-level failures (only persistent backends produce these).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("corrupt image for hash {hash}: {reason}")]
    CorruptImage { hash: String, reason: String },
}

/// Contract for persistent image storage. The in-memory store works
/// without one; file- or Redis-backed stores implement this.
pub trait StoreBackend: Send + Sync {
    fn persist(&self, hash: &str, image: &PipelineImage) -> Result<(), StoreError>;
    fn load(&self, hash: &str) -> Result<Option<PipelineImage>, StoreError>;
}

#[derive(Default)]
struct StoreInner {
    images: HashMap<String, Arc<PipelineImage>>,
    aliases: HashMap<String, String>,
    /// (syntactic hash, registry hash) -> structural hash
    syntactic: HashMap<(String, String), String>,
}

/// In-memory content-addressed store. Cheap to clone a handle; all
/// clones share state.
#[derive(Default)]
pub struct PipelineStore {
    inner: RwLock<StoreInner>,
}

impl PipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an image under its structural hash. Idempotent: storing an
    /// already-present image returns the same hash and keeps the first
    /// copy (content-addressed, so the copies are equal).
    pub fn store(&self, image: PipelineImage) -> String {
        let hash = structural_hash(&image.spec);
        let mut inner = self.inner.write();
        if !inner.images.contains_key(&hash) {
            tracing::debug!(hash = %hash, "pipeline_image_stored");
            inner.images.insert(hash.clone(), Arc::new(image));
        }
        hash
    }

    pub fn get(&self, hash: &str) -> Option<Arc<PipelineImage>> {
        self.inner.read().images.get(hash).cloned()
    }

    /// Bind a human name to a structural hash. Re-aliasing moves the
    /// name.
    pub fn alias(&self, name: impl Into<String>, hash: impl Into<String>) {
        self.inner.write().aliases.insert(name.into(), hash.into());
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.inner.read().aliases.get(name).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<PipelineImage>> {
        let inner = self.inner.read();
        let hash = inner.aliases.get(name)?;
        inner.images.get(hash).cloned()
    }

    pub fn lookup_syntactic(
        &self,
        syntactic_hash: &str,
        registry_hash: &str,
    ) -> Option<String> {
        self.inner
            .read()
            .syntactic
            .get(&(syntactic_hash.to_string(), registry_hash.to_string()))
            .cloned()
    }

    pub fn put_syntactic_index(
        &self,
        syntactic_hash: impl Into<String>,
        registry_hash: impl Into<String>,
        structural: impl Into<String>,
    ) {
        self.inner
            .write()
            .syntactic
            .insert((syntactic_hash.into(), registry_hash.into()), structural.into());
    }

    pub fn len(&self) -> usize {
        self.inner.read().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().images.is_empty()
    }
}
