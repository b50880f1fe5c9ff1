//! Object storage for downloaded media bytes.
//!
//! Keys are deterministic (`{resourceType}/{parentKey}/{mediaKey}.{ext}`)
//! so re-uploads overwrite rather than accumulate. The public URL is formed
//! from the configured CDN domain, never from the store endpoint.

mod s3;

pub use s3::S3ObjectStore;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

/// Minimal S3-compatible surface the worker needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload one object, overwriting any existing content.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Delete one object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete a batch of keys (up to 1000 per call).
    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    /// List keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Public URL for a stored object: `https://{public_domain}/{key}`.
pub fn public_url(public_domain: &str, key: &str) -> String {
    format!("https://{}/{}", public_domain.trim_end_matches('/'), key)
}

/// In-memory object store used by tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(b, _)| b.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
