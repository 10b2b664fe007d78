//! Blob storage boundary.
//!
//! The pipeline only ever talks to storage through [`BlobStore`]; it never
//! inspects how or where the bytes live. The filesystem implementation shards
//! objects by key path, the same layout an object store would use.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed blob store rooted at a single directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create blob root {:?}", root))?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are relative paths like "images/ab/<hash>.jpg"; reject anything
        // that could escape the root.
        let rel = Path::new(key);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("Invalid blob key: {}", key);
        }
        Ok(self.root.join(rel))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("Failed to write blob {}", key))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        std::fs::read(&path).with_context(|| format!("Failed to read blob {}", key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            // Deleting an already-gone blob is not an error
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        store.put("images/ab/abcd.jpg", b"hello").unwrap();
        assert_eq!(store.get("images/ab/abcd.jpg").unwrap(), b"hello");

        store.delete("images/ab/abcd.jpg").unwrap();
        assert!(store.get("images/ab/abcd.jpg").is_err());

        // Idempotent delete
        store.delete("images/ab/abcd.jpg").unwrap();
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.get("/etc/passwd").is_err());
    }
}
