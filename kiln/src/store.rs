// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Artifact store adapter
//!
//! The build pipeline sees the object store as a slash-keyed blob store.
//! [`DiskStore`] is the production implementation, rooted at the build
//! bucket's mount point; writes go through a `.part` file and a rename so a
//! reader never observes a half-written object.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use fs_err::tokio as fs;
use path_clean::PathClean;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// A readable blob handed out by a [`Store`]
pub type Blob = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Write `source` at `key`, replacing any existing object
    async fn upload(&self, source: Blob, key: &str) -> Result<(), Error>;

    /// Open the object at `key` for streaming reads
    async fn open(&self, key: &str) -> Result<Blob, Error>;

    /// Copy the object at `key` to a local path
    async fn download(&self, key: &str, dest: &Path) -> Result<(), Error>;

    /// Remove the object (or everything under the prefix) at `key`
    async fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Store over a locally mounted bucket
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a slash-delimited key beneath the root, refusing keys that
    /// escape it after normalization
    fn resolve(&self, key: &str) -> Result<PathBuf, Error> {
        let path = self.root.join(key.trim_start_matches('/')).clean();

        if !path.starts_with(&self.root) {
            return Err(Error::KeyEscapesRoot(key.to_owned()));
        }

        Ok(path)
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn upload(&self, mut source: Blob, key: &str) -> Result<(), Error> {
        let path = self.resolve(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = PathBuf::from(format!("{}.part", path.display()));
        let mut out = fs::File::create(&partial).await?;
        tokio::io::copy(&mut source, &mut out).await?;
        out.flush().await?;
        fs::rename(partial, path).await?;

        Ok(())
    }

    async fn open(&self, key: &str) -> Result<Blob, Error> {
        let path = self.resolve(key)?;

        let file = fs::File::open(path).await.map_err(|error| missing(key, error))?;

        Ok(Box::new(file))
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<(), Error> {
        let path = self.resolve(key)?;

        fs::copy(&path, dest).await.map_err(|error| missing(key, error))?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        let path = self.resolve(key)?;

        let meta = fs::metadata(&path).await.map_err(|error| missing(key, error))?;
        if meta.is_dir() {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }

        Ok(())
    }
}

fn missing(key: &str, error: io::Error) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        Error::NotFound(key.to_owned())
    } else {
        Error::Io(error)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no object at key {0:?}")]
    NotFound(String),
    #[error("key {0:?} escapes the store root")]
    KeyEscapesRoot(String),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store used by coordinator tests

    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    pub struct MemoryStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        pub uploads: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        pub fn seed(&self, key: &str, bytes: impl Into<Vec<u8>>) {
            self.blobs.lock().unwrap().insert(key.to_owned(), bytes.into());
        }

        pub fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.blobs.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn upload(&self, mut source: Blob, key: &str) -> Result<(), Error> {
            let mut bytes = Vec::new();
            source.read_to_end(&mut bytes).await?;
            self.blobs.lock().unwrap().insert(key.to_owned(), bytes);
            self.uploads.lock().unwrap().push(key.to_owned());
            Ok(())
        }

        async fn open(&self, key: &str) -> Result<Blob, Error> {
            let bytes = self.get(key).ok_or_else(|| Error::NotFound(key.to_owned()))?;
            Ok(Box::new(std::io::Cursor::new(bytes)))
        }

        async fn download(&self, key: &str, dest: &Path) -> Result<(), Error> {
            let bytes = self.get(key).ok_or_else(|| Error::NotFound(key.to_owned()))?;
            fs::write(dest, bytes).await?;
            Ok(())
        }

        async fn remove(&self, key: &str) -> Result<(), Error> {
            let mut blobs = self.blobs.lock().unwrap();
            let prefix = format!("{key}/");
            let before = blobs.len();
            blobs.retain(|stored, _| stored != key && !stored.starts_with(&prefix));
            if blobs.len() == before {
                return Err(Error::NotFound(key.to_owned()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn fixture() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        (dir, store)
    }

    fn blob(bytes: &[u8]) -> Blob {
        Box::new(std::io::Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn upload_then_open() {
        let (_dir, store) = fixture();

        store
            .upload(blob(b"recipe text"), "groups/hgi/xxhash/0.8.1/singularity.def")
            .await
            .unwrap();

        let mut contents = String::new();
        store
            .open("groups/hgi/xxhash/0.8.1/singularity.def")
            .await
            .unwrap()
            .read_to_string(&mut contents)
            .await
            .unwrap();

        assert_eq!(contents, "recipe text");
    }

    #[tokio::test]
    async fn download_copies_to_local_path() {
        let (dir, store) = fixture();
        store.upload(blob(b"image bytes"), "k/image").await.unwrap();

        let dest = dir.path().join("local.sif");
        store.download("k/image", &dest).await.unwrap();

        assert_eq!(std::fs::read(dest).unwrap(), b"image bytes");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let (_dir, store) = fixture();

        assert!(matches!(store.open("absent").await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.download("absent", Path::new("/tmp/ignored")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(store.remove("absent").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_prefix_removes_tree() {
        let (dir, store) = fixture();
        store.upload(blob(b"a"), "groups/hgi/xxhash/0.8.1/a").await.unwrap();
        store.upload(blob(b"b"), "groups/hgi/xxhash/0.8.1/b").await.unwrap();

        store.remove("groups/hgi/xxhash/0.8.1").await.unwrap();

        assert!(!dir.path().join("groups/hgi/xxhash/0.8.1").exists());
    }

    #[tokio::test]
    async fn traversal_keys_are_refused() {
        let (_dir, store) = fixture();

        assert!(matches!(
            store.open("../../etc/passwd").await,
            Err(Error::KeyEscapesRoot(_))
        ));
        assert!(matches!(
            store.upload(blob(b"x"), "a/../../outside").await,
            Err(Error::KeyEscapesRoot(_))
        ));
    }
}
