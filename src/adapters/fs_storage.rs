//! File-system storage adapter.
//!
//! Implements [`StoragePort`] over `std::fs`. Device paths such as
//! `/ota/download.zip` are resolved under a root directory, so a host
//! simulation can keep the whole device tree in a scratch directory while
//! a real terminal uses `/`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::app::ports::{StorageError, StoragePort};

const DIGEST_BUF: usize = 4096;

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a device path onto the root. `..` components are dropped so a
    /// host-supplied name cannot leave the tree.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in Path::new(path).components() {
            if let std::path::Component::Normal(p) = part {
                out.push(p);
            }
        }
        out
    }

    fn io_error(path: &Path, e: &std::io::Error) -> StorageError {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound
        } else {
            warn!("STORAGE: {}: {}", path.display(), e);
            StorageError::IoError
        }
    }

    fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        match path.parent() {
            Some(dir) => fs::create_dir_all(dir).map_err(|e| Self::io_error(dir, &e)),
            None => Ok(()),
        }
    }
}

impl StoragePort for FsStorage {
    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let p = self.resolve(path);
        Self::ensure_parent(&p)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&p)
            .map_err(|e| Self::io_error(&p, &e))?;
        file.write_all(data).map_err(|e| Self::io_error(&p, &e))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let p = self.resolve(path);
        Self::ensure_parent(&p)?;
        fs::write(&p, data).map_err(|e| Self::io_error(&p, &e))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let p = self.resolve(path);
        fs::read(&p).map_err(|e| Self::io_error(&p, &e))
    }

    fn digest(&self, path: &str) -> Result<[u8; 16], StorageError> {
        let p = self.resolve(path);
        let mut file = fs::File::open(&p).map_err(|e| Self::io_error(&p, &e))?;
        let mut hasher = md5::Context::new();
        let mut buf = [0u8; DIGEST_BUF];
        loop {
            let n = file.read(&mut buf).map_err(|e| Self::io_error(&p, &e))?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
        }
        Ok(hasher.compute().0)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        let p = self.resolve(path);
        fs::metadata(&p)
            .map(|m| m.len())
            .map_err(|e| Self::io_error(&p, &e))
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        let p = self.resolve(path);
        let outcome = if p.is_dir() {
            fs::remove_dir_all(&p)
        } else {
            fs::remove_file(&p)
        };
        match outcome {
            Ok(()) => {
                debug!("STORAGE: removed {}", p.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&p, &e)),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}
