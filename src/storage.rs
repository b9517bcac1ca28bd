//! Durable blob storage.
//!
//! Everything the service persists (the catalog, the vector index, the
//! config file, uploaded images) goes through a [`BlobStore`]: a flat
//! key -> bytes surface with atomic replace on write.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use rusty_ulid::Ulid;

pub trait BlobStore: Send + Sync {
    /// Read a blob. `Ok(None)` when the key does not exist.
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    /// Replace a blob. Readers observe either the old or the new bytes.
    fn write(&self, key: &str, data: &[u8]) -> io::Result<()>;
    fn exists(&self, key: &str) -> bool;
    fn delete(&self, key: &str) -> io::Result<()>;
}

/// Keys are relative paths made only of plain components: no root, no
/// `..`, no `.`, no drive prefix.
pub fn validate_key(key: &str) -> io::Result<()> {
    let path = Path::new(key);
    let plain = !key.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

    if !plain {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid blob key: {key}"),
        ));
    }
    Ok(())
}

/// Blob store backed by a directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(LocalBlobStore { base_dir })
    }

    /// Filesystem path of `key`, always inside the base directory.
    pub fn path_of(&self, key: &str) -> io::Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(key))
    }

    /// Delete every file under the base directory last modified more than
    /// `max_age` ago. Returns how many files were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> io::Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        prune_dir(&self.base_dir, cutoff)
    }
}

fn prune_dir(dir: &Path, cutoff: SystemTime) -> io::Result<usize> {
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            removed += prune_dir(&path, cutoff)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let modified = match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                log::warn!("Could not read age of {}: {}", path.display(), e);
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}

impl BlobStore for LocalBlobStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_of(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // temp file lives next to the target so the rename stays on one filesystem
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("blob");
        let temp_path = path.with_file_name(format!(".{}-{file_name}.tmp", Ulid::generate()));

        if let Err(e) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.path_of(key)
            .is_ok_and(|path| std::fs::metadata(path).is_ok())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match std::fs::remove_file(self.path_of(key)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// In-memory blob store with write-failure injection.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    failing_writes: std::sync::atomic::AtomicUsize,
    write_attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with an I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn corrupt(&self, key: &str, offset: usize) {
        let mut blobs = self.blobs.lock().unwrap();
        if let Some(data) = blobs.get_mut(key) {
            data[offset] ^= 0xFF;
        }
    }
}

#[cfg(test)]
impl BlobStore for MemoryBlobStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, data: &[u8]) -> io::Result<()> {
        use std::sync::atomic::Ordering;

        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }

        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(key)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}
