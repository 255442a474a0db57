//! [`FileStore`] implementations.
//!
//! - [`LocalFileStore`] – the local file system.
//! - [`MemoryFileStore`] – an in-memory map of path to bytes that also counts
//!   reads and appends, so tests can check how many chunks a transfer took.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::application::transfer::FileStore;

/// Reads and writes real files.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    fn length(&self, path: &Path) -> std::io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn read(&self, path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut chunk)?;
        Ok(chunk)
    }

    fn create(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        File::create(path).map(|_| ())
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        OpenOptions::new().append(true).open(path)?.write_all(bytes)
    }
}

/// Keeps files in memory.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    reads: AtomicUsize,
    appends: AtomicUsize,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` under `path`, replacing any previous content.
    pub fn insert(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.lock().insert(path.into(), bytes.into());
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.lock().get(path.as_ref()).cloned()
    }

    /// Number of successful `read` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful `append` calls so far.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Vec<u8>>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(path: &Path) -> std::io::Error {
    std::io::Error::new(ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl FileStore for MemoryFileStore {
    fn length(&self, path: &Path) -> std::io::Result<u64> {
        self.lock()
            .get(path)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| not_found(path))
    }

    fn read(&self, path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let files = self.lock();
        let bytes = files.get(path).ok_or_else(|| not_found(path))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(bytes[start..end].to_vec())
    }

    fn create(&self, path: &Path) -> std::io::Result<()> {
        self.lock().insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut files = self.lock();
        let file = files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.extend_from_slice(bytes);
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("relay_client_test_{}", Uuid::new_v4()))
    }

    #[test]
    fn test_memory_read_is_clamped_at_end_of_file() {
        let store = MemoryFileStore::new();
        store.insert("/a", vec![1, 2, 3, 4, 5]);
        assert_eq!(store.read(Path::new("/a"), 3, 10).expect("read"), vec![4, 5]);
        assert_eq!(store.read(Path::new("/a"), 10, 10).expect("read"), Vec::<u8>::new());
        assert_eq!(store.read_count(), 2);
    }

    #[test]
    fn test_memory_append_requires_create() {
        let store = MemoryFileStore::new();
        assert!(store.append(Path::new("/b"), b"x").is_err());
        store.create(Path::new("/b")).expect("create");
        store.append(Path::new("/b"), b"xy").expect("append");
        store.append(Path::new("/b"), b"z").expect("append");
        assert_eq!(store.contents("/b"), Some(b"xyz".to_vec()));
        assert_eq!(store.append_count(), 2);
    }

    #[test]
    fn test_memory_length_of_missing_file_is_not_found() {
        let store = MemoryFileStore::new();
        let err = store.length(Path::new("/missing")).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_local_store_round_trip() {
        let dir = temp_dir();
        let source = dir.join("source.bin");
        let destination = dir.join("nested").join("copy.bin");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(&source, (0u8..=255).collect::<Vec<_>>()).expect("write");

        let store = LocalFileStore;
        assert_eq!(store.length(&source).expect("length"), 256);
        store.create(&destination).expect("create");
        let mut offset = 0;
        while offset < 256 {
            let chunk = store.read(&source, offset, 100).expect("read");
            store.append(&destination, &chunk).expect("append");
            offset += 100;
        }
        assert_eq!(
            std::fs::read(&destination).expect("read back"),
            std::fs::read(&source).expect("read source")
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_local_create_truncates() {
        let dir = temp_dir();
        let path = dir.join("f.txt");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(&path, b"old content").expect("write");

        LocalFileStore.create(&path).expect("create");
        assert_eq!(LocalFileStore.length(&path).expect("length"), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
