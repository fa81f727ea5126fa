//! In-memory file store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::{check_bounds, FileStore, FlashFile, ERASED_BYTE};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type FileData = Arc<RwLock<Vec<u8>>>;

/// An in-memory file store.
///
/// Suitable for unit tests, integration tests and simulations that do not
/// need persistence. Cloning the store shares the same namespace, which lets
/// a test "reboot" an engine over the data a previous instance wrote.
///
/// # Example
///
/// ```rust
/// use flashlog_storage::{FileStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// store.create("a", 16).unwrap();
/// store.create("b", 32).unwrap();
/// assert_eq!(store.total_size(), 48);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    files: Arc<RwLock<BTreeMap<String, FileData>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a file's contents.
    ///
    /// Useful for tests that inspect the on-flash layout.
    #[must_use]
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.read().get(name).map(|data| data.read().clone())
    }

    /// Replaces a file's contents wholesale, creating the file if needed.
    ///
    /// Handles already open on the file see the new contents. Useful for
    /// building recovery and corruption scenarios by hand.
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        let mut files = self.files.write();
        match files.get(name) {
            Some(existing) => *existing.write() = data,
            None => {
                files.insert(name.to_string(), Arc::new(RwLock::new(data)));
            }
        }
    }

    /// Returns the sum of all file sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files
            .read()
            .values()
            .map(|data| data.read().len() as u64)
            .sum()
    }

    /// Returns the number of files in the store.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    fn lookup(&self, name: &str) -> StorageResult<FileData> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}

impl FileStore for InMemoryStore {
    fn create(&self, name: &str, size: u64) -> StorageResult<Box<dyn FlashFile>> {
        if name.is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        let data: FileData = Arc::new(RwLock::new(vec![ERASED_BYTE; size as usize]));
        self.files.write().insert(name.to_string(), Arc::clone(&data));
        Ok(Box::new(MemoryFile { data }))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn FlashFile>> {
        let data = self.lookup(name)?;
        Ok(Box::new(MemoryFile { data }))
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut files = self.files.write();
        let data = files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn file_size(&self, name: &str) -> StorageResult<u64> {
        Ok(self.lookup(name)?.read().len() as u64)
    }

    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Handle to a file held by an [`InMemoryStore`].
#[derive(Debug)]
struct MemoryFile {
    data: FileData,
}

impl FlashFile for MemoryFile {
    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let data = self.data.read();
        check_bounds(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        check_bounds(offset, bytes.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_create_is_erased() {
        let store = InMemoryStore::new();
        let file = store.create("f", 8).unwrap();
        assert_eq!(file.size(), 8);
        assert_eq!(file.read_vec(0, 8).unwrap(), vec![ERASED_BYTE; 8]);
    }

    #[test]
    fn memory_write_and_read() {
        let store = InMemoryStore::new();
        let mut file = store.create("f", 16).unwrap();
        file.write_at(4, b"data").unwrap();
        assert_eq!(file.read_vec(4, 4).unwrap(), b"data");
        assert_eq!(store.contents("f").unwrap()[3], ERASED_BYTE);
    }

    #[test]
    fn memory_write_past_end_fails() {
        let store = InMemoryStore::new();
        let mut file = store.create("f", 4).unwrap();
        let result = file.write_at(2, b"abc");
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
    }

    #[test]
    fn memory_read_past_end_fails() {
        let store = InMemoryStore::new();
        let file = store.create("f", 4).unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(
            file.read_at(10, &mut buf),
            Err(StorageError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn memory_open_missing_fails() {
        let store = InMemoryStore::new();
        let err = store.open("nope").err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn memory_reopen_sees_writes() {
        let store = InMemoryStore::new();
        {
            let mut file = store.create("f", 8).unwrap();
            file.write_at(0, &[1, 2, 3]).unwrap();
        }
        let file = store.open("f").unwrap();
        assert_eq!(file.read_vec(0, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn memory_rename_replaces_target() {
        let store = InMemoryStore::new();
        store.create("old", 4).unwrap();
        let mut tmp = store.create("tmp", 8).unwrap();
        tmp.write_at(0, b"new!").unwrap();

        store.rename("tmp", "old").unwrap();
        assert_eq!(store.file_size("old").unwrap(), 8);
        assert!(store.open("tmp").is_err());

        // The handle survives the rename
        assert_eq!(tmp.read_vec(0, 4).unwrap(), b"new!");
    }

    #[test]
    fn memory_list_by_prefix_sorted() {
        let store = InMemoryStore::new();
        store.create("flog_002", 1).unwrap();
        store.create("other", 1).unwrap();
        store.create("flog_001", 1).unwrap();
        assert_eq!(
            store.list_by_prefix("flog_").unwrap(),
            vec!["flog_001".to_string(), "flog_002".to_string()]
        );
    }

    #[test]
    fn memory_remove() {
        let store = InMemoryStore::new();
        store.create("f", 4).unwrap();
        store.remove("f").unwrap();
        assert_eq!(store.file_count(), 0);
        assert!(store.remove("f").unwrap_err().is_not_found());
    }

    #[test]
    fn memory_insert_reaches_open_handles() {
        let store = InMemoryStore::new();
        let mut file = store.create("f", 4).unwrap();
        file.write_at(0, &[1, 2, 3, 4]).unwrap();

        store.insert("f", vec![9, 9]);
        assert_eq!(file.size(), 2);
        assert_eq!(file.read_vec(0, 2).unwrap(), vec![9, 9]);

        store.insert("g", vec![5]);
        assert_eq!(store.open("g").unwrap().read_vec(0, 1).unwrap(), vec![5]);
    }

    #[test]
    fn memory_clones_share_namespace() {
        let store = InMemoryStore::new();
        let other = store.clone();
        store.create("f", 10).unwrap();
        assert_eq!(other.total_size(), 10);
    }
}
