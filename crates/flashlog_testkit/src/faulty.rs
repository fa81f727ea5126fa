//! Fault injection for file stores.
//!
//! `FaultyStore` wraps any [`FileStore`] and fails chosen operations with an
//! I/O error. Faults are armed as countdowns so a test can let a number of
//! operations through before the failure hits.

use flashlog_storage::{FileStore, FlashFile, StorageError, StorageResult};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Operations a fault can be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `FileStore::create`.
    Create,
    /// `FileStore::rename`.
    Rename,
    /// `FlashFile::read_at`.
    Read,
    /// `FlashFile::write_at`.
    Write,
}

#[derive(Debug, Default)]
struct Faults {
    armed: Vec<(FaultPoint, u64)>,
    injected: u64,
}

impl Faults {
    /// Counts one `point` operation; returns an error if a fault fires.
    fn check(&mut self, point: FaultPoint) -> StorageResult<()> {
        let mut fire = false;
        self.armed.retain_mut(|(armed, countdown)| {
            if *armed != point || fire {
                return true;
            }
            if *countdown == 0 {
                fire = true;
                return false;
            }
            *countdown -= 1;
            true
        });
        if fire {
            self.injected += 1;
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {point:?} fault"),
            )));
        }
        Ok(())
    }
}

/// A file store that fails on command.
#[derive(Debug, Clone)]
pub struct FaultyStore<S> {
    inner: S,
    faults: Arc<Mutex<Faults>>,
}

impl<S: FileStore> FaultyStore<S> {
    /// Wraps `inner` with no faults armed.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fails the `(skip + 1)`-th `point` operation from now.
    pub fn fail_after(&self, point: FaultPoint, skip: u64) {
        self.faults.lock().armed.push((point, skip));
    }

    /// Fails the next `point` operation.
    pub fn fail_next(&self, point: FaultPoint) {
        self.fail_after(point, 0);
    }

    /// Disarms every pending fault.
    pub fn clear(&self) {
        self.faults.lock().armed.clear();
    }

    /// Returns how many faults have fired.
    pub fn injected(&self) -> u64 {
        self.faults.lock().injected
    }

    fn wrap(&self, file: Box<dyn FlashFile>) -> Box<dyn FlashFile> {
        Box::new(FaultyFile {
            inner: file,
            faults: Arc::clone(&self.faults),
        })
    }
}

impl<S: FileStore> FileStore for FaultyStore<S> {
    fn create(&self, name: &str, size: u64) -> StorageResult<Box<dyn FlashFile>> {
        self.faults.lock().check(FaultPoint::Create)?;
        Ok(self.wrap(self.inner.create(name, size)?))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn FlashFile>> {
        Ok(self.wrap(self.inner.open(name)?))
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.inner.remove(name)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.faults.lock().check(FaultPoint::Rename)?;
        self.inner.rename(from, to)
    }

    fn file_size(&self, name: &str) -> StorageResult<u64> {
        self.inner.file_size(name)
    }

    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list_by_prefix(prefix)
    }
}

struct FaultyFile {
    inner: Box<dyn FlashFile>,
    faults: Arc<Mutex<Faults>>,
}

impl FlashFile for FaultyFile {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.faults.lock().check(FaultPoint::Read)?;
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.faults.lock().check(FaultPoint::Write)?;
        self.inner.write_at(offset, data)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashlog_storage::InMemoryStore;

    #[test]
    fn countdown_lets_operations_through() {
        let store = FaultyStore::new(InMemoryStore::new());
        let mut file = store.create("a", 8).unwrap();
        store.fail_after(FaultPoint::Write, 1);

        assert!(file.write_at(0, &[1]).is_ok());
        assert!(file.write_at(1, &[2]).is_err());
        assert!(file.write_at(1, &[2]).is_ok());
        assert_eq!(store.injected(), 1);
    }

    #[test]
    fn faults_are_per_operation() {
        let store = FaultyStore::new(InMemoryStore::new());
        store.fail_next(FaultPoint::Rename);
        let file = store.create("a", 8).unwrap();
        let mut buf = [0u8; 1];
        assert!(file.read_at(0, &mut buf).is_ok());
        assert!(store.rename("a", "b").is_err());
        assert!(store.rename("a", "b").is_ok());
        assert_eq!(store.inner().contents("b").map(|c| c.len()), Some(8));
    }

    #[test]
    fn clear_disarms() {
        let store = FaultyStore::new(InMemoryStore::new());
        store.fail_next(FaultPoint::Create);
        store.clear();
        assert!(store.create("a", 8).is_ok());
        assert_eq!(store.injected(), 0);
    }
}
