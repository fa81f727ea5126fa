//! Directory-backed file store for persistent storage.

use crate::error::{StorageError, StorageResult};
use crate::store::{check_bounds, FileStore, FlashFile, ERASED_BYTE};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Advisory lock file held for the lifetime of the store.
const LOCK_FILE: &str = "LOCK";

/// A file store backed by a directory of OS files.
///
/// Each flash file is one OS file of the same name. Files are pre-sized and
/// filled with [`ERASED_BYTE`] on creation so the on-disk image matches what
/// flash would hold.
///
/// # Locking
///
/// The store holds an exclusive advisory lock on `<dir>/LOCK`. A second
/// `DirectoryStore` over the same directory fails with
/// [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use flashlog_storage::{DirectoryStore, FileStore};
/// use std::path::Path;
///
/// let store = DirectoryStore::open(Path::new("flash"), true).unwrap();
/// let mut file = store.create("flog_001", 4096).unwrap();
/// file.write_at(0, b"persistent").unwrap();
/// file.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    _lock_file: File,
}

impl DirectoryStore {
    /// Opens (and optionally creates) a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::NotFound(path.display().to_string()));
            }
        }

        if !path.is_dir() {
            return Err(StorageError::InvalidName(path.display().to_string()));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        Ok(Self {
            root: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, name: &str) -> StorageResult<PathBuf> {
        let has_separator = name.contains(|c: char| c == '/' || c == '\\');
        if name.is_empty() || name == LOCK_FILE || name == ".." || has_separator {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    fn not_found(name: &str, err: io::Error) -> StorageError {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(name.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

impl FileStore for DirectoryStore {
    fn create(&self, name: &str, size: u64) -> StorageResult<Box<dyn FlashFile>> {
        let path = self.file_path(name)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        // Erase in blocks rather than one allocation of the whole file
        let block = [ERASED_BYTE; 512];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(block.len() as u64) as usize;
            file.write_all(&block[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;

        Ok(Box::new(DirectoryFile {
            file: Mutex::new(file),
            size,
        }))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn FlashFile>> {
        let path = self.file_path(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Self::not_found(name, e))?;
        let size = file.metadata()?.len();

        Ok(Box::new(DirectoryFile {
            file: Mutex::new(file),
            size,
        }))
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.file_path(name)?;
        fs::remove_file(path).map_err(|e| Self::not_found(name, e))
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.file_path(from)?;
        let to_path = self.file_path(to)?;
        fs::rename(from_path, to_path).map_err(|e| Self::not_found(from, e))
    }

    fn file_size(&self, name: &str) -> StorageResult<u64> {
        let path = self.file_path(name)?;
        let metadata = fs::metadata(path).map_err(|e| Self::not_found(name, e))?;
        Ok(metadata.len())
    }

    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name != LOCK_FILE && name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Handle to one OS file of a [`DirectoryStore`].
#[derive(Debug)]
struct DirectoryFile {
    file: Mutex<File>,
    size: u64,
}

impl FlashFile for DirectoryFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        check_bounds(offset, buf.len(), self.size)?;
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        check_bounds(offset, data.len(), self.size)?;
        if data.is_empty() {
            return Ok(());
        }
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}
