//! File store trait definitions.

use crate::error::StorageResult;

/// Value of an erased (never written) flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// A flat namespace of fixed-size flash files.
///
/// # Invariants
///
/// - `create` returns a file of exactly `size` bytes, all [`ERASED_BYTE`]
/// - `create` over an existing name replaces that file
/// - `list_by_prefix` returns names in ascending order
/// - Removing or renaming a file does not invalidate open handles
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::DirectoryStore`] - For persistent storage
pub trait FileStore: Send + Sync {
    /// Creates (or replaces) a pre-sized, erased file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be allocated.
    fn create(&self, name: &str, size: u64) -> StorageResult<Box<dyn FlashFile>>;

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::NotFound`] if no such file exists.
    fn open(&self, name: &str) -> StorageResult<Box<dyn FlashFile>>;

    /// Removes a file.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::NotFound`] if no such file exists.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Atomically renames `from` to `to`, replacing `to` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::NotFound`] if `from` does not exist.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Returns the allocated size of a file.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::NotFound`] if no such file exists.
    fn file_size(&self, name: &str) -> StorageResult<u64>;

    /// Lists the names of all files starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be enumerated.
    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// An open handle to one flash file.
pub trait FlashFile: Send {
    /// Returns the allocated size of the file.
    fn size(&self) -> u64;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::OutOfBounds`] if the range extends past
    /// the end of the file, or an I/O error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes `data` at `offset`. Files never grow.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::OutOfBounds`] if the range extends past
    /// the end of the file, or an I/O error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Makes all previous writes durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Reads `len` bytes at `offset` into a new vector.
    ///
    /// # Errors
    ///
    /// Same as [`FlashFile::read_at`].
    fn read_vec(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Checks that `offset..offset + len` lies inside a file of `size` bytes.
pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> StorageResult<()> {
    let end = offset.saturating_add(len as u64);
    if offset > size || end > size {
        return Err(crate::StorageError::OutOfBounds { offset, len, size });
    }
    Ok(())
}
