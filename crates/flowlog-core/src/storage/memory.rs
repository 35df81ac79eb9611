//! RAM-backed storage for tests and the desktop simulator

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::{Storage, StorageError};

#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: BTreeMap<String, Vec<u8>>,
    fail_appends: bool,
    read_only: BTreeSet<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail, as a worn or removed card would.
    pub fn set_fail_appends(&mut self, fail: bool) {
        self.fail_appends = fail;
    }

    /// Make appends to `name` fail while other files stay writable.
    pub fn set_read_only(&mut self, name: &str, read_only: bool) {
        if read_only {
            self.read_only.insert(name.to_string());
        } else {
            self.read_only.remove(name);
        }
    }

    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

impl Storage for MemoryStorage {
    fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail_appends || self.read_only.contains(name) {
            return Err(StorageError::Device);
        }
        if name.is_empty() {
            return Err(StorageError::InvalidName);
        }
        self.files
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn exists(&mut self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn len(&mut self, name: &str) -> Result<u32, StorageError> {
        self.files
            .get(name)
            .map(|data| data.len() as u32)
            .ok_or(StorageError::NotFound)
    }

    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        let data = self.files.get(name).ok_or(StorageError::NotFound)?;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        self.files
            .remove(name)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }
}
