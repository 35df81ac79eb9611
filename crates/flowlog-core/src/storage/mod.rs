//! Local persistent storage
//!
//! The core only needs byte-level file access: appending readings and log
//! lines, reading sealed files back for upload, and maintaining the state
//! journal. [`Storage`] is that boundary; [`memory::MemoryStorage`] backs
//! tests and the simulator, [`sd_card::SdCardStorage`] backs FAT media.

pub mod debug_log;
pub mod memory;
pub mod sd_card;
pub mod state;

use thiserror_no_std::Error;

pub use debug_log::{DebugLine, DebugLog};
pub use memory::MemoryStorage;
pub use state::{Checkpoint, PersistedJob, PersistedState, StateJournal};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("file not found")]
    NotFound,
    #[error("file name not valid on this medium")]
    InvalidName,
    #[error("storage medium is full")]
    Full,
    #[error("storage device error")]
    Device,
}

pub trait Storage {
    /// Append `bytes` to `name`, creating it if needed.
    ///
    /// Success means the bytes are durable.
    fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn exists(&mut self, name: &str) -> bool;

    fn len(&mut self, name: &str) -> Result<u32, StorageError>;

    /// Read up to `buf.len()` bytes starting at `offset`; 0 means end of file.
    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError>;

    fn remove(&mut self, name: &str) -> Result<(), StorageError>;

    /// Open `name` for sequential or offset reads.
    fn open_for_read<'s>(&'s mut self, name: &'s str) -> Result<FileReader<'s, Self>, StorageError>
    where
        Self: Sized,
    {
        if !self.exists(name) {
            return Err(StorageError::NotFound);
        }
        Ok(FileReader {
            storage: self,
            name,
            position: 0,
        })
    }
}

/// Random-access byte source for uploads.
pub trait ChunkSource {
    fn total_len(&mut self) -> Result<u32, StorageError>;

    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError>;
}

/// Reader over one stored file.
pub struct FileReader<'s, S: Storage> {
    storage: &'s mut S,
    name: &'s str,
    position: u32,
}

impl<S: Storage> FileReader<'_, S> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn seek(&mut self, offset: u32) {
        self.position = offset;
    }

    /// Read from the current position and advance past what was read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let n = self.storage.read_at(self.name, self.position, buf)?;
        self.position += n as u32;
        Ok(n)
    }
}

impl<S: Storage> ChunkSource for FileReader<'_, S> {
    fn total_len(&mut self) -> Result<u32, StorageError> {
        self.storage.len(self.name)
    }

    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.seek(offset);
        self.read(buf)
    }
}

/// In-memory payload, used for status lines that never touch storage.
pub struct BytesSource<'b>(pub &'b [u8]);

impl ChunkSource for BytesSource<'_> {
    fn total_len(&mut self) -> Result<u32, StorageError> {
        Ok(self.0.len() as u32)
    }

    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        let start = (offset as usize).min(self.0.len());
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }
}
