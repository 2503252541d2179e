use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use super::PageHandle;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PAGE_SIZE};

/// Page store backed by a single file; page `n` lives at offset `n * PAGE_SIZE`.
pub struct FilePageHandle {
    file: Mutex<Option<File>>,
}

impl FilePageHandle {
    /// Create (or truncate) a page file.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    /// Open a page file, creating it if it does not exist yet.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 * PAGE_SIZE as u64
    }
}

impl PageHandle for FilePageHandle {
    fn read(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;

        let offset = Self::page_offset(page_id);
        let file_size = file.metadata()?.len();

        if offset + PAGE_SIZE as u64 > file_size {
            // Never written: storage past the end reads back as zeros.
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        match file.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                buf.fill(0);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::Closed)?;

        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn force(&self) -> StorageResult<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;
        file.sync_data()?;
        Ok(())
    }

    fn force_range(&self, _start: PageId, _stop: PageId) -> StorageResult<()> {
        // std has no ranged sync; syncing the whole file covers the range.
        self.force()
    }

    fn num_pages(&self) -> StorageResult<u64> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    fn close(&self) -> StorageResult<()> {
        if let Some(file) = self.file.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }
}
