//! File-backed, fsync'd log.
//!
//! Layout:
//!
//! ```text
//! header: magic "ARIESLOG" | version: u32 LE | base LSN: u64 LE
//! frame:  payload len: u32 LE | crc32(payload): u32 LE | payload (bincode LogEntry)
//! ```
//!
//! An entry's LSN is its logical byte offset: the base LSN stored in the
//! header names the first byte after the header, so the header doubles as
//! the truncation boundary marker. Truncation copies the live suffix into a
//! new file and renames it over the old one.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::backend::{ForceMode, LogBackend};
use super::record::{LogEntry, LSN};
use crate::storage::error::{StorageError, StorageResult};

const LOG_MAGIC: &[u8; 8] = b"ARIESLOG";
const LOG_VERSION: u32 = 1;

/// Size of the file header in bytes.
pub const LOG_HEADER_SIZE: u64 = 20;

/// Size of a frame's length + checksum prefix.
pub const FRAME_HEADER_SIZE: u64 = 8;

/// Appends are buffered until a force or until the buffer grows past this (1MB).
const LOG_BUFFER_SIZE: usize = 1024 * 1024;

struct FileLogInner {
    file: File,
    /// LSN of the first byte after the header.
    base: LSN,
    next: LSN,
    /// Everything before `flushed` has been handed to the OS.
    flushed: LSN,
    /// Frames for `[flushed, next)`.
    buffer: BytesMut,
    closed: bool,
}

impl FileLogInner {
    fn file_offset(&self, lsn: LSN) -> u64 {
        LOG_HEADER_SIZE + (lsn.0 - self.base.0)
    }

    fn flush_buffer(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let offset = self.file_offset(self.flushed);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&self.buffer)?;
        self.flushed = self.next;
        self.buffer.clear();
        Ok(())
    }
}

pub struct FileLog {
    path: PathBuf,
    inner: Mutex<FileLogInner>,
    /// Handle used for fsync. Holding this lock serializes forces and truncation.
    sync_file: Mutex<File>,
    /// First LSN that is not known to be on stable storage.
    durable: AtomicU64,
}

impl FileLog {
    /// Open the log at `path`, creating an empty one if needed.
    ///
    /// A torn or corrupt frame at the tail (a crash in the middle of an
    /// append) is cut off; everything before it is kept.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let existing = path.exists() && fs::metadata(path)?.len() > 0;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (base, next) = if existing {
            let base = read_header(&mut file)?;
            let end = scan_frames(&mut file)?;
            (base, LSN(base.0 + end - LOG_HEADER_SIZE))
        } else {
            let base = LSN(LOG_HEADER_SIZE);
            write_header(&mut file, base)?;
            file.sync_all()?;
            (base, base)
        };

        debug!("opened log {:?}: base {}, next {}", path, base, next);

        let sync_file = file.try_clone()?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileLogInner {
                file,
                base,
                next,
                flushed: next,
                buffer: BytesMut::with_capacity(LOG_BUFFER_SIZE),
                closed: false,
            }),
            sync_file: Mutex::new(sync_file),
            durable: AtomicU64::new(next.0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File, base: LSN) -> StorageResult<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(LOG_MAGIC)?;
    file.write_u32::<LittleEndian>(LOG_VERSION)?;
    file.write_u64::<LittleEndian>(base.0)?;
    Ok(())
}

fn read_header(file: &mut File) -> StorageResult<LSN> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(StorageError::CorruptLog {
            offset: 0,
            reason: "bad magic".to_string(),
        });
    }
    let version = file.read_u32::<LittleEndian>()?;
    if version != LOG_VERSION {
        return Err(StorageError::CorruptLog {
            offset: 8,
            reason: format!("unsupported version {}", version),
        });
    }
    Ok(LSN(file.read_u64::<LittleEndian>()?))
}

/// Walk the frames after the header and return the offset just past the
/// last intact one, cutting the file there if anything follows.
fn scan_frames(file: &mut File) -> StorageResult<u64> {
    let len = file.metadata()?.len();
    let mut offset = LOG_HEADER_SIZE;

    {
        let mut reader = BufReader::new(&*file);
        reader.seek(SeekFrom::Start(offset))?;
        let mut payload = Vec::new();

        while offset + FRAME_HEADER_SIZE <= len {
            let payload_len = reader.read_u32::<LittleEndian>()? as u64;
            let crc = reader.read_u32::<LittleEndian>()?;
            if offset + FRAME_HEADER_SIZE + payload_len > len {
                break;
            }
            payload.resize(payload_len as usize, 0);
            reader.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != crc {
                break;
            }
            offset += FRAME_HEADER_SIZE + payload_len;
        }
    }

    if offset < len {
        warn!(
            "log: discarding {} bytes of torn tail at offset {}",
            len - offset,
            offset
        );
        file.set_len(offset)?;
        file.sync_all()?;
    }
    Ok(offset)
}

fn decode_frame(frame: &[u8], lsn: LSN) -> StorageResult<LogEntry> {
    let corrupt = |reason: &str| StorageError::CorruptLog {
        offset: lsn.0,
        reason: reason.to_string(),
    };

    if frame.len() < FRAME_HEADER_SIZE as usize {
        return Err(corrupt("short frame header"));
    }
    let payload_len = LittleEndian::read_u32(&frame[0..4]) as usize;
    let crc = LittleEndian::read_u32(&frame[4..8]);
    let payload = frame
        .get(8..8 + payload_len)
        .ok_or_else(|| corrupt("short frame payload"))?;
    if crc32fast::hash(payload) != crc {
        return Err(corrupt("checksum mismatch"));
    }

    let entry = LogEntry::decode(payload)?;
    if entry.lsn != lsn {
        return Err(corrupt("entry LSN does not match its position"));
    }
    Ok(entry)
}

impl LogBackend for FileLog {
    fn write_entry(&self, entry: &mut LogEntry) -> StorageResult<LSN> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let lsn = inner.next;
        entry.lsn = lsn;
        let payload = entry.encode()?;

        inner.buffer.put_u32_le(payload.len() as u32);
        inner.buffer.put_u32_le(crc32fast::hash(&payload));
        inner.buffer.put_slice(&payload);
        inner.next = LSN(lsn.0 + FRAME_HEADER_SIZE + payload.len() as u64);

        if inner.buffer.len() >= LOG_BUFFER_SIZE {
            inner.flush_buffer()?;
        }
        Ok(lsn)
    }

    fn read_entry(&self, lsn: LSN) -> StorageResult<Option<LogEntry>> {
        let mut inner = self.inner.lock();
        if lsn < inner.base || lsn >= inner.next {
            return Ok(None);
        }

        if lsn >= inner.flushed {
            let start = (lsn.0 - inner.flushed.0) as usize;
            return decode_frame(&inner.buffer[start..], lsn).map(Some);
        }

        let offset = inner.file_offset(lsn);
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        inner.file.read_exact(&mut header)?;
        let payload_len = LittleEndian::read_u32(&header[0..4]) as usize;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload_len);
        frame.extend_from_slice(&header);
        frame.resize(FRAME_HEADER_SIZE as usize + payload_len, 0);
        inner.file.read_exact(&mut frame[FRAME_HEADER_SIZE as usize..])?;

        decode_frame(&frame, lsn).map(Some)
    }

    fn next_entry(&self, entry: &LogEntry) -> StorageResult<LSN> {
        Ok(LSN(entry.lsn.0 + FRAME_HEADER_SIZE + entry.encoded_len()?))
    }

    fn next_available_lsn(&self) -> LSN {
        self.inner.lock().next
    }

    fn first_unstable_lsn(&self, _mode: ForceMode) -> LSN {
        LSN(self.durable.load(Ordering::SeqCst))
    }

    fn force_tail(&self, _mode: ForceMode) -> StorageResult<()> {
        let sync_file = self.sync_file.lock();

        let target = {
            let mut inner = self.inner.lock();
            inner.flush_buffer()?;
            inner.next
        };
        if target.0 <= self.durable.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Appenders only need `inner`, so they keep going during the fsync.
        sync_file.sync_data()?;
        self.durable.fetch_max(target.0, Ordering::SeqCst);
        Ok(())
    }

    fn truncate(&self, lsn: LSN) -> StorageResult<()> {
        let mut sync_file = self.sync_file.lock();
        let mut inner = self.inner.lock();

        if lsn <= inner.base {
            return Ok(());
        }
        let lsn = lsn.min(inner.next);
        inner.flush_buffer()?;

        let tmp_path = self.path.with_extension("truncating");
        {
            let mut tmp = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            write_header(&mut tmp, lsn)?;

            let offset = inner.file_offset(lsn);
            inner.file.seek(SeekFrom::Start(offset))?;
            std::io::copy(&mut (&inner.file).take(inner.next.0 - lsn.0), &mut tmp)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }

        inner.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *sync_file = inner.file.try_clone()?;
        inner.base = lsn;
        self.durable.fetch_max(inner.next.0, Ordering::SeqCst);

        info!("log truncated to {}", lsn);
        Ok(())
    }

    fn truncation_point(&self) -> LSN {
        self.inner.lock().base
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn close(&self) -> StorageResult<()> {
        if self.inner.lock().closed {
            return Ok(());
        }
        self.force_tail(ForceMode::Commit)?;
        self.inner.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageId;
    use crate::storage::wal::record::{LogBody, UpdateLog};
    use crate::transaction::TransactionId;
    use anyhow::Result;
    use tempfile::tempdir;

    fn update_entry(page: u64, byte: u8) -> LogEntry {
        LogEntry::new(
            TransactionId(1),
            LSN::INVALID,
            LogBody::Update(UpdateLog {
                page: PageId(page),
                op: 1,
                arg: vec![byte; 16],
            }),
        )
    }

    fn collect(log: &FileLog) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let mut lsn = log.truncation_point();
        while let Some(entry) = log.read_entry(lsn)? {
            lsn = log.next_entry(&entry)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    #[test]
    fn test_append_read_and_force() -> Result<()> {
        let dir = tempdir()?;
        let log = FileLog::open(&dir.path().join("test.log"))?;
        assert!(log.is_durable());
        assert_eq!(log.truncation_point(), LSN(LOG_HEADER_SIZE));

        let first = log.write_entry(&mut update_entry(1, 0xA))?;
        let second = log.write_entry(&mut update_entry(2, 0xB))?;
        assert_eq!(first, LSN(LOG_HEADER_SIZE));
        assert!(second > first);

        // Buffered entries are readable but not yet durable.
        assert!(log.first_unstable_lsn(ForceMode::Commit) <= first);
        assert_eq!(log.read_entry(second)?.unwrap().page(), Some(PageId(2)));

        log.force_tail(ForceMode::Commit)?;
        assert!(log.first_unstable_lsn(ForceMode::Commit) > second);
        assert_eq!(log.read_entry(first)?.unwrap().page(), Some(PageId(1)));

        assert!(log.read_entry(log.next_available_lsn())?.is_none());
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_entries() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        let lsns = {
            let log = FileLog::open(&path)?;
            let lsns: Vec<_> = (0..10)
                .map(|i| log.write_entry(&mut update_entry(i, i as u8)))
                .collect::<StorageResult<_>>()?;
            log.close()?;
            lsns
        };

        let log = FileLog::open(&path)?;
        let entries = collect(&log)?;
        assert_eq!(entries.len(), 10);
        assert_eq!(
            entries.iter().map(|e| e.lsn).collect::<Vec<_>>(),
            lsns
        );
        assert!(log.next_available_lsn() > *lsns.last().unwrap());
        Ok(())
    }

    #[test]
    fn test_unforced_entries_are_lost() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        {
            let log = FileLog::open(&path)?;
            log.write_entry(&mut update_entry(1, 1))?;
            log.force_tail(ForceMode::Commit)?;
            log.write_entry(&mut update_entry(2, 2))?;
            // Dropped without a force: the second entry never left the buffer.
        }

        let log = FileLog::open(&path)?;
        assert_eq!(collect(&log)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_discarded() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        let tail = {
            let log = FileLog::open(&path)?;
            log.write_entry(&mut update_entry(1, 1))?;
            log.write_entry(&mut update_entry(2, 2))?;
            log.close()?;
            log.next_available_lsn()
        };

        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[40, 0, 0, 0, 1, 2, 3, 4, 5, 6])?;
        }

        let log = FileLog::open(&path)?;
        assert_eq!(collect(&log)?.len(), 2);
        assert_eq!(log.next_available_lsn(), tail);
        assert_eq!(fs::metadata(&path)?.len(), tail.0);
        Ok(())
    }

    #[test]
    fn test_truncate_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        let log = FileLog::open(&path)?;
        let lsns: Vec<_> = (0..6)
            .map(|i| log.write_entry(&mut update_entry(i, i as u8)))
            .collect::<StorageResult<_>>()?;

        log.truncate(lsns[4])?;
        assert_eq!(log.truncation_point(), lsns[4]);
        assert!(log.read_entry(lsns[3])?.is_none());
        assert_eq!(log.read_entry(lsns[5])?.unwrap().page(), Some(PageId(5)));

        // LSNs keep growing across a truncation.
        let after = log.write_entry(&mut update_entry(9, 9))?;
        assert!(after > lsns[5]);
        log.close()?;
        drop(log);

        let log = FileLog::open(&path)?;
        assert_eq!(log.truncation_point(), lsns[4]);
        let pages: Vec<_> = collect(&log)?.iter().filter_map(|e| e.page()).collect();
        assert_eq!(pages, vec![PageId(4), PageId(5), PageId(9)]);
        Ok(())
    }

    #[test]
    fn test_closed_log_rejects_appends() -> Result<()> {
        let dir = tempdir()?;
        let log = FileLog::open(&dir.path().join("test.log"))?;
        log.close()?;
        assert!(matches!(
            log.write_entry(&mut update_entry(1, 1)),
            Err(StorageError::Closed)
        ));
        Ok(())
    }
}
