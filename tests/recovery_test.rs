use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use ariesdb::operation::RecordId;
use ariesdb::recovery::TruncationConfig;
use ariesdb::storage::buffer::{BufferConfig, BufferKind, PolicyKind};
use ariesdb::storage::disk::{FilePageHandle, MemoryPageHandle, PageHandle};
use ariesdb::storage::page::{trailer, PageId, PAGE_SIZE};
use ariesdb::storage::wal::{FileLog, ForceMode, InMemoryLog, LogBackend};
use ariesdb::storage::{StorageResult, LSN};
use ariesdb::transaction::TransactionId;
use ariesdb::{EngineConfig, EngineHandle};
use parking_lot::Mutex;
use tempfile::tempdir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn int(value: i32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

fn read_int(engine: &EngineHandle, xid: TransactionId, rid: RecordId) -> Result<i32> {
    let bytes = engine.read(xid, rid)?;
    Ok(i32::from_le_bytes(bytes.as_slice().try_into()?))
}

fn small_buffer() -> BufferConfig {
    BufferConfig {
        kind: BufferKind::Hash,
        policy: PolicyKind::Lru,
        capacity: 4,
        ..BufferConfig::default()
    }
}

#[test]
fn test_committed_work_survives_crash() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let config = EngineConfig {
        buffer: small_buffer(),
        ..EngineConfig::with_dir(dir.path())
    };

    let (kept, touched) = {
        let engine = EngineHandle::init(config.clone())?;
        let xid = engine.begin()?;
        let kept: Vec<_> = (0..50)
            .map(|i| -> Result<(RecordId, i32)> {
                let rid = engine.alloc(xid, 1000)?;
                engine.set(xid, rid, &[i as u8; 1000])?;
                Ok((rid, i))
            })
            .collect::<Result<_>>()?;
        engine.commit(xid)?;

        // Dirty, partly written back, never committed.
        let loser = engine.begin()?;
        for (rid, _) in kept.iter().step_by(2) {
            engine.set(loser, *rid, &[0xEE; 1000])?;
        }
        let touched = engine.alloc(loser, 8)?;
        engine.simulate_crash();
        (kept, touched)
    };

    let engine = EngineHandle::init(config)?;
    let xid = engine.begin()?;
    for (rid, i) in &kept {
        assert_eq!(engine.read(xid, *rid)?, vec![*i as u8; 1000]);
    }
    assert!(engine.read(xid, touched).is_err());
    engine.commit(xid)?;
    engine.deinit()?;
    Ok(())
}

#[test]
fn test_recovery_is_idempotent() -> Result<()> {
    init_logger();
    let log: Arc<dyn LogBackend> = Arc::new(InMemoryLog::new());
    let pages: Arc<dyn PageHandle> = Arc::new(MemoryPageHandle::new());
    let config = || EngineConfig {
        buffer: small_buffer(),
        ..EngineConfig::in_memory()
    };

    let (winner, loser_rids) = {
        let engine = EngineHandle::init_with(config(), log.clone(), pages.clone())?;
        let xid = engine.begin()?;
        let winner = engine.alloc(xid, 4)?;
        engine.set(xid, winner, &int(42))?;
        engine.commit(xid)?;

        let loser = engine.begin()?;
        engine.set(loser, winner, &int(-1))?;
        let loser_rids: Vec<_> = (0..30)
            .map(|_| engine.alloc(loser, 500))
            .collect::<ariesdb::Result<_>>()?;
        engine.simulate_crash();
        (winner, loser_rids)
    };

    let first = EngineHandle::init_with(config(), log.clone(), pages.clone())?;
    assert_eq!(first.recovery_stats().losers.len(), 1);
    assert!(first.recovery_stats().records_undone > 30);
    first.simulate_crash();

    let second = EngineHandle::init_with(config(), log.clone(), pages.clone())?;
    assert!(second.recovery_stats().losers.is_empty());
    assert_eq!(second.recovery_stats().clrs_written, 0);
    let xid = second.begin()?;
    assert_eq!(read_int(&second, xid, winner)?, 42);
    for rid in loser_rids {
        assert!(second.read(xid, rid).is_err());
    }
    second.commit(xid)?;
    Ok(())
}

/// Page store that checks every write against the durable end of the log.
struct WalCheckingHandle {
    inner: FilePageHandle,
    log: Arc<FileLog>,
    writes: AtomicUsize,
    violations: AtomicUsize,
}

impl PageHandle for WalCheckingHandle {
    fn read(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        self.inner.read(page_id, buf)
    }

    fn write(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if trailer::read_lsn(data) >= self.log.first_unstable_lsn(ForceMode::Wal) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.write(page_id, data)
    }

    fn force(&self) -> StorageResult<()> {
        self.inner.force()
    }

    fn force_range(&self, start: PageId, stop: PageId) -> StorageResult<()> {
        self.inner.force_range(start, stop)
    }

    fn num_pages(&self) -> StorageResult<u64> {
        self.inner.num_pages()
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }
}

#[test]
fn test_pages_never_reach_disk_ahead_of_the_log() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let log = Arc::new(FileLog::open(&dir.path().join("log.wal"))?);
    let pages = Arc::new(WalCheckingHandle {
        inner: FilePageHandle::create(&dir.path().join("pages.db"))?,
        log: log.clone(),
        writes: AtomicUsize::new(0),
        violations: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        buffer: small_buffer(),
        group_force: None,
        ..EngineConfig::in_memory()
    };
    let engine = EngineHandle::init_with(config, log, pages.clone())?;

    let xid = engine.begin()?;
    let rids: Vec<_> = (0..40)
        .map(|_| engine.alloc(xid, 2000))
        .collect::<ariesdb::Result<_>>()?;
    for (i, rid) in rids.iter().enumerate() {
        engine.set(xid, *rid, &[i as u8; 2000])?;
    }
    engine.abort(xid)?;
    engine.deinit()?;

    assert!(pages.writes.load(Ordering::SeqCst) > 0);
    assert_eq!(pages.violations.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_prepared_transaction_survives_restart() -> Result<()> {
    init_logger();
    let dir = tempdir()?;

    let (xid, rid) = {
        let engine = EngineHandle::init(EngineConfig::with_dir(dir.path()))?;
        let xid = engine.begin()?;
        let rid = engine.alloc(xid, 4)?;
        engine.set(xid, rid, &int(7))?;
        engine.prepare(xid)?;
        engine.simulate_crash();
        (xid, rid)
    };

    {
        let engine = EngineHandle::init(EngineConfig::with_dir(dir.path()))?;
        assert_eq!(engine.prepared_transactions(), vec![xid]);
        assert!(engine.recovery_stats().losers.is_empty());
        assert_eq!(read_int(&engine, TransactionId::NONE, rid)?, 7);
        engine.commit(xid)?;
        engine.simulate_crash();
    }

    let engine = EngineHandle::init(EngineConfig::with_dir(dir.path()))?;
    assert!(engine.prepared_transactions().is_empty());
    assert_eq!(read_int(&engine, TransactionId::NONE, rid)?, 7);
    engine.deinit()?;
    Ok(())
}

#[test]
fn test_truncation_respects_running_transactions() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let config = EngineConfig {
        truncation: TruncationConfig {
            enabled: false,
            // Only forced truncation, which writes dirty pages back first.
            min_increment: u64::MAX,
            ..TruncationConfig::default()
        },
        ..EngineConfig::with_dir(dir.path())
    };

    let (committed, running_rid) = {
        let engine = EngineHandle::init(config.clone())?;
        let mut committed = Vec::new();
        for i in 0..20 {
            let xid = engine.begin()?;
            let rid = engine.alloc(xid, 4)?;
            engine.set(xid, rid, &int(i))?;
            engine.commit(xid)?;
            committed.push((rid, i));
        }

        let running = engine.begin()?;
        let begin = engine.table().get(running)?.rec_lsn.unwrap_or(LSN::INVALID);
        let running_rid = engine.alloc(running, 4)?;
        engine.set(running, running_rid, &int(-5))?;

        engine.truncate_now(true)?;
        assert_eq!(engine.log().truncation_point(), begin);
        assert!(engine.log().read_entry(begin)?.is_some());

        // Asking for more than is safe is clamped.
        let point = engine.truncator().truncate_to(LSN(u64::MAX))?;
        assert_eq!(point, begin);

        engine.simulate_crash();
        (committed, running_rid)
    };

    let engine = EngineHandle::init(config)?;
    assert_eq!(engine.recovery_stats().losers.len(), 1);
    for (rid, i) in committed {
        assert_eq!(read_int(&engine, TransactionId::NONE, rid)?, i);
    }
    assert!(engine.read(TransactionId::NONE, running_rid).is_err());
    engine.deinit()?;
    Ok(())
}

/// Page store that keeps writes in a volatile cache until forced, like an
/// OS page cache, and loses the cache on `crash`.
#[derive(Default)]
struct VolatileCacheHandle {
    durable: MemoryPageHandle,
    cached: Mutex<HashMap<PageId, Box<[u8; PAGE_SIZE]>>>,
}

impl VolatileCacheHandle {
    fn crash(&self) {
        self.cached.lock().clear();
    }

    fn sync(&self, keep: impl Fn(PageId) -> bool) -> StorageResult<()> {
        let mut cached = self.cached.lock();
        let synced: Vec<_> = cached.keys().copied().filter(|&page| keep(page)).collect();
        for page in synced {
            if let Some(image) = cached.remove(&page) {
                self.durable.write(page, &image)?;
            }
        }
        Ok(())
    }
}

impl PageHandle for VolatileCacheHandle {
    fn read(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        match self.cached.lock().get(&page_id) {
            Some(image) => {
                buf.copy_from_slice(image.as_ref());
                Ok(())
            }
            None => self.durable.read(page_id, buf),
        }
    }

    fn write(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        self.cached.lock().insert(page_id, Box::new(*data));
        Ok(())
    }

    fn force(&self) -> StorageResult<()> {
        self.sync(|_| true)
    }

    fn force_range(&self, start: PageId, stop: PageId) -> StorageResult<()> {
        self.sync(|page| page >= start && page < stop)
    }

    fn num_pages(&self) -> StorageResult<u64> {
        let cached = self.cached.lock().keys().map(|id| id.0 + 1).max().unwrap_or(0);
        Ok(cached.max(self.durable.num_pages()?))
    }

    fn close(&self) -> StorageResult<()> {
        self.force()
    }
}

#[test]
fn test_truncation_forces_written_back_pages() -> Result<()> {
    init_logger();
    let log: Arc<dyn LogBackend> = Arc::new(InMemoryLog::new());
    let pages = Arc::new(VolatileCacheHandle::default());
    let config = || EngineConfig {
        buffer: small_buffer(),
        ..EngineConfig::in_memory()
    };

    let (kept, evicted) = {
        let engine = EngineHandle::init_with(config(), log.clone(), pages.clone())?;
        let xid = engine.begin()?;
        let kept = engine.alloc(xid, 4)?;
        engine.set(xid, kept, &int(42))?;
        engine.commit(xid)?;

        // Enough full-page records to push earlier pages out of the cache.
        let xid = engine.begin()?;
        let evicted: Vec<_> = (0..12)
            .map(|i| -> Result<(RecordId, i32)> {
                let rid = engine.alloc(xid, 4000)?;
                engine.set(xid, rid, &[i as u8; 4000])?;
                Ok((rid, i))
            })
            .collect::<Result<_>>()?;
        engine.commit(xid)?;

        let before = engine.log().truncation_point();
        assert!(engine.truncate_now(true)?);
        assert!(engine.log().truncation_point() > before);
        engine.simulate_crash();
        (kept, evicted)
    };
    pages.crash();

    let engine = EngineHandle::init_with(config(), log, pages.clone())?;
    assert_eq!(read_int(&engine, TransactionId::NONE, kept)?, 42);
    for (rid, i) in evicted {
        assert_eq!(engine.read(TransactionId::NONE, rid)?, vec![i as u8; 4000]);
    }
    engine.deinit()?;
    Ok(())
}

#[test]
fn test_group_commit_is_durable() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let engine = Arc::new(EngineHandle::init(EngineConfig::with_dir(dir.path()))?);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let engine = engine.clone();
            thread::spawn(move || -> Result<Vec<(RecordId, i32)>> {
                let mut written = Vec::new();
                for i in 0..10 {
                    let xid = engine.begin()?;
                    let rid = engine.alloc(xid, 4)?;
                    let value = worker * 100 + i;
                    engine.set(xid, rid, &int(value))?;
                    engine.commit(xid)?;
                    written.push((rid, value));
                }
                Ok(written)
            })
        })
        .collect();

    let mut written = Vec::new();
    for handle in handles {
        written.extend(handle.join().map_err(|_| anyhow::anyhow!("worker panicked"))??);
    }
    let engine = Arc::try_unwrap(engine).map_err(|_| anyhow::anyhow!("engine still shared"))?;
    engine.simulate_crash();

    let engine = EngineHandle::init(EngineConfig::with_dir(dir.path()))?;
    for (rid, value) in written {
        assert_eq!(read_int(&engine, TransactionId::NONE, rid)?, value);
    }
    engine.deinit()?;
    Ok(())
}
