//! Log truncation.
//!
//! The log can be cut at the recovery LSN: the oldest of the dirty pages'
//! recLSNs, the running transactions' recLSNs, and the first LSN that is not
//! yet durable. Nothing before that point is needed by redo or undo, provided
//! the pages written back so far are on disk, so page storage is forced
//! before every cut. A buffer manager that persists nothing pins the log.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;
use crate::storage::buffer::BufferManager;
use crate::storage::wal::{ForceMode, LogManager, LSN};
use crate::transaction::TransactionTable;

#[derive(Debug, Clone)]
pub struct TruncationConfig {
    /// Run the background truncation thread.
    pub enabled: bool,
    /// How often the background thread checks the log size.
    pub interval: Duration,
    /// Smallest gain, in LSN units, worth an unforced truncation.
    pub min_increment: u64,
    /// Log size above which the background thread truncates.
    pub target_log_size: u64,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            min_increment: 1024 * 1024,
            target_log_size: 5 * 1024 * 1024,
        }
    }
}

pub struct Truncator {
    log: Arc<LogManager>,
    buffers: Arc<dyn BufferManager>,
    table: Arc<TransactionTable>,
    config: TruncationConfig,
}

impl Truncator {
    pub fn new(
        log: Arc<LogManager>,
        buffers: Arc<dyn BufferManager>,
        table: Arc<TransactionTable>,
        config: TruncationConfig,
    ) -> Self {
        Self {
            log,
            buffers,
            table,
            config,
        }
    }

    pub fn config(&self) -> &TruncationConfig {
        &self.config
    }

    /// Oldest LSN recovery may still need.
    pub fn rec_lsn(&self) -> LSN {
        if !self.buffers.persists_pages() {
            return self.log.truncation_point();
        }
        let stable = self.log.first_unstable_lsn(ForceMode::Wal);
        [self.buffers.dirty_pages().min_rec_lsn(), self.table.min_rec_lsn()]
            .into_iter()
            .flatten()
            .fold(stable, LSN::min)
    }

    /// Bytes (or entries, for the in-memory log) between the truncation
    /// point and the durable tail.
    pub fn log_size(&self) -> u64 {
        let stable = self.log.first_unstable_lsn(ForceMode::Wal);
        stable.0.saturating_sub(self.log.truncation_point().0)
    }

    /// Truncate if enough log can go. With `force`, or once the log is far
    /// past its target size, dirty pages holding truncation back are
    /// written first. Returns whether the log was truncated.
    pub fn truncate_now(&self, force: bool) -> Result<bool> {
        let point = self.log.truncation_point();
        let rec_lsn = self.rec_lsn();
        if rec_lsn.0.saturating_sub(point.0) > self.config.min_increment {
            self.cut(rec_lsn)?;
            return Ok(true);
        }
        if !force && self.log_size() <= 2 * self.config.target_log_size {
            return Ok(false);
        }

        debug!(
            "flushing {} dirty pages to advance truncation past {}",
            self.buffers.dirty_pages().dirty_count(),
            rec_lsn
        );
        self.buffers.dirty_pages().flush(self.buffers.as_ref())?;
        let rec_lsn = self.rec_lsn();
        if rec_lsn > point {
            self.cut(rec_lsn)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Truncate at `lsn`, clamped down to the recovery LSN and to an entry
    /// boundary. Returns the new truncation point.
    pub fn truncate_to(&self, lsn: LSN) -> Result<LSN> {
        let point = self.log.truncation_point();
        let rec_lsn = self.rec_lsn();
        let target = if lsn >= rec_lsn {
            rec_lsn
        } else {
            self.boundary_before(lsn)?
        };
        if target > point {
            self.cut(target)?;
        }
        Ok(self.log.truncation_point())
    }

    /// Pages written back before `lsn` was chosen may still sit in OS
    /// buffers; they are forced before the log entries that rebuild them go.
    fn cut(&self, lsn: LSN) -> Result<()> {
        self.buffers.force_pages()?;
        self.log.truncate(lsn)?;
        Ok(())
    }

    /// Last entry LSN at or before `lsn`.
    fn boundary_before(&self, lsn: LSN) -> Result<LSN> {
        let mut boundary = self.log.truncation_point();
        for entry in self.log.iter_from(boundary) {
            let entry = entry?;
            if entry.lsn > lsn {
                break;
            }
            boundary = entry.lsn;
        }
        Ok(boundary)
    }
}

enum TruncationMessage {
    Shutdown,
}

/// Background thread that truncates whenever the log outgrows its target size.
pub struct TruncationWorker {
    sender: Sender<TruncationMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TruncationWorker {
    pub fn start(truncator: Arc<Truncator>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::spawn(move || Self::run(truncator, receiver));
        info!("automatic log truncation started");
        Self {
            sender,
            thread: Some(thread),
        }
    }

    fn run(truncator: Arc<Truncator>, receiver: Receiver<TruncationMessage>) {
        let interval = truncator.config().interval;
        loop {
            match receiver.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if truncator.log_size() > truncator.config().target_log_size {
                        if let Err(e) = truncator.truncate_now(false) {
                            warn!("automatic truncation failed: {}", e);
                        }
                    }
                }
                Ok(TruncationMessage::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break
                }
            }
        }
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.sender.send(TruncationMessage::Shutdown);
            if thread.join().is_err() {
                warn!("truncation thread panicked");
            }
        }
    }
}

impl Drop for TruncationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::slotted;
    use crate::operation::OperationRegistry;
    use crate::storage::allocation::AllocationPolicy;
    use crate::storage::buffer::{new_buffer_manager, BufferConfig, BufferKind};
    use crate::storage::dirty_page_table::DirtyPageTable;
    use crate::storage::disk::MemoryPageHandle;
    use crate::storage::page::PageId;
    use crate::storage::wal::InMemoryLog;
    use crate::transaction::TransactionManager;
    use anyhow::Result;

    fn setup(config: TruncationConfig) -> (Arc<TransactionManager>, Truncator) {
        setup_with(BufferKind::Hash, config)
    }

    fn setup_with(kind: BufferKind, config: TruncationConfig) -> (Arc<TransactionManager>, Truncator) {
        let table = Arc::new(TransactionTable::new(8));
        let log = Arc::new(LogManager::new(Arc::new(InMemoryLog::new()), table.clone(), None));
        let buffers = new_buffer_manager(
            &BufferConfig {
                kind,
                capacity: 8,
                ..BufferConfig::default()
            },
            Arc::new(MemoryPageHandle::new()),
            log.clone(),
            Arc::new(DirtyPageTable::new()),
        );
        let truncator = Truncator::new(log.clone(), buffers.clone(), table.clone(), config);
        let tm = Arc::new(TransactionManager::new(
            table,
            log,
            buffers,
            Arc::new(OperationRegistry::with_builtin()),
            Arc::new(AllocationPolicy::new()),
        ));
        (tm, truncator)
    }

    fn small() -> TruncationConfig {
        TruncationConfig {
            enabled: false,
            min_increment: 2,
            target_log_size: 4,
            ..TruncationConfig::default()
        }
    }

    fn touch(tm: &TransactionManager, page: u64) -> Result<()> {
        let xid = tm.begin()?;
        tm.update_with(xid, PageId(page), slotted::SET_RANGE, |guard| {
            Ok(Some(slotted::encode(&slotted::set_range_arg(guard, 0, &[7])?)?))
        })?;
        tm.commit(xid)?;
        Ok(())
    }

    #[test]
    fn test_running_transaction_pins_the_log() -> Result<()> {
        let (tm, truncator) = setup(small());
        let running = tm.begin()?;
        let begin = tm.table().get(running)?.rec_lsn.expect("rec lsn");
        for page in 0..4 {
            touch(&tm, page)?;
        }
        tm.buffers().flush_all()?;

        assert_eq!(truncator.rec_lsn(), begin);
        truncator.truncate_now(true)?;
        assert!(tm.log().truncation_point() <= begin);
        assert!(tm.log().read_entry(begin)?.is_some());

        tm.commit(running)?;
        assert!(truncator.truncate_now(true)?);
        assert!(tm.log().truncation_point() > begin);
        Ok(())
    }

    #[test]
    fn test_dirty_page_pins_the_log() -> Result<()> {
        let (tm, truncator) = setup(TruncationConfig {
            min_increment: 0,
            ..small()
        });
        touch(&tm, 0)?;
        let rec = tm.buffers().dirty_pages().rec_lsn(PageId(0)).expect("dirty");
        for _ in 0..4 {
            let xid = tm.begin()?;
            tm.commit(xid)?;
        }
        assert_eq!(truncator.rec_lsn(), rec);
        assert!(truncator.truncate_now(false)?);
        assert_eq!(tm.log().truncation_point(), rec);

        // A forced truncation writes the page back and moves past it.
        assert!(truncator.truncate_now(true)?);
        assert!(tm.log().truncation_point() > rec);
        assert!(!tm.buffers().dirty_pages().is_dirty(PageId(0)));
        Ok(())
    }

    #[test]
    fn test_truncate_to_clamps() -> Result<()> {
        let (tm, truncator) = setup(small());
        let running = tm.begin()?;
        let begin = tm.table().get(running)?.rec_lsn.expect("rec lsn");
        touch(&tm, 1)?;
        tm.buffers().flush_all()?;

        let point = truncator.truncate_to(LSN(u64::MAX))?;
        assert_eq!(point, begin);

        tm.commit(running)?;
        tm.buffers().flush_all()?;
        let asked = tm.log().next_available_lsn();
        let point = truncator.truncate_to(LSN(begin.0 + 1))?;
        assert!(point <= LSN(begin.0 + 1));
        assert!(point < asked);
        Ok(())
    }

    #[test]
    fn test_memory_only_pages_pin_the_log() -> Result<()> {
        let (tm, truncator) = setup_with(
            BufferKind::PageArray,
            TruncationConfig {
                min_increment: 0,
                ..small()
            },
        );
        for page in 0..4 {
            touch(&tm, page)?;
        }
        tm.buffers().flush_all()?;
        assert_eq!(tm.buffers().dirty_pages().dirty_count(), 0);

        let point = tm.log().truncation_point();
        assert_eq!(truncator.rec_lsn(), point);
        assert!(!truncator.truncate_now(true)?);
        assert_eq!(truncator.truncate_to(LSN(u64::MAX))?, point);
        assert!(tm.log().read_entry(point)?.is_some());
        Ok(())
    }

    #[test]
    fn test_worker_truncates_in_background() -> Result<()> {
        let config = TruncationConfig {
            enabled: true,
            interval: Duration::from_millis(10),
            ..small()
        };
        let (tm, truncator) = setup(config);
        for page in 0..4 {
            touch(&tm, page)?;
        }
        tm.buffers().flush_all()?;
        let truncator = Arc::new(truncator);
        let worker = TruncationWorker::start(truncator.clone());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while tm.log().truncation_point() == LSN(1) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop();
        assert!(tm.log().truncation_point() > LSN(1));
        Ok(())
    }
}
