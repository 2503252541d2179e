//! Engine configuration.

use std::path::{Path, PathBuf};

use crate::recovery::TruncationConfig;
use crate::storage::buffer::BufferConfig;
use crate::storage::wal::GroupForceConfig;

/// Where the log lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// `log_file` under `data_dir`.
    File,
    /// Lost when the process exits.
    InMemory,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the page file and the log. `None` keeps pages in memory.
    pub data_dir: Option<PathBuf>,
    pub page_file: String,
    pub log_file: String,
    pub log: LogKind,
    pub buffer: BufferConfig,
    /// Capacity of the transaction table.
    pub max_transactions: usize,
    /// Batch commit forces. `None` forces every commit on its own.
    pub group_force: Option<GroupForceConfig>,
    pub truncation: TruncationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_file: "pages.db".to_string(),
            log_file: "log.wal".to_string(),
            log: LogKind::InMemory,
            buffer: BufferConfig::default(),
            max_transactions: 1000,
            group_force: Some(GroupForceConfig::default()),
            truncation: TruncationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Pages and log both in memory, no group force, no background truncation.
    pub fn in_memory() -> Self {
        Self {
            group_force: None,
            truncation: TruncationConfig {
                enabled: false,
                ..TruncationConfig::default()
            },
            ..Self::default()
        }
    }

    /// Page file and log under `dir`.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: Some(dir.as_ref().to_path_buf()),
            log: LogKind::File,
            ..Self::default()
        }
    }

    pub fn page_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(&self.page_file))
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(&self.log_file))
    }
}
