//! Segmented on-disk operation log.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error, info};

use super::segment::{self, Segment};
use super::{OperationLog, OperationLogEntry, OplogIterator};
use crate::config::OplogConfig;
use crate::error::{Error, Result};
use crate::id::LogId;
use crate::operation::{OperationFrame, RaftOperation};

struct Inner {
    /// First id and path of every segment, oldest first
    segments: Vec<(LogId, PathBuf)>,
    active: Option<Segment>,
    last: Option<LogId>,
    first_retained: LogId,
}

/// Operation log stored as a directory of segment files
pub struct PersistentOperationLog {
    dir: PathBuf,
    config: OplogConfig,
    inner: Mutex<Inner>,
}

impl PersistentOperationLog {
    /// Open (or create) the log stored in `dir`
    pub fn open(dir: impl Into<PathBuf>, config: OplogConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let paths = segment::list_segments(&dir)?;
        let mut segments = Vec::with_capacity(paths.len());
        for path in &paths {
            let header = segment::read_header(path)?;
            segments.push((header.first_id, path.clone()));
        }

        let mut inner = Inner {
            segments,
            active: None,
            last: None,
            first_retained: LogId::FIRST,
        };

        if let Some((first_id, _)) = inner.segments.first() {
            inner.first_retained = *first_id;
        }

        if let Some((_, path)) = inner.segments.last().cloned() {
            let (active, records) = Segment::open(path, config.compression)?;
            let first_id = active.first_id();
            inner.last = match records.last() {
                Some(record) => Some(record.log_id),
                None if first_id > LogId::FIRST => Some(LogId::new(first_id.as_u64() - 1)),
                None => None,
            };
            inner.active = Some(active);
        }

        info!(
            "Opened operation log at {} ({} segments, last entry {:?})",
            dir.display(),
            inner.segments.len(),
            inner.last
        );

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Directory holding the segment files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, inner: &mut Inner, log_id: LogId, operation: &RaftOperation) -> Result<()> {
        let frame = OperationFrame::encode(operation)?;
        self.write_record(inner, log_id, &frame).map_err(|e| {
            error!("Failed to append {} to the operation log: {}", log_id, e);
            Error::Oplog(format!("Failed to append {}: {}", log_id, e))
        })?;
        inner.last = Some(log_id);
        Ok(())
    }

    fn write_record(&self, inner: &mut Inner, log_id: LogId, frame: &OperationFrame) -> Result<()> {
        let rotate = inner
            .active
            .as_ref()
            .map_or(true, |s| s.entry_count() >= self.config.entries_per_segment);
        if rotate {
            if let Some(previous) = inner.active.take() {
                previous.sync()?;
            }
            let path = self.dir.join(segment::segment_file_name(log_id));
            debug!("Starting operation log segment {}", path.display());
            let created = Segment::create(path.clone(), log_id, self.config.compression)?;
            inner.segments.push((log_id, path));
            inner.active = Some(created);
        }

        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| Error::Internal("no active segment".into()))?;
        active.append(log_id, frame)?;
        if self.config.fsync {
            active.sync()?;
        }
        Ok(())
    }

    fn read_range(&self, inner: &Inner, from: LogId, to: LogId) -> Result<Vec<OperationLogEntry>> {
        let mut entries = Vec::new();

        for (index, (first_id, path)) in inner.segments.iter().enumerate() {
            let next_first = inner.segments.get(index + 1).map(|(id, _)| *id);
            if *first_id > to || next_first.is_some_and(|next| next <= from) {
                continue;
            }

            let scanned = segment::scan(path)?;
            if scanned.torn {
                return Err(Error::OplogCorrupted {
                    log_id: LogId::new(first_id.as_u64() + scanned.records.len() as u64),
                    reason: format!("unreadable record in {}", path.display()),
                });
            }

            for record in scanned.records {
                if record.log_id < from || record.log_id > to {
                    continue;
                }
                let operation = record.frame.decode().map_err(|e| Error::OplogCorrupted {
                    log_id: record.log_id,
                    reason: e.to_string(),
                })?;
                entries.push(OperationLogEntry::new(record.log_id, operation));
            }
        }

        Ok(entries)
    }
}

impl OperationLog for PersistentOperationLog {
    fn log(&self, operation: &RaftOperation) -> Result<LogId> {
        let mut inner = self.lock();
        let log_id = LogId::after(inner.last);
        self.append(&mut inner, log_id, operation)?;
        Ok(log_id)
    }

    fn log_received(&self, log_id: LogId, operation: &RaftOperation) -> Result<bool> {
        let mut inner = self.lock();
        if inner.last.is_some_and(|last| log_id <= last) {
            return Ok(true);
        }
        if log_id != LogId::after(inner.last) {
            return Ok(false);
        }
        self.append(&mut inner, log_id, operation)?;
        Ok(true)
    }

    fn last_persistent_log(&self) -> Option<LogId> {
        self.lock().last
    }

    fn iterate(&self, from: LogId, to: LogId) -> Result<OplogIterator> {
        let inner = self.lock();
        if from > to {
            return Ok(Box::new(std::iter::empty()));
        }
        let entries = self.read_range(&inner, from, to)?;
        Ok(Box::new(entries.into_iter()))
    }

    fn search_from(&self, from: LogId) -> Result<Option<OplogIterator>> {
        let inner = self.lock();
        if from < inner.first_retained {
            return Ok(None);
        }
        let entries = match inner.last {
            Some(last) if from <= last => self.read_range(&inner, from, last)?,
            _ => Vec::new(),
        };
        Ok(Some(Box::new(entries.into_iter())))
    }

    fn rebase(&self, last: Option<LogId>) -> Result<()> {
        let mut inner = self.lock();
        inner.active = None;
        for (_, path) in inner.segments.drain(..) {
            std::fs::remove_file(&path)?;
        }

        let first_id = LogId::after(last);
        let path = self.dir.join(segment::segment_file_name(first_id));
        let created = Segment::create(path.clone(), first_id, self.config.compression)?;
        inner.segments.push((first_id, path));
        inner.active = Some(created);
        inner.last = last;
        inner.first_retained = first_id;

        info!("Rebased operation log, next entry is {}", first_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::tests::{check_log_contract, drop_op};
    use tempfile::tempdir;

    fn config(entries_per_segment: usize) -> OplogConfig {
        OplogConfig {
            entries_per_segment,
            fsync: true,
            compression: false,
        }
    }

    #[test]
    fn test_persistent_contract() {
        let dir = tempdir().unwrap();
        let log = PersistentOperationLog::open(dir.path(), config(2)).unwrap();
        check_log_contract(&log);
    }

    #[test]
    fn test_reopen_restores_entries() {
        let dir = tempdir().unwrap();

        {
            let log = PersistentOperationLog::open(dir.path(), config(3)).unwrap();
            for i in 1..=7 {
                log.log(&drop_op("db", i)).unwrap();
            }
        }

        assert_eq!(segment::list_segments(dir.path()).unwrap().len(), 3);

        let log = PersistentOperationLog::open(dir.path(), config(3)).unwrap();
        assert_eq!(log.last_persistent_log(), Some(LogId::new(7)));

        let entries: Vec<_> = log.iterate(LogId::new(3), LogId::new(5)).unwrap().collect();
        assert_eq!(
            entries.iter().map(|e| e.log_id.as_u64()).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(entries[0].operation, drop_op("db", 3));

        assert_eq!(log.log(&drop_op("db", 8)).unwrap(), LogId::new(8));
    }

    #[test]
    fn test_compressed_log() {
        let dir = tempdir().unwrap();
        let mut cfg = config(16);
        cfg.compression = true;

        let log = PersistentOperationLog::open(dir.path(), cfg.clone()).unwrap();
        log.log(&drop_op("compressed", 1)).unwrap();
        drop(log);

        let log = PersistentOperationLog::open(dir.path(), cfg).unwrap();
        let entries: Vec<_> = log.search_from(LogId::FIRST).unwrap().unwrap().collect();
        assert_eq!(entries[0].operation, drop_op("compressed", 1));
    }

    #[test]
    fn test_rebase_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let log = PersistentOperationLog::open(dir.path(), config(4)).unwrap();
            log.log(&drop_op("db", 1)).unwrap();
            log.rebase(Some(LogId::new(20))).unwrap();
        }

        let log = PersistentOperationLog::open(dir.path(), config(4)).unwrap();
        assert_eq!(log.last_persistent_log(), Some(LogId::new(20)));
        assert!(log.search_from(LogId::FIRST).unwrap().is_none());
        assert!(log.log_received(LogId::new(21), &drop_op("db", 2)).unwrap());
    }
}
