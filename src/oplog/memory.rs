//! Volatile operation log used by tests and embedded clusters.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{OperationLog, OperationLogEntry, OplogIterator};
use crate::error::Result;
use crate::id::LogId;
use crate::operation::RaftOperation;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<LogId, RaftOperation>,
    last: Option<LogId>,
}

impl Inner {
    fn first_retained(&self) -> LogId {
        self.entries
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| LogId::after(self.last))
    }

    fn range(&self, from: LogId, to: LogId) -> OplogIterator {
        let entries: Vec<_> = self
            .entries
            .range(from..=to)
            .map(|(id, op)| OperationLogEntry::new(*id, op.clone()))
            .collect();
        Box::new(entries.into_iter())
    }
}

/// Operation log kept in memory
#[derive(Default)]
pub struct InMemoryOperationLog {
    inner: Mutex<Inner>,
}

impl InMemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OperationLog for InMemoryOperationLog {
    fn log(&self, operation: &RaftOperation) -> Result<LogId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let log_id = LogId::after(inner.last);
        inner.entries.insert(log_id, operation.clone());
        inner.last = Some(log_id);
        Ok(log_id)
    }

    fn log_received(&self, log_id: LogId, operation: &RaftOperation) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.last.is_some_and(|last| log_id <= last) {
            return Ok(true);
        }
        if log_id != LogId::after(inner.last) {
            return Ok(false);
        }
        inner.entries.insert(log_id, operation.clone());
        inner.last = Some(log_id);
        Ok(true)
    }

    fn last_persistent_log(&self) -> Option<LogId> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).last
    }

    fn iterate(&self, from: LogId, to: LogId) -> Result<OplogIterator> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if from > to {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(inner.range(from, to))
    }

    fn search_from(&self, from: LogId) -> Result<Option<OplogIterator>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if from < inner.first_retained() {
            return Ok(None);
        }
        match inner.last {
            Some(last) if from <= last => Ok(Some(inner.range(from, last))),
            _ => Ok(Some(Box::new(std::iter::empty()))),
        }
    }

    fn rebase(&self, last: Option<LogId>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.last = last;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::tests::check_log_contract;

    #[test]
    fn test_in_memory_contract() {
        let log = InMemoryOperationLog::new();
        check_log_contract(&log);
    }

    #[test]
    fn test_empty_log_search() {
        let log = InMemoryOperationLog::new();
        assert!(log.is_empty());
        assert_eq!(log.search_from(LogId::FIRST).unwrap().unwrap().count(), 0);
    }
}
