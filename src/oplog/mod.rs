//! Operation Log Module
//!
//! Append-only, id-ordered log of structural operations. The leader
//! appends with [`OperationLog::log`], assigning the next [`LogId`];
//! followers append what they receive with [`OperationLog::log_received`],
//! which refuses anything that would leave a gap.

mod memory;
mod persistent;
mod segment;

pub use memory::InMemoryOperationLog;
pub use persistent::PersistentOperationLog;

use crate::error::Result;
use crate::id::LogId;
use crate::operation::RaftOperation;

/// An immutable entry of the operation log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLogEntry {
    pub log_id: LogId,
    pub operation: RaftOperation,
}

impl OperationLogEntry {
    pub fn new(log_id: LogId, operation: RaftOperation) -> Self {
        Self { log_id, operation }
    }
}

/// Ascending iterator over log entries
pub type OplogIterator = Box<dyn Iterator<Item = OperationLogEntry> + Send>;

/// Durable operation log contract
///
/// Any error returned by an append is a durability failure: the caller
/// cannot keep replicating on top of a log it cannot trust.
pub trait OperationLog: Send + Sync {
    /// Append on the leader's behalf, returning the assigned id once durable
    fn log(&self, operation: &RaftOperation) -> Result<LogId>;

    /// Append an entry received from the leader.
    ///
    /// Returns `false` when `log_id` is not the next expected id, in which
    /// case nothing is stored. Ids already stored are accepted as
    /// duplicates without being rewritten.
    fn log_received(&self, log_id: LogId, operation: &RaftOperation) -> Result<bool>;

    /// Highest stored id, `None` when nothing was ever logged
    fn last_persistent_log(&self) -> Option<LogId>;

    /// Entries in the closed range `from..=to`, ascending
    fn iterate(&self, from: LogId, to: LogId) -> Result<OplogIterator>;

    /// Entries from `from` to the end of the log.
    ///
    /// Returns `None` when `from` is no longer retained.
    fn search_from(&self, from: LogId) -> Result<Option<OplogIterator>>;

    /// Discard every entry and continue numbering after `last`
    fn rebase(&self, last: Option<LogId>) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::id::{NodeIdentity, SessionOperationId};

    pub fn drop_op(name: &str, sequential: u64) -> RaftOperation {
        RaftOperation::DropDatabase {
            operation_id: SessionOperationId::new("node-a", sequential),
            database: name.to_string(),
        }
    }

    /// Behaviour every implementation has to share
    pub fn check_log_contract(log: &dyn OperationLog) {
        assert_eq!(log.last_persistent_log(), None);

        let first = log.log(&drop_op("a", 1)).unwrap();
        let second = log.log(&drop_op("b", 2)).unwrap();
        assert_eq!(first, LogId::FIRST);
        assert_eq!(second, LogId::new(2));

        // Gap: nothing stored
        assert!(!log.log_received(LogId::new(4), &drop_op("d", 4)).unwrap());
        assert_eq!(log.last_persistent_log(), Some(LogId::new(2)));

        // Duplicate: accepted, not rewritten
        assert!(log.log_received(LogId::new(2), &drop_op("zzz", 99)).unwrap());

        let join = RaftOperation::NodeJoin {
            identity: NodeIdentity::new("id-3", "node-3"),
        };
        assert!(log.log_received(LogId::new(3), &join).unwrap());
        assert_eq!(log.last_persistent_log(), Some(LogId::new(3)));

        let range: Vec<_> = log.iterate(LogId::new(2), LogId::new(3)).unwrap().collect();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0], OperationLogEntry::new(LogId::new(2), drop_op("b", 2)));
        assert_eq!(range[1].operation, join);

        let tail: Vec<_> = log.search_from(LogId::FIRST).unwrap().unwrap().collect();
        assert_eq!(
            tail.iter().map(|e| e.log_id.as_u64()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(log.search_from(LogId::new(4)).unwrap().unwrap().count(), 0);

        log.rebase(Some(LogId::new(10))).unwrap();
        assert_eq!(log.last_persistent_log(), Some(LogId::new(10)));
        assert!(log.search_from(LogId::new(3)).unwrap().is_none());
        assert!(!log.log_received(LogId::new(12), &drop_op("x", 5)).unwrap());
        assert!(log.log_received(LogId::new(11), &drop_op("x", 5)).unwrap());
        assert_eq!(log.log(&drop_op("y", 6)).unwrap(), LogId::new(12));
    }
}
