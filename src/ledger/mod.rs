//! Ledger storage module
//!
//! Single source of truth for accounts, tasks, transactions and settings.
//! Components above it hold ids only and go through the store's atomic
//! update discipline for every balance change.

pub mod store;
pub mod types;

pub use store::{Commit, LedgerStore, RowLock, Snapshot};
pub use types::{
    Account, ProfileFields, Settings, Task, TaskId, TaskKind, Transaction, TransactionId,
    TransactionKind, TransactionStatus, UserId,
};
