use crate::error::AppError;
use crate::record::{NaturalKey, Record};
use crate::table::Table;
use crate::transaction::Transaction;
use std::fmt;

/// Lifecycle of one bulk upsert invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertState {
    Idle,
    Validating,
    Projecting,
    Planning,
    Writing,
    Committed,
    Aborted,
}

impl fmt::Display for UpsertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What hooks see of one statement of a bulk upsert.
pub struct OperationContext {
    pub(crate) table: Table,
    pub(crate) transaction: Transaction,
    pub(crate) owned: bool,
    pub(crate) omit: Vec<String>,
    pub(crate) id_fields: Vec<String>,
    pub(crate) batch_len: usize,
    pub(crate) batch_index: usize,
    pub(crate) merge_keys: Vec<NaturalKey>,
    pub(crate) state: UpsertState,
}

impl OperationContext {
    pub fn table(&self) -> &Table { &self.table }
    pub fn omit(&self) -> &[String] { &self.omit }
    pub fn id_fields(&self) -> &[String] { &self.id_fields }
    pub fn batch_len(&self) -> usize { self.batch_len }
    pub fn batch_index(&self) -> usize { self.batch_index }
    /// Natural keys of this batch that already exist and will be merged.
    pub fn merge_keys(&self) -> &[NaturalKey] { &self.merge_keys }
    pub fn state(&self) -> UpsertState { self.state }

    /// True when the engine began the transaction and commits it.
    pub fn owns_transaction(&self) -> bool { self.owned }
    pub fn transaction_id(&self) -> u64 { self.transaction.id() }
    pub fn is_transaction_active(&self) -> bool { self.transaction.is_active() }

    /// The transaction the caller passed in, if any.
    pub fn caller_transaction(&self) -> Option<&Transaction> {
        if self.owned {
            None
        } else {
            Some(&self.transaction)
        }
    }

    /// Reads the row stored under `key` as this transaction sees it.
    pub fn find(&self, key: &NaturalKey) -> Result<Option<Record>, AppError> {
        self.table.find_by_natural_key(key, &self.transaction)
    }
}
