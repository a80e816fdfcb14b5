use crate::error::AppError;
use crate::debug;
use redb::WriteTransaction;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

pub(crate) enum TxState {
    Active(WriteTransaction),
    /// A statement failed inside it; nothing more may be written or committed.
    /// The writer stays held until the owner rolls back or drops the handle.
    Aborted { tx: Option<WriteTransaction>, reason: String },
    Committed,
    RolledBack,
}

impl TxState {
    fn label(&self) -> &'static str {
        match self {
            TxState::Active(_) => "active",
            TxState::Aborted { .. } => "aborted",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        }
    }
}

struct TxInner {
    id: u64,
    state: Mutex<TxState>,
}

/// Handle to one redb write transaction. Clones share the transaction.
///
/// Dropping the last handle of an uncommitted transaction aborts it.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().map(|s| s.label()).unwrap_or("poisoned");
        f.debug_struct("Transaction").field("id", &self.inner.id).field("state", &state).finish()
    }
}

impl Transaction {
    pub(crate) fn new(id: u64, tx: WriteTransaction) -> Self {
        Transaction { inner: Arc::new(TxInner { id, state: Mutex::new(TxState::Active(tx)) }) }
    }

    pub fn id(&self) -> u64 { self.inner.id }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().map(|s| matches!(*s, TxState::Active(_))).unwrap_or(false)
    }

    pub fn same_as(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn inactive(&self, state: &TxState) -> AppError {
        let reason = match state {
            TxState::Aborted { reason, .. } => format!("aborted: {}", reason),
            other => other.label().to_string(),
        };
        AppError::TransactionInactive { id: self.inner.id, reason }
    }

    /// Runs a mutation. A failure leaves the transaction aborted.
    pub(crate) fn write<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&WriteTransaction) -> Result<T, AppError>,
    {
        let mut guard = self.inner.state.lock()?;
        let result = match &*guard {
            TxState::Active(tx) => f(tx),
            other => return Err(self.inactive(other)),
        };
        if let Err(err) = &result {
            Self::abort_locked(self.inner.id, &mut guard, err.to_string());
        }
        result
    }

    /// Runs a read against the uncommitted state without affecting the transaction on failure.
    pub(crate) fn inspect<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&WriteTransaction) -> Result<T, AppError>,
    {
        let guard = self.inner.state.lock()?;
        match &*guard {
            TxState::Active(tx) => f(tx),
            other => Err(self.inactive(other)),
        }
    }

    /// Marks the transaction aborted. It keeps its writes until rolled back.
    pub(crate) fn poison(&self, reason: impl Into<String>) -> Result<(), AppError> {
        let mut guard = self.inner.state.lock()?;
        if matches!(*guard, TxState::Active(_)) {
            Self::abort_locked(self.inner.id, &mut guard, reason.into());
        }
        Ok(())
    }

    fn abort_locked(id: u64, state: &mut TxState, reason: String) {
        debug!("transaction {} aborted: {}", id, reason);
        if let TxState::Active(tx) = mem::replace(state, TxState::RolledBack) {
            *state = TxState::Aborted { tx: Some(tx), reason };
        }
    }

    pub async fn commit(&self) -> Result<(), AppError> {
        let tx = {
            let mut guard = self.inner.state.lock()?;
            match mem::replace(&mut *guard, TxState::Committed) {
                TxState::Active(tx) => tx,
                other => {
                    let err = self.inactive(&other);
                    *guard = other;
                    return Err(err);
                }
            }
        };
        let result = tokio::task::spawn_blocking(move || tx.commit()).await?;
        if let Err(e) = result {
            *self.inner.state.lock()? = TxState::Aborted { tx: None, reason: format!("commit failed: {}", e) };
            return Err(e.into());
        }
        debug!("transaction {} committed", self.inner.id);
        Ok(())
    }

    /// Rolls back. An aborted transaction rolls back without error.
    pub async fn rollback(&self) -> Result<(), AppError> {
        let tx = {
            let mut guard = self.inner.state.lock()?;
            match mem::replace(&mut *guard, TxState::RolledBack) {
                TxState::Active(tx) | TxState::Aborted { tx: Some(tx), .. } => tx,
                TxState::Aborted { tx: None, .. } => return Ok(()),
                other => {
                    let err = self.inactive(&other);
                    *guard = other;
                    return Err(err);
                }
            }
        };
        tokio::task::spawn_blocking(move || tx.abort()).await??;
        debug!("transaction {} rolled back", self.inner.id);
        Ok(())
    }
}
