use std::fmt;
use std::sync::PoisonError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error raised by a record source while it is being consumed.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Schema mismatch on `{table}`: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("Record #{index} for `{table}` has no value for natural key attribute `{attribute}`")]
    MissingKey { table: String, attribute: String, index: usize },

    #[error("Constraint violation on `{table}`: {constraint}")]
    ConstraintViolation { table: String, constraint: Constraint },

    #[error("Type mismatch on `{table}.{column}`: expected {expected}, found {found}")]
    TypeMismatch { table: String, column: String, expected: String, found: String },

    #[error("Record source failed: {0}")]
    StreamSource(#[source] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] redb::Error),

    #[error("Transaction {id} is not active: {reason}")]
    TransactionInactive { id: u64, reason: String },

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Join: {0}")]
    JoinError(#[from] JoinError),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn schema(table: &str, reason: impl Into<String>) -> Self {
        AppError::SchemaMismatch { table: table.to_string(), reason: reason.into() }
    }

    pub fn violation(table: &str, constraint: Constraint) -> Self {
        AppError::ConstraintViolation { table: table.to_string(), constraint }
    }
}

/// The store-side rule a rejected write broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    NotNull { column: String },
    Unique { constraint: String, key: String },
    DuplicateConflictTarget { key: String },
    ForeignKey { column: String, references: String, value: String },
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::NotNull { column } => write!(f, "null value in column `{}`", column),
            Constraint::Unique { constraint, key } => write!(f, "duplicate key {} violates unique constraint `{}`", key, constraint),
            Constraint::DuplicateConflictTarget { key } => write!(f, "statement cannot affect row with natural key {} a second time", key),
            Constraint::ForeignKey { column, references, value } => {
                write!(f, "value {} of column `{}` is not present in `{}`", value, column, references)
            }
        }
    }
}

macro_rules! impl_from_redb {
    ($($t:ty),*) => {
        $(
            impl From<$t> for AppError {
                fn from(e: $t) -> Self {
                    AppError::Store(redb::Error::from(e))
                }
            }
        )*
    };
}

impl_from_redb!(redb::DatabaseError, redb::TransactionError, redb::TableError, redb::StorageError, redb::CommitError);

impl<T> From<PoisonError<T>> for AppError
{
    fn from(e: PoisonError<T>) -> Self {
        AppError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_messages_name_the_rule() {
        let err = AppError::violation("foo", Constraint::DuplicateConflictTarget { key: "[\"foo\"]".to_string() });
        assert_eq!(err.to_string(), "Constraint violation on `foo`: statement cannot affect row with natural key [\"foo\"] a second time");

        let err = AppError::violation("bar", Constraint::NotNull { column: "birthday".to_string() });
        assert!(err.to_string().ends_with("null value in column `birthday`"));
    }

    #[test]
    fn redb_errors_are_store_errors() {
        let err: AppError = redb::StorageError::Corrupted("bad page".to_string()).into();
        assert!(matches!(err, AppError::Store(_)));
    }
}
