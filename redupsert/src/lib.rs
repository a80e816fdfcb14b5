//! redupsert writes unbounded, possibly asynchronous sequences of heterogeneous records into
//! relational tables kept in [Redb](https://github.com/cberner/redb), inserting new rows and
//! merging existing ones per column policy (overwrite, deep merge, immutable) in one atomic,
//! order-preserving statement.
//!
//! Records are JSON objects keyed by logical attribute names. A `TableSchema` maps them to physical
//! columns, declares keys, constraints and merge policies, and `Store::define` turns it into a
//! `Table` whose `bulk_upsert` / `bulk_upsert_stream` drive the whole pipeline:
//! input normalization, projection, merge planning, batching and execution, with lifecycle hooks
//! around each statement.
//!

pub mod collector;
pub mod context;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod input;
pub mod logger;
pub mod options;
pub mod planner;
pub mod projector;
pub mod record;
pub mod schema;
pub mod settings;
pub mod storage;
pub mod table;
pub mod transaction;
mod upsert;

pub use chrono;
pub use futures;
pub use futures::future::{BoxFuture, FutureExt};
pub use redb;
pub use redb::Durability;
pub use serde_json;
pub use serde_json::json;

pub use collector::BatchPolicy;
pub use context::{OperationContext, UpsertState};
pub use error::{AppError, Constraint, SourceError};
pub use executor::StatementOutcome;
pub use input::{record_channel, RecordSink, RecordStream, UpsertInput};
pub use options::{UpsertOptions, WriteOptions};
pub use planner::{deep_merge, ConflictRule, MergePlan};
pub use projector::{ConflictTarget, KeySpec};
pub use record::{NaturalKey, Record, Row};
pub use schema::{ColumnDef, ColumnType, MergePolicy, TableSchema, TimestampRole, UniqueKey};
pub use settings::{AppConfig, LogSettings, StoreSettings};
pub use storage::Store;
pub use table::Table;
pub use transaction::Transaction;
