use crate::context::OperationContext;
use crate::error::AppError;
use crate::executor::{get_row, lookup, table_def, Bytes, OnConflict, Statement};
use crate::hooks::Hooks;
use crate::projector::{ConflictTarget, KeySpec, RecordProjector};
use crate::record::{decode_row, encode_tuple, NaturalKey, Record, Row};
use crate::schema::TableSchema;
use crate::storage::Store;
use crate::transaction::Transaction;
use chrono::Utc;
use futures::future::BoxFuture;
use redb::{ReadableDatabase, ReadableTable, ReadableTableMetadata, TableError};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};

struct TableInner {
    store: Store,
    schema: Arc<TableSchema>,
    hooks: RwLock<Hooks>,
}

/// Handle of a defined table; clones share schema and hooks.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("name", &self.name()).finish()
    }
}

impl Table {
    pub(crate) fn new(store: Store, schema: Arc<TableSchema>) -> Self {
        Table { inner: Arc::new(TableInner { store, schema, hooks: RwLock::new(Hooks::default()) }) }
    }

    pub fn name(&self) -> &str { self.inner.schema.name() }
    pub fn schema(&self) -> &Arc<TableSchema> { &self.inner.schema }
    pub fn store(&self) -> &Store { &self.inner.store }

    pub fn same_as(&self, other: &Table) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn hooks(&self) -> Result<Hooks, AppError> {
        Ok(self.inner.hooks.read()?.clone())
    }

    pub fn on_before_bulk_upsert<F>(&self, hook: F) -> Result<(), AppError>
    where
        F: for<'a> Fn(&'a OperationContext) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync + 'static,
    {
        self.inner.hooks.write()?.push_before(Arc::new(hook));
        Ok(())
    }

    /// Called once per natural key that already has a row, before the statement merges it.
    pub fn on_before_bulk_upsert_merge<F>(&self, hook: F) -> Result<(), AppError>
    where
        F: for<'a> Fn(&'a OperationContext, &'a NaturalKey) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync + 'static,
    {
        self.inner.hooks.write()?.push_merge(Arc::new(hook));
        Ok(())
    }

    pub fn on_after_bulk_upsert<F>(&self, hook: F) -> Result<(), AppError>
    where
        F: for<'a> Fn(&'a OperationContext) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync + 'static,
    {
        self.inner.hooks.write()?.push_after(Arc::new(hook));
        Ok(())
    }

    /// Inserts one record, failing with a unique violation when its primary key exists.
    /// Hooks are not called.
    pub async fn create(&self, record: Record, tx: Option<&Transaction>) -> Result<Record, AppError> {
        let schema = self.schema();
        let key = KeySpec::resolve(schema, None, &[])?;
        let mut projector = RecordProjector::new(schema.clone(), key.clone(), &[], Utc::now())?;
        let payload = projector.project(record)?;
        let statement = Statement::new(schema, &key, projector.columns(), OnConflict::Reject);
        let payloads = std::slice::from_ref(&payload);
        match tx {
            Some(tx) => {
                tx.write(|w| statement.execute(w, payloads))?;
                self.created(payload.key(), tx)
            }
            None => {
                let tx = self.store().begin().await?;
                let created = tx.write(|w| statement.execute(w, payloads)).and_then(|_| self.created(payload.key(), &tx));
                match created {
                    Ok(record) => {
                        tx.commit().await?;
                        Ok(record)
                    }
                    Err(err) => {
                        tx.rollback().await?;
                        Err(err)
                    }
                }
            }
        }
    }

    fn created(&self, key: &NaturalKey, tx: &Transaction) -> Result<Record, AppError> {
        self.find_by_natural_key(key, tx)?
            .ok_or_else(|| AppError::Custom(format!("row {} of `{}` vanished after insert", key, self.name())))
    }

    /// Row with primary key `pk` (values in primary key order), read through `tx` when given.
    pub fn find(&self, pk: &[Value], tx: Option<&Transaction>) -> Result<Option<Record>, AppError> {
        let key = encode_tuple(pk)?;
        let row = self.read(tx, |rows| rows.get(&key))?.flatten();
        Ok(row.map(|r| self.to_record(r)))
    }

    /// All rows in primary key byte order.
    pub fn find_all(&self, tx: Option<&Transaction>) -> Result<Vec<Record>, AppError> {
        let rows = self.read(tx, |rows| rows.rows())?.unwrap_or_default();
        Ok(rows.into_iter().map(|r| self.to_record(r)).collect())
    }

    pub fn count(&self, tx: Option<&Transaction>) -> Result<u64, AppError> {
        Ok(self.read(tx, |rows| rows.len())?.unwrap_or(0))
    }

    pub(crate) fn find_by_natural_key(&self, key: &NaturalKey, tx: &Transaction) -> Result<Option<Record>, AppError> {
        let schema = self.schema();
        let spec = KeySpec::resolve(schema, Some(key.attributes()), &[])?;
        let bytes = key.encode()?;
        let found = tx.inspect(|w| {
            let rows = w.open_table(table_def(schema.name()))?;
            match spec.target() {
                ConflictTarget::PrimaryKey => lookup(&rows, None, &bytes),
                ConflictTarget::Unique(i) => {
                    let index_name = schema.index_table_name(&schema.unique_keys()[i]);
                    let index = w.open_table(table_def(&index_name))?;
                    lookup(&rows, Some(&index), &bytes)
                }
            }
        })?;
        Ok(found.map(|(_, row)| self.to_record(row)))
    }

    /// Runs `f` over the rows table; `None` when it was never written to.
    fn read<T, F>(&self, tx: Option<&Transaction>, f: F) -> Result<Option<T>, AppError>
    where
        F: Fn(&dyn RowTable) -> Result<T, AppError>,
    {
        match tx {
            Some(tx) => tx.inspect(|w| {
                let rows = w.open_table(table_def(self.name()))?;
                f(&rows).map(Some)
            }),
            None => {
                let read_tx = self.store().db().begin_read()?;
                match read_tx.open_table(table_def(self.name())) {
                    Ok(rows) => f(&rows).map(Some),
                    Err(TableError::TableDoesNotExist(_)) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Maps physical columns back to logical attributes and computes virtual ones.
    pub(crate) fn to_record(&self, mut row: Row) -> Record {
        let schema = self.schema();
        let mut record = Record::new();
        for col in schema.stored_columns() {
            record.insert(col.name().to_string(), row.remove(col.physical()).unwrap_or(Value::Null));
        }
        let computed: Vec<(String, Value)> = schema
            .virtual_columns()
            .filter_map(|col| col.getter.as_ref().map(|getter| (col.name().to_string(), getter(&record))))
            .collect();
        record.extend(computed);
        record
    }
}

/// Object-safe view over read-only and writable redb tables of rows.
pub(crate) trait RowTable {
    fn get(&self, key: &[u8]) -> Result<Option<Row>, AppError>;
    fn rows(&self) -> Result<Vec<Row>, AppError>;
    fn len(&self) -> Result<u64, AppError>;
}

impl<T: ReadableTable<Bytes, Bytes>> RowTable for T {
    fn get(&self, key: &[u8]) -> Result<Option<Row>, AppError> {
        get_row(self, key)
    }

    fn rows(&self) -> Result<Vec<Row>, AppError> {
        let mut rows = Vec::new();
        for entry in self.iter()? {
            let (_, value) = entry?;
            rows.push(decode_row(value.value())?);
        }
        Ok(rows)
    }

    fn len(&self) -> Result<u64, AppError> {
        Ok(ReadableTableMetadata::len(self)?)
    }
}
