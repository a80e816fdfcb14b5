//! One set-based upsert statement over the redb tables of a relational table.
//!
//! Rows live in a table named after the relational table, keyed by the encoded primary key.
//! Every unique key has an index table `<table>#<columns>` mapping the encoded unique tuple
//! to the primary key of its row.
//!
//! A statement first resolves and validates every row without mutating anything, then writes
//! all of them, so a rejected statement leaves the transaction as it found it.

use crate::error::{AppError, Constraint};
use crate::planner::MergePlan;
use crate::projector::{ColumnSet, ConflictTarget, KeySpec, Payload};
use crate::record::{decode_row, encode_row, encode_tuple, NaturalKey, Row};
use crate::schema::{type_of, TableSchema, UniqueKey};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub(crate) type Bytes = &'static [u8];

pub(crate) fn table_def(name: &str) -> TableDefinition<'_, Bytes, Bytes> {
    TableDefinition::new(name)
}

pub(crate) fn get_row<T: ReadableTable<Bytes, Bytes>>(table: &T, key: &[u8]) -> Result<Option<Row>, AppError> {
    match table.get(key)? {
        Some(guard) => Ok(Some(decode_row(guard.value())?)),
        None => Ok(None),
    }
}

fn get_bytes<T: ReadableTable<Bytes, Bytes>>(table: &T, key: &[u8]) -> Result<Option<Vec<u8>>, AppError> {
    Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
}

/// Finds the stored row a natural key points at, with its primary key bytes.
pub(crate) fn lookup<T: ReadableTable<Bytes, Bytes>>(
    rows: &T,
    index: Option<&T>,
    key: &[u8],
) -> Result<Option<(Vec<u8>, Row)>, AppError> {
    let pk = match index {
        None => key.to_vec(),
        Some(index) => match get_bytes(index, key)? {
            Some(pk) => pk,
            None => return Ok(None),
        },
    };
    Ok(get_row(rows, &pk)?.map(|row| (pk, row)))
}

/// Encodes the values of `key` taken from a physical row; `None` when any of them is null.
pub(crate) fn unique_tuple(schema: &TableSchema, key: &UniqueKey, row: &Row) -> Result<Option<Vec<u8>>, AppError> {
    let mut values = Vec::with_capacity(key.columns().len());
    for logical in key.columns() {
        let col = schema.stored_column(logical)?;
        match row.get(col.physical()) {
            None | Some(Value::Null) => return Ok(None),
            Some(v) => values.push(v.clone()),
        }
    }
    Ok(Some(encode_tuple(&values)?))
}

/// How rows whose natural key already exists are handled.
#[derive(Clone, Copy)]
pub(crate) enum OnConflict<'p> {
    Merge(&'p MergePlan),
    Reject,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatementOutcome {
    pub inserted: usize,
    pub merged: usize,
}

struct PreparedRow {
    pk: Vec<u8>,
    row: Row,
    previous: Option<Row>,
}

struct Handles<'txn> {
    rows: redb::Table<'txn, Bytes, Bytes>,
    indexes: Vec<redb::Table<'txn, Bytes, Bytes>>,
}

pub(crate) struct Statement<'a> {
    schema: &'a TableSchema,
    key: &'a KeySpec,
    columns: &'a ColumnSet,
    on_conflict: OnConflict<'a>,
}

impl<'a> Statement<'a> {
    pub(crate) fn new(schema: &'a TableSchema, key: &'a KeySpec, columns: &'a ColumnSet, on_conflict: OnConflict<'a>) -> Self {
        Statement { schema, key, columns, on_conflict }
    }

    pub(crate) fn key_attributes(&self) -> &[String] { self.key.attributes() }

    fn open<'txn>(&self, tx: &'txn WriteTransaction) -> Result<Handles<'txn>, AppError> {
        let rows = tx.open_table(table_def(self.schema.name()))?;
        let mut indexes = Vec::with_capacity(self.schema.unique_keys().len());
        for key in self.schema.unique_keys() {
            let name = self.schema.index_table_name(key);
            indexes.push(tx.open_table(table_def(&name))?);
        }
        Ok(Handles { rows, indexes })
    }

    fn target_index<'h, 'txn>(&self, handles: &'h Handles<'txn>) -> Option<&'h redb::Table<'txn, Bytes, Bytes>> {
        match self.key.target() {
            ConflictTarget::PrimaryKey => None,
            ConflictTarget::Unique(i) => Some(&handles.indexes[i]),
        }
    }

    /// Distinct natural keys of `payloads` that already have a row, in arrival order.
    pub(crate) fn probe(&self, tx: &WriteTransaction, payloads: &[Payload]) -> Result<Vec<NaturalKey>, AppError> {
        let handles = self.open(tx)?;
        let index = self.target_index(&handles);
        let mut seen = HashSet::new();
        let mut existing = Vec::new();
        for payload in payloads {
            let key = payload.key().encode()?;
            if !seen.insert(key.clone()) {
                continue;
            }
            if lookup(&handles.rows, index, &key)?.is_some() {
                existing.push(payload.key().clone());
            }
        }
        Ok(existing)
    }

    pub(crate) fn execute(&self, tx: &WriteTransaction, payloads: &[Payload]) -> Result<StatementOutcome, AppError> {
        let mut handles = self.open(tx)?;
        let prepared = self.prepare(tx, &handles, payloads)?;
        self.apply(&mut handles, prepared)
    }

    fn violation(&self, constraint: Constraint) -> AppError {
        AppError::violation(self.schema.name(), constraint)
    }

    fn fresh_row(&self, payload: &Payload) -> Row {
        let mut row = Row::new();
        for col in self.schema.stored_columns() {
            row.insert(col.physical().to_string(), col.default().cloned().unwrap_or(Value::Null));
        }
        for (col, value) in self.columns.columns().iter().zip(payload.values()) {
            row.insert(col.physical().to_string(), value.clone());
        }
        row
    }

    fn primary_key_of(&self, row: &Row) -> Result<Vec<u8>, AppError> {
        let mut values = Vec::with_capacity(self.schema.primary_key().columns().len());
        for logical in self.schema.primary_key().columns() {
            let physical = self.schema.stored_column(logical)?.physical();
            match row.get(physical) {
                None | Some(Value::Null) => return Err(self.violation(Constraint::NotNull { column: physical.to_string() })),
                Some(v) => values.push(v.clone()),
            }
        }
        encode_tuple(&values)
    }

    fn check_columns(&self, row: &Row) -> Result<(), AppError> {
        for col in self.schema.stored_columns() {
            let value = row.get(col.physical()).unwrap_or(&Value::Null);
            if value.is_null() {
                if !col.is_nullable() {
                    return Err(self.violation(Constraint::NotNull { column: col.physical().to_string() }));
                }
            } else if !col.column_type().accepts(value) {
                return Err(AppError::TypeMismatch {
                    table: self.schema.name().to_string(),
                    column: col.name().to_string(),
                    expected: col.column_type().to_string(),
                    found: type_of(value).to_string(),
                });
            }
        }
        Ok(())
    }

    fn prepare(&self, tx: &WriteTransaction, handles: &Handles<'_>, payloads: &[Payload]) -> Result<Vec<PreparedRow>, AppError> {
        let index = self.target_index(handles);
        let mut claimed_keys: HashSet<Vec<u8>> = HashSet::with_capacity(payloads.len());
        let mut claimed_pks: HashSet<Vec<u8>> = HashSet::with_capacity(payloads.len());
        let mut claimed_tuples: Vec<HashMap<Vec<u8>, Vec<u8>>> = vec![HashMap::new(); self.schema.unique_keys().len()];
        let mut prepared = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let key = payload.key().encode()?;
            if !claimed_keys.insert(key.clone()) {
                return Err(self.violation(Constraint::DuplicateConflictTarget { key: payload.key().to_string() }));
            }

            let (pk, row, previous) = match lookup(&handles.rows, index, &key)? {
                Some((pk, stored)) => match self.on_conflict {
                    OnConflict::Merge(plan) => (pk, plan.apply(stored.clone(), payload.values()), Some(stored)),
                    OnConflict::Reject => {
                        let constraint = match self.key.target() {
                            ConflictTarget::PrimaryKey => format!("{}_pkey", self.schema.name()),
                            ConflictTarget::Unique(i) => self.schema.index_table_name(&self.schema.unique_keys()[i]),
                        };
                        return Err(self.violation(Constraint::Unique { constraint, key: payload.key().to_string() }));
                    }
                },
                None => {
                    let row = self.fresh_row(payload);
                    let pk = self.primary_key_of(&row)?;
                    if get_bytes(&handles.rows, &pk)?.is_some() {
                        return Err(self.violation(Constraint::Unique {
                            constraint: format!("{}_pkey", self.schema.name()),
                            key: payload.key().to_string(),
                        }));
                    }
                    (pk, row, None)
                }
            };

            if !claimed_pks.insert(pk.clone()) {
                return Err(self.violation(Constraint::DuplicateConflictTarget { key: payload.key().to_string() }));
            }
            self.check_columns(&row)?;

            for (i, unique) in self.schema.unique_keys().iter().enumerate() {
                let Some(tuple) = unique_tuple(self.schema, unique, &row)? else { continue };
                let taken_by_stored = match get_bytes(&handles.indexes[i], &tuple)? {
                    Some(owner) => owner != pk,
                    None => false,
                };
                let taken_in_statement = claimed_tuples[i].get(&tuple).is_some_and(|owner| owner != &pk);
                if taken_by_stored || taken_in_statement {
                    return Err(self.violation(Constraint::Unique {
                        constraint: self.schema.index_table_name(unique),
                        key: String::from_utf8_lossy(&tuple).into_owned(),
                    }));
                }
                claimed_tuples[i].insert(tuple, pk.clone());
            }

            prepared.push(PreparedRow { pk, row, previous });
        }

        self.check_references(tx, handles, &claimed_pks, &prepared)?;
        Ok(prepared)
    }

    /// Every non-null foreign key must name a primary key stored in, or written by, this transaction.
    fn check_references(
        &self,
        tx: &WriteTransaction,
        handles: &Handles<'_>,
        claimed_pks: &HashSet<Vec<u8>>,
        prepared: &[PreparedRow],
    ) -> Result<(), AppError> {
        let foreign_keys: Vec<_> = self.schema.foreign_keys().collect();
        if foreign_keys.is_empty() {
            return Ok(());
        }
        let mut targets = HashMap::new();
        for (_, target) in &foreign_keys {
            if *target != self.schema.name() && !targets.contains_key(*target) {
                targets.insert(*target, tx.open_table(table_def(target))?);
            }
        }
        for prepared_row in prepared {
            for (col, target) in &foreign_keys {
                let value = match prepared_row.row.get(col.physical()) {
                    None | Some(Value::Null) => continue,
                    Some(v) => v,
                };
                let referenced = encode_tuple(std::slice::from_ref(value))?;
                let exists = match targets.get(*target) {
                    Some(table) => get_bytes(table, &referenced)?.is_some(),
                    None => claimed_pks.contains(&referenced) || get_bytes(&handles.rows, &referenced)?.is_some(),
                };
                if !exists {
                    return Err(self.violation(Constraint::ForeignKey {
                        column: col.physical().to_string(),
                        references: target.to_string(),
                        value: value.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    fn apply(&self, handles: &mut Handles<'_>, prepared: Vec<PreparedRow>) -> Result<StatementOutcome, AppError> {
        let mut outcome = StatementOutcome::default();
        for PreparedRow { pk, row, previous } in prepared {
            for (i, unique) in self.schema.unique_keys().iter().enumerate() {
                let tuple = unique_tuple(self.schema, unique, &row)?;
                if let Some(old) = previous.as_ref().map(|p| unique_tuple(self.schema, unique, p)).transpose()?.flatten() {
                    if tuple.as_ref() != Some(&old) {
                        handles.indexes[i].remove(old.as_slice())?;
                    }
                }
                if let Some(tuple) = tuple {
                    handles.indexes[i].insert(tuple.as_slice(), pk.as_slice())?;
                }
            }
            let encoded = encode_row(&row)?;
            handles.rows.insert(pk.as_slice(), encoded.as_slice())?;
            if previous.is_some() {
                outcome.merged += 1;
            } else {
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projector::RecordProjector;
    use crate::schema::{ColumnDef, ColumnType};
    use crate::test_utils;
    use chrono::Utc;
    use redb::ReadableTableMetadata;
    use serde_json::json;
    use std::sync::Arc;

    fn users() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::builder("users")
                .column(ColumnDef::new("id", ColumnType::Integer).primary_key())
                .column(ColumnDef::new("email", ColumnType::Text))
                .column(ColumnDef::new("nick", ColumnType::Text).not_null())
                .unique(&["email"])
                .build()
                .unwrap(),
        )
    }

    fn payloads(schema: &Arc<TableSchema>, key: &KeySpec, records: Vec<Value>) -> (RecordProjector, Vec<Payload>) {
        let mut projector = RecordProjector::new(schema.clone(), key.clone(), &[], Utc::now()).unwrap();
        let payloads = records.into_iter().map(|r| projector.project(r.as_object().cloned().unwrap()).unwrap()).collect();
        (projector, payloads)
    }

    #[tokio::test]
    async fn unique_key_target_merges_through_index() {
        let store = test_utils::temp_store("exec_unique");
        let schema = users();
        let by_email = KeySpec::resolve(&schema, Some(&["email".to_string()][..]), &[]).unwrap();
        let (projector, first) = payloads(&schema, &by_email, vec![json!({"id": 1, "email": "a@x", "nick": "a"})]);
        let plan = MergePlan::new(&schema, &by_email, projector.columns());
        let statement = Statement::new(&schema, &by_email, projector.columns(), OnConflict::Merge(&plan));

        let tx = store.begin().await.unwrap();
        let outcome = tx.write(|w| statement.execute(w, &first)).unwrap();
        assert_eq!(outcome, StatementOutcome { inserted: 1, merged: 0 });

        let (_, second) = payloads(&schema, &by_email, vec![json!({"id": 2, "email": "a@x", "nick": "b"})]);
        assert_eq!(tx.inspect(|w| statement.probe(w, &second)).unwrap().len(), 1);
        let outcome = tx.write(|w| statement.execute(w, &second)).unwrap();
        assert_eq!(outcome, StatementOutcome { inserted: 0, merged: 1 });

        let row = tx
            .inspect(|w| {
                let rows = w.open_table(table_def("users"))?;
                get_row(&rows, &encode_tuple(&[json!(1)])?)
            })
            .unwrap()
            .unwrap();
        assert_eq!(row["nick"], json!("b"));
        assert_eq!(row["id"], json!(1));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_statement_writes_nothing() {
        let store = test_utils::temp_store("exec_reject");
        let schema = users();
        let by_id = KeySpec::resolve(&schema, None, &[]).unwrap();
        let (projector, rows) = payloads(
            &schema,
            &by_id,
            vec![json!({"id": 1, "email": "a@x", "nick": "a"}), json!({"id": 2, "email": "a@x", "nick": "b"})],
        );
        let plan = MergePlan::new(&schema, &by_id, projector.columns());
        let statement = Statement::new(&schema, &by_id, projector.columns(), OnConflict::Merge(&plan));

        let tx = store.begin().await.unwrap();
        let err = tx.write(|w| statement.execute(w, &rows)).unwrap_err();
        match err {
            AppError::ConstraintViolation { constraint: Constraint::Unique { constraint, .. }, .. } => assert_eq!(constraint, "users#email"),
            other => panic!("unexpected {:?}", other),
        }
        tx.rollback().await.unwrap();

        let tx = store.begin().await.unwrap();
        let count = tx.inspect(|w| Ok(w.open_table(table_def("users"))?.len()?)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn not_null_and_types_are_checked() {
        let store = test_utils::temp_store("exec_checks");
        let schema = users();
        let by_id = KeySpec::resolve(&schema, None, &[]).unwrap();
        let (projector, missing_nick) = payloads(&schema, &by_id, vec![json!({"id": 1})]);
        let statement = Statement::new(&schema, &by_id, projector.columns(), OnConflict::Reject);

        let tx = store.begin().await.unwrap();
        let err = tx.inspect(|w| statement.execute(w, &missing_nick)).unwrap_err();
        assert!(matches!(err, AppError::ConstraintViolation { constraint: Constraint::NotNull { .. }, .. }));

        let (_, wrong_type) = payloads(&schema, &by_id, vec![json!({"id": 1, "nick": 7})]);
        let err = tx.inspect(|w| statement.execute(w, &wrong_type)).unwrap_err();
        assert!(matches!(err, AppError::TypeMismatch { .. }));
    }
}
