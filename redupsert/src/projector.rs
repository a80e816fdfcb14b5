use crate::error::AppError;
use crate::record::{NaturalKey, Record};
use crate::schema::{ColumnDef, TableSchema};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Which store constraint an upsert resolves its conflicts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictTarget {
    PrimaryKey,
    Unique(usize),
}

/// The natural key of one invocation, resolved against the schema.
#[derive(Debug, Clone)]
pub struct KeySpec {
    pub(crate) target: ConflictTarget,
    /// Logical attributes in the order of the matching constraint.
    pub(crate) attributes: Vec<String>,
}

impl KeySpec {
    pub fn resolve(schema: &TableSchema, id_fields: Option<&[String]>, omit: &[String]) -> Result<Self, AppError> {
        let requested: Vec<String> = match id_fields {
            Some(fields) => fields.to_vec(),
            None => schema.primary_key().columns().to_vec(),
        };
        if requested.is_empty() {
            return Err(AppError::InvalidInput("natural key needs at least one attribute".to_string()));
        }
        for attribute in &requested {
            schema.stored_column(attribute)?;
            if omit.contains(attribute) {
                return Err(AppError::InvalidInput(format!("natural key attribute `{}` cannot be omitted", attribute)));
            }
        }
        if schema.primary_key().matches(&requested) {
            return Ok(KeySpec { target: ConflictTarget::PrimaryKey, attributes: schema.primary_key().columns().to_vec() });
        }
        match schema.unique_keys().iter().position(|k| k.matches(&requested)) {
            Some(i) => Ok(KeySpec { target: ConflictTarget::Unique(i), attributes: schema.unique_keys()[i].columns().to_vec() }),
            None => Err(AppError::InvalidInput(format!(
                "no primary or unique key of `{}` matches natural key ({})",
                schema.name(),
                requested.join(", ")
            ))),
        }
    }

    pub fn target(&self) -> ConflictTarget { self.target }
    pub fn attributes(&self) -> &[String] { &self.attributes }
}

/// Stored columns written by one invocation: all non-virtual, non-omitted columns, in schema order.
#[derive(Debug, Clone)]
pub struct ColumnSet {
    columns: Vec<ColumnDef>,
    by_logical: HashMap<String, usize>,
}

impl ColumnSet {
    pub(crate) fn new(schema: &TableSchema, omit: &HashSet<String>) -> Self {
        let columns: Vec<ColumnDef> = schema.stored_columns().filter(|c| !omit.contains(c.name())).cloned().collect();
        let by_logical = columns.iter().enumerate().map(|(i, c)| (c.name().to_string(), i)).collect();
        Self { columns, by_logical }
    }

    pub fn len(&self) -> usize { self.columns.len() }
    pub fn is_empty(&self) -> bool { self.columns.is_empty() }
    pub fn columns(&self) -> &[ColumnDef] { &self.columns }
    pub fn position(&self, logical: &str) -> Option<usize> { self.by_logical.get(logical).copied() }
}

/// A projected record: one value per column of the invocation's `ColumnSet`.
#[derive(Debug, Clone)]
pub struct Payload {
    pub(crate) key: NaturalKey,
    pub(crate) values: Vec<Value>,
}

impl Payload {
    pub fn key(&self) -> &NaturalKey { &self.key }
    pub fn values(&self) -> &[Value] { &self.values }
}

pub struct RecordProjector {
    schema: Arc<TableSchema>,
    key: KeySpec,
    columns: ColumnSet,
    key_positions: Vec<usize>,
    omit: HashSet<String>,
    now: String,
    projected: usize,
}

impl RecordProjector {
    pub fn new(schema: Arc<TableSchema>, key: KeySpec, omit: &[String], now: DateTime<Utc>) -> Result<Self, AppError> {
        let omit: HashSet<String> = omit.iter().cloned().collect();
        let columns = ColumnSet::new(&schema, &omit);
        let key_positions = key
            .attributes
            .iter()
            .map(|a| columns.position(a).ok_or_else(|| AppError::schema(schema.name(), format!("natural key attribute `{}` has no column", a))))
            .collect::<Result<Vec<usize>, AppError>>()?;
        Ok(Self {
            schema,
            key,
            columns,
            key_positions,
            omit,
            now: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            projected: 0,
        })
    }

    pub fn columns(&self) -> &ColumnSet { &self.columns }
    pub fn key(&self) -> &KeySpec { &self.key }

    pub fn project(&mut self, record: Record) -> Result<Payload, AppError> {
        let index = self.projected;
        self.projected += 1;

        let mut slots: Vec<Option<Value>> = vec![None; self.columns.len()];
        for (attribute, value) in record {
            match self.schema.column(&attribute) {
                Some(col) if col.is_virtual() => continue,
                _ if self.omit.contains(&attribute) => continue,
                Some(_) => match self.columns.position(&attribute) {
                    Some(i) => slots[i] = Some(value),
                    None => return Err(AppError::schema(self.schema.name(), format!("attribute `{}` has no column", attribute))),
                },
                None => return Err(AppError::schema(self.schema.name(), format!("attribute `{}` has no column", attribute))),
            }
        }

        let mut key_values = Vec::with_capacity(self.key_positions.len());
        for (attribute, &i) in self.key.attributes.iter().zip(&self.key_positions) {
            match &slots[i] {
                Some(v) if !v.is_null() => key_values.push(v.clone()),
                _ => {
                    return Err(AppError::MissingKey {
                        table: self.schema.name().to_string(),
                        attribute: attribute.clone(),
                        index,
                    })
                }
            }
        }

        let values = slots
            .into_iter()
            .zip(self.columns.columns())
            .map(|(slot, col)| match slot {
                Some(Value::Null) | None if col.timestamp_role().is_some() => Value::String(self.now.clone()),
                Some(v) => v,
                None => col.default().cloned().unwrap_or(Value::Null),
            })
            .collect();

        Ok(Payload { key: NaturalKey::new(self.key.attributes.clone(), key_values), values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, MergePolicy};
    use serde_json::json;

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::builder("foo")
                .column(ColumnDef::new("id", ColumnType::Text).primary_key())
                .column(ColumnDef::new("name", ColumnType::Text).default_value(json!("unnamed")))
                .column(ColumnDef::new("data", ColumnType::Text).field("my_data_field"))
                .column(ColumnDef::new("deepMerge", ColumnType::Json).merge(MergePolicy::DeepMerge))
                .column(ColumnDef::new("_changes", ColumnType::Json))
                .column(ColumnDef::computed("upper", |r| json!(r["id"].as_str().map(|s| s.to_uppercase()))))
                .unique(&["name", "data"])
                .timestamps()
                .build()
                .unwrap(),
        )
    }

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn projector(id_fields: Option<&[String]>) -> RecordProjector {
        let schema = schema();
        let omit = vec!["_changes".to_string()];
        let key = KeySpec::resolve(&schema, id_fields, &omit).unwrap();
        RecordProjector::new(schema, key, &omit, now()).unwrap()
    }

    fn value_of<'a>(p: &'a RecordProjector, payload: &'a Payload, logical: &str) -> &'a Value {
        &payload.values()[p.columns().position(logical).unwrap()]
    }

    #[test]
    fn drops_virtual_and_omitted_attributes() {
        let mut p = projector(None);
        let payload = p.project(record(json!({"id": "a", "upper": 1, "_changes": {"x": 1}, "data": "d"}))).unwrap();
        assert!(p.columns().position("_changes").is_none());
        assert!(p.columns().position("upper").is_none());
        assert_eq!(payload.values().len(), p.columns().len());
        assert_eq!(value_of(&p, &payload, "data"), &json!("d"));
        assert_eq!(p.columns().columns()[p.columns().position("data").unwrap()].physical(), "my_data_field");
    }

    #[test]
    fn fills_defaults_nulls_and_timestamps() {
        let mut p = projector(None);
        let payload = p.project(record(json!({"id": "a", "updatedAt": "2020-01-01T00:00:00.000Z"}))).unwrap();
        assert_eq!(value_of(&p, &payload, "name"), &json!("unnamed"));
        assert_eq!(value_of(&p, &payload, "deepMerge"), &Value::Null);
        assert_eq!(value_of(&p, &payload, "createdAt"), &json!("2024-05-01T10:00:00.000Z"));
        assert_eq!(value_of(&p, &payload, "updatedAt"), &json!("2020-01-01T00:00:00.000Z"));
    }

    #[test]
    fn null_timestamps_are_filled_in() {
        let mut p = projector(None);
        let payload = p.project(record(json!({"id": "a", "createdAt": null, "updatedAt": null}))).unwrap();
        assert_eq!(value_of(&p, &payload, "createdAt"), &json!("2024-05-01T10:00:00.000Z"));
        assert_eq!(value_of(&p, &payload, "updatedAt"), &json!("2024-05-01T10:00:00.000Z"));
    }

    #[test]
    fn unknown_attributes_are_schema_mismatches() {
        let mut p = projector(None);
        let err = p.project(record(json!({"id": "a", "nope": true}))).unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch { .. }));
    }

    #[test]
    fn missing_or_null_keys_fail_with_position() {
        let mut p = projector(None);
        p.project(record(json!({"id": "a"}))).unwrap();
        let err = p.project(record(json!({"id": null}))).unwrap_err();
        match err {
            AppError::MissingKey { attribute, index, .. } => {
                assert_eq!(attribute, "id");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn resolves_unique_key_targets_in_declared_order() {
        let fields = vec!["data".to_string(), "name".to_string()];
        let mut p = projector(Some(fields.as_slice()));
        assert_eq!(p.key().target(), ConflictTarget::Unique(0));
        let payload = p.project(record(json!({"id": "a", "name": "n", "data": "d"}))).unwrap();
        assert_eq!(payload.key().values(), &[json!("n"), json!("d")]);
    }

    #[test]
    fn rejects_unusable_natural_keys() {
        let schema = schema();
        let unknown = KeySpec::resolve(&schema, Some(&["ghost".to_string()][..]), &[]);
        assert!(matches!(unknown, Err(AppError::SchemaMismatch { .. })));
        let unconstrained = KeySpec::resolve(&schema, Some(&["name".to_string()][..]), &[]);
        assert!(matches!(unconstrained, Err(AppError::InvalidInput(_))));
        let omitted = KeySpec::resolve(&schema, None, &["id".to_string()]);
        assert!(matches!(omitted, Err(AppError::InvalidInput(_))));
        let virtual_key = KeySpec::resolve(&schema, Some(&["upper".to_string()][..]), &[]);
        assert!(matches!(virtual_key, Err(AppError::SchemaMismatch { .. })));
    }
}
