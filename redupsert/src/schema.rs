//! Table descriptions consumed by the upsert engine: logical attributes, physical columns,
//! keys, merge policies and the constraints the store enforces on write.

use crate::error::AppError;
use crate::record::Record;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// What happens to a stored column value when an upsert hits an existing natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Overwrite,
    DeepMerge,
    Immutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampRole {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Json,
    Timestamp,
    Any,
}

impl ColumnType {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Any, _) | (ColumnType::Json, _) => true,
            (ColumnType::Text, Value::String(_)) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Timestamp, Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Json => "json",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Any => "any",
        };
        f.write_str(name)
    }
}

pub(crate) fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub type Getter = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct ColumnDef {
    pub(crate) name: String,
    pub(crate) field: Option<String>,
    pub(crate) ty: ColumnType,
    pub(crate) policy: MergePolicy,
    pub(crate) nullable: bool,
    pub(crate) default: Option<Value>,
    pub(crate) timestamp: Option<TimestampRole>,
    pub(crate) references: Option<String>,
    pub(crate) primary_key: bool,
    pub(crate) is_virtual: bool,
    pub(crate) getter: Option<Getter>,
}

impl fmt::Debug for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnDef")
            .field("name", &self.name)
            .field("field", &self.physical())
            .field("ty", &self.ty)
            .field("policy", &self.policy)
            .field("virtual", &self.is_virtual)
            .finish()
    }
}

impl ColumnDef {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            field: None,
            ty,
            policy: MergePolicy::Overwrite,
            nullable: true,
            default: None,
            timestamp: None,
            references: None,
            primary_key: false,
            is_virtual: false,
            getter: None,
        }
    }

    /// A computed attribute: never stored, produced by `getter` when rows are read back.
    pub fn computed<F>(name: &str, getter: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        let mut col = Self::new(name, ColumnType::Any);
        col.is_virtual = true;
        col.getter = Some(Arc::new(getter));
        col
    }

    /// A virtual attribute without a getter; values for it are accepted and dropped.
    pub fn virtual_attr(name: &str) -> Self {
        let mut col = Self::new(name, ColumnType::Any);
        col.is_virtual = true;
        col
    }

    pub fn field(mut self, physical: &str) -> Self {
        self.field = Some(physical.to_string());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn merge(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn references(mut self, table: &str) -> Self {
        self.references = Some(table.to_string());
        self
    }

    pub fn timestamp(mut self, role: TimestampRole) -> Self {
        self.timestamp = Some(role);
        self.ty = ColumnType::Timestamp;
        self.policy = match role {
            TimestampRole::Created => MergePolicy::Immutable,
            TimestampRole::Updated => MergePolicy::Overwrite,
        };
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn physical(&self) -> &str { self.field.as_deref().unwrap_or(&self.name) }
    pub fn column_type(&self) -> ColumnType { self.ty }
    pub fn policy(&self) -> MergePolicy { self.policy }
    pub fn is_virtual(&self) -> bool { self.is_virtual }
    pub fn is_nullable(&self) -> bool { self.nullable }
    pub fn timestamp_role(&self) -> Option<TimestampRole> { self.timestamp }
    pub fn default(&self) -> Option<&Value> { self.default.as_ref() }
    pub fn foreign_table(&self) -> Option<&str> { self.references.as_deref() }
}

/// A declared unique key; `columns` are logical attribute names in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub(crate) columns: Vec<String>,
}

impl UniqueKey {
    pub fn columns(&self) -> &[String] { &self.columns }

    pub(crate) fn matches(&self, attributes: &[String]) -> bool {
        let own: HashSet<&String> = self.columns.iter().collect();
        let other: HashSet<&String> = attributes.iter().collect();
        own.len() == attributes.len() && own == other
    }
}

#[derive(Debug)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: UniqueKey,
    unique_keys: Vec<UniqueKey>,
}

impl TableSchema {
    pub fn builder(name: &str) -> TableSchemaBuilder {
        TableSchemaBuilder { name: name.to_string(), columns: Vec::new(), unique_keys: Vec::new() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn columns(&self) -> &[ColumnDef] { &self.columns }
    pub fn primary_key(&self) -> &UniqueKey { &self.primary_key }
    pub fn unique_keys(&self) -> &[UniqueKey] { &self.unique_keys }

    pub fn column(&self, logical: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == logical)
    }

    pub fn stored_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.is_virtual)
    }

    pub fn virtual_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_virtual)
    }

    pub(crate) fn stored_column(&self, logical: &str) -> Result<&ColumnDef, AppError> {
        match self.column(logical) {
            Some(col) if !col.is_virtual => Ok(col),
            Some(_) => Err(AppError::schema(&self.name, format!("attribute `{}` is virtual and has no column", logical))),
            None => Err(AppError::schema(&self.name, format!("attribute `{}` has no column", logical))),
        }
    }

    /// Name of the redb table holding the unique index `key`.
    pub(crate) fn index_table_name(&self, key: &UniqueKey) -> String {
        format!("{}#{}", self.name, key.columns.join(","))
    }

    pub(crate) fn foreign_keys(&self) -> impl Iterator<Item = (&ColumnDef, &str)> {
        self.stored_columns().filter_map(|c| c.references.as_deref().map(|t| (c, t)))
    }
}

pub struct TableSchemaBuilder {
    name: String,
    columns: Vec<ColumnDef>,
    unique_keys: Vec<Vec<String>>,
}

impl TableSchemaBuilder {
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds `createdAt` / `updatedAt` stored as `created_at` / `updated_at`.
    pub fn timestamps(self) -> Self {
        self.column(ColumnDef::new("createdAt", ColumnType::Timestamp).field("created_at").timestamp(TimestampRole::Created))
            .column(ColumnDef::new("updatedAt", ColumnType::Timestamp).field("updated_at").timestamp(TimestampRole::Updated))
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.unique_keys.push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<TableSchema, AppError> {
        let table = self.name.as_str();
        if table.is_empty() || table.contains('#') {
            return Err(AppError::schema(table, "table name must be non-empty and must not contain `#`"));
        }
        let mut logical = HashSet::new();
        let mut physical = HashSet::new();
        for col in &self.columns {
            if !logical.insert(col.name.as_str()) {
                return Err(AppError::schema(table, format!("attribute `{}` declared twice", col.name)));
            }
            if col.is_virtual {
                if col.primary_key || col.timestamp.is_some() || col.references.is_some() {
                    return Err(AppError::schema(table, format!("virtual attribute `{}` cannot be a key, timestamp or reference", col.name)));
                }
                continue;
            }
            if !physical.insert(col.physical()) {
                return Err(AppError::schema(table, format!("column `{}` is mapped twice", col.physical())));
            }
            if col.policy == MergePolicy::DeepMerge && !matches!(col.ty, ColumnType::Json | ColumnType::Any) {
                return Err(AppError::schema(table, format!("deep merge needs a structured column, `{}` is {}", col.name, col.ty)));
            }
        }
        for role in [TimestampRole::Created, TimestampRole::Updated] {
            if self.columns.iter().filter(|c| c.timestamp == Some(role)).count() > 1 {
                return Err(AppError::schema(table, format!("more than one {:?} timestamp column", role)));
            }
        }

        let primary_key = UniqueKey {
            columns: self.columns.iter().filter(|c| c.primary_key).map(|c| c.name.clone()).collect(),
        };
        if primary_key.columns.is_empty() {
            return Err(AppError::schema(table, "no primary key declared"));
        }

        let mut unique_keys = Vec::with_capacity(self.unique_keys.len());
        for columns in self.unique_keys {
            if columns.is_empty() {
                return Err(AppError::schema(table, "empty unique key"));
            }
            for c in &columns {
                match self.columns.iter().find(|col| &col.name == c) {
                    Some(col) if !col.is_virtual => {}
                    _ => return Err(AppError::schema(table, format!("unique key attribute `{}` has no column", c))),
                }
            }
            let key = UniqueKey { columns };
            if key.matches(&primary_key.columns) || unique_keys.iter().any(|k: &UniqueKey| k.matches(&key.columns)) {
                return Err(AppError::schema(table, format!("unique key ({}) declared twice", key.columns.join(", "))));
            }
            unique_keys.push(key);
        }

        Ok(TableSchema { name: self.name, columns: self.columns, primary_key, unique_keys })
    }
}
