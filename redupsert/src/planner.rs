use crate::projector::{ColumnSet, ConflictTarget, KeySpec};
use crate::record::Row;
use crate::schema::{MergePolicy, TableSchema};
use serde_json::Value;
use std::fmt;

/// Resolution of one column when an incoming row hits an existing natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRule {
    /// Part of the conflict target.
    Target,
    /// Primary key column kept while the conflict target is a unique key.
    Retain,
    Overwrite,
    DeepMerge,
    Immutable,
}

/// Per-column conflict rules of one invocation, aligned with its `ColumnSet`.
#[derive(Debug, Clone)]
pub struct MergePlan {
    table: String,
    target: Vec<String>,
    columns: Vec<String>,
    rules: Vec<ConflictRule>,
}

impl MergePlan {
    pub fn new(schema: &TableSchema, key: &KeySpec, columns: &ColumnSet) -> Self {
        let pk = schema.primary_key().columns();
        let rules = columns
            .columns()
            .iter()
            .map(|col| {
                if key.attributes().iter().any(|a| a == col.name()) {
                    ConflictRule::Target
                } else if key.target() != ConflictTarget::PrimaryKey && pk.iter().any(|a| a == col.name()) {
                    ConflictRule::Retain
                } else {
                    match col.policy() {
                        MergePolicy::Overwrite => ConflictRule::Overwrite,
                        MergePolicy::DeepMerge => ConflictRule::DeepMerge,
                        MergePolicy::Immutable => ConflictRule::Immutable,
                    }
                }
            })
            .collect();
        let target = key
            .attributes()
            .iter()
            .filter_map(|a| schema.column(a).map(|c| c.physical().to_string()))
            .collect();
        MergePlan {
            table: schema.name().to_string(),
            target,
            columns: columns.columns().iter().map(|c| c.physical().to_string()).collect(),
            rules,
        }
    }

    pub fn rule(&self, physical: &str) -> Option<ConflictRule> {
        self.columns.iter().position(|c| c == physical).map(|i| self.rules[i])
    }

    /// Merges `incoming` (aligned with the column set) into the stored row.
    /// Columns outside the column set keep their stored value.
    pub(crate) fn apply(&self, mut stored: Row, incoming: &[Value]) -> Row {
        for ((column, rule), value) in self.columns.iter().zip(&self.rules).zip(incoming) {
            match rule {
                ConflictRule::Target | ConflictRule::Retain | ConflictRule::Immutable => {
                    stored.entry(column.clone()).or_insert_with(|| value.clone());
                }
                ConflictRule::Overwrite => {
                    stored.insert(column.clone(), value.clone());
                }
                ConflictRule::DeepMerge => {
                    if value.is_null() {
                        stored.entry(column.clone()).or_insert(Value::Null);
                    } else {
                        let merged = match stored.remove(column) {
                            Some(old) => deep_merge(old, value.clone()),
                            None => value.clone(),
                        };
                        stored.insert(column.clone(), merged);
                    }
                }
            }
        }
        stored
    }
}

impl fmt::Display for MergePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ON CONFLICT ({}) ", self.target.join(", "))?;
        let sets: Vec<String> = self
            .columns
            .iter()
            .zip(&self.rules)
            .filter_map(|(c, rule)| match rule {
                ConflictRule::Overwrite => Some(format!("{c} = EXCLUDED.{c}")),
                ConflictRule::DeepMerge => Some(format!("{c} = deep_merge({t}.{c}, EXCLUDED.{c})", t = self.table)),
                _ => None,
            })
            .collect();
        if sets.is_empty() {
            f.write_str("DO NOTHING")
        } else {
            write!(f, "DO UPDATE SET {}", sets.join(", "))
        }
    }
}

/// Recursive union of two JSON objects; on anything but two objects the incoming value wins.
pub fn deep_merge(stored: Value, incoming: Value) -> Value {
    match (stored, incoming) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (k, v) in patch {
                let merged = match base.remove(&k) {
                    Some(old) => deep_merge(old, v),
                    None => v,
                };
                base.insert(k, merged);
            }
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use serde_json::json;
    use std::collections::HashSet;

    fn schema() -> TableSchema {
        TableSchema::builder("foo")
            .column(ColumnDef::new("id", ColumnType::Text).primary_key())
            .column(ColumnDef::new("name", ColumnType::Text))
            .column(ColumnDef::new("deepMerge", ColumnType::Json).merge(MergePolicy::DeepMerge))
            .column(ColumnDef::new("immutable", ColumnType::Text).merge(MergePolicy::Immutable))
            .column(ColumnDef::new("data", ColumnType::Text).field("my_data_field"))
            .unique(&["name"])
            .build()
            .unwrap()
    }

    fn plan(schema: &TableSchema, id_fields: Option<&[String]>) -> MergePlan {
        let key = KeySpec::resolve(schema, id_fields, &[]).unwrap();
        MergePlan::new(schema, &key, &ColumnSet::new(schema, &HashSet::new()))
    }

    #[test]
    fn deep_merge_unions_nested_objects() {
        let stored = json!({"a": {"x": 1, "y": {"keep": true}}, "b": [1, 2], "only_stored": 0});
        let incoming = json!({"a": {"y": {"new": 2}, "z": 3}, "b": [3]});
        assert_eq!(
            deep_merge(stored, incoming),
            json!({"a": {"x": 1, "y": {"keep": true, "new": 2}, "z": 3}, "b": [3], "only_stored": 0})
        );
        assert_eq!(deep_merge(json!({"a": 1}), json!("scalar")), json!("scalar"));
        assert_eq!(deep_merge(json!(null), json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn rules_follow_policies_and_target() {
        let schema = schema();
        let by_pk = plan(&schema, None);
        assert_eq!(by_pk.rule("id"), Some(ConflictRule::Target));
        assert_eq!(by_pk.rule("name"), Some(ConflictRule::Overwrite));
        assert_eq!(by_pk.rule("deepMerge"), Some(ConflictRule::DeepMerge));
        assert_eq!(by_pk.rule("immutable"), Some(ConflictRule::Immutable));

        let by_name = plan(&schema, Some(&["name".to_string()][..]));
        assert_eq!(by_name.rule("name"), Some(ConflictRule::Target));
        assert_eq!(by_name.rule("id"), Some(ConflictRule::Retain));
    }

    #[test]
    fn apply_merges_stored_row() {
        let schema = schema();
        let plan = plan(&schema, None);
        let stored: Row = json!({
            "id": "a", "name": "old", "deepMerge": {"x": 1}, "immutable": "first", "my_data_field": "d", "legacy": 7
        })
        .as_object()
        .cloned()
        .unwrap();
        let incoming = vec![json!("a"), json!("new"), json!({"y": 2}), json!("second"), Value::Null];
        let merged = plan.apply(stored, &incoming);
        assert_eq!(merged["name"], json!("new"));
        assert_eq!(merged["deepMerge"], json!({"x": 1, "y": 2}));
        assert_eq!(merged["immutable"], json!("first"));
        assert_eq!(merged["my_data_field"], Value::Null);
        assert_eq!(merged["legacy"], json!(7));
    }

    #[test]
    fn null_deep_merge_keeps_stored_structure() {
        let schema = schema();
        let plan = plan(&schema, None);
        let stored: Row = json!({"id": "a", "deepMerge": {"x": 1}}).as_object().cloned().unwrap();
        let merged = plan.apply(stored, &[json!("a"), json!("n"), Value::Null, json!("i"), json!("d")]);
        assert_eq!(merged["deepMerge"], json!({"x": 1}));
        assert_eq!(merged["immutable"], json!("i"));
    }

    #[test]
    fn renders_conflict_clause() {
        let schema = schema();
        assert_eq!(
            plan(&schema, None).to_string(),
            "ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, deepMerge = deep_merge(foo.deepMerge, EXCLUDED.deepMerge), my_data_field = EXCLUDED.my_data_field"
        );
    }
}
