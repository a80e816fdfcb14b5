use crate::error::AppError;
use serde_json::{Map, Value};
use std::fmt;

/// Logical attribute name → value, as handed over by callers.
pub type Record = Map<String, Value>;

/// Physical column name → value, as stored.
pub type Row = Map<String, Value>;

/// Encodes a key tuple into the bytes a redb table is keyed by.
/// serde_json orders object members, so equal tuples always encode equally.
pub(crate) fn encode_tuple(values: &[Value]) -> Result<Vec<u8>, AppError> {
    Ok(serde_json::to_vec(values)?)
}

pub(crate) fn encode_row(row: &Row) -> Result<Vec<u8>, AppError> {
    Ok(serde_json::to_vec(row)?)
}

pub(crate) fn decode_row(bytes: &[u8]) -> Result<Row, AppError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Values of the natural key attributes of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalKey {
    attributes: Vec<String>,
    values: Vec<Value>,
}

impl NaturalKey {
    pub(crate) fn new(attributes: Vec<String>, values: Vec<Value>) -> Self {
        Self { attributes, values }
    }

    pub fn attributes(&self) -> &[String] { &self.attributes }
    pub fn values(&self) -> &[Value] { &self.values }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.iter().position(|a| a == attribute).map(|i| &self.values[i])
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, AppError> {
        encode_tuple(&self.values)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.values.as_slice() {
            [Value::String(s)] => f.write_str(s),
            [single] => write!(f, "{}", single),
            many => {
                let parts: Vec<String> = many.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}
