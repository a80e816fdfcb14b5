use crate::error::AppError;
use crate::input::{RecordSequence, RecordSource};
use crate::projector::{Payload, RecordProjector};
use futures::StreamExt;
use std::fmt;
use std::str::FromStr;

/// How many projected rows go into one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// The whole input is one statement.
    #[default]
    Whole,
    /// Every `n` rows are written by their own statement.
    Chunked(usize),
}

impl FromStr for BatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.split_once(':') {
            None if lower == "whole" => Ok(BatchPolicy::Whole),
            Some(("chunked", n)) => match n.trim().parse::<usize>() {
                Ok(n) if n > 0 => Ok(BatchPolicy::Chunked(n)),
                _ => Err(format!("Invalid chunk size for BatchPolicy: {}", s)),
            },
            _ => Err(format!("Invalid value for BatchPolicy: {}", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for BatchPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BatchPolicy::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for BatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPolicy::Whole => f.write_str("whole"),
            BatchPolicy::Chunked(n) => write!(f, "chunked:{}", n),
        }
    }
}

/// Payloads written by one statement, in arrival order.
#[derive(Debug)]
pub struct Batch {
    pub index: usize,
    pub payloads: Vec<Payload>,
}

impl Batch {
    pub fn len(&self) -> usize { self.payloads.len() }
    pub fn is_empty(&self) -> bool { self.payloads.is_empty() }
}

/// Pulls records from the normalized input, projects them and cuts batches per `BatchPolicy`.
pub struct BatchCollector {
    source: Option<RecordSequence>,
    projector: RecordProjector,
    policy: BatchPolicy,
    emitted: usize,
}

impl BatchCollector {
    pub(crate) fn new(source: RecordSource, projector: RecordProjector, policy: BatchPolicy) -> Self {
        let source = match source {
            RecordSource::Empty => None,
            RecordSource::Sequence(s) => Some(s),
        };
        Self { source, projector, policy, emitted: 0 }
    }

    pub fn projector(&self) -> &RecordProjector { &self.projector }

    /// Next non-empty batch, `None` once the input is exhausted.
    /// A source or projection error discards everything buffered so far.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>, AppError> {
        let limit = match self.policy {
            BatchPolicy::Whole => usize::MAX,
            BatchPolicy::Chunked(n) => n,
        };
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let mut payloads = Vec::new();
        while payloads.len() < limit {
            match source.next().await {
                Some(record) => payloads.push(self.projector.project(record?)?),
                None => {
                    self.source = None;
                    break;
                }
            }
        }
        if payloads.is_empty() {
            return Ok(None);
        }
        let index = self.emitted;
        self.emitted += 1;
        Ok(Some(Batch { index, payloads }))
    }
}
