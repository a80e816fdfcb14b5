//! Accepted input shapes and their normalization into one lazily consumed record sequence.

use crate::error::{AppError, SourceError};
use crate::record::Record;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

pub struct RecordStream(BoxStream<'static, Result<Value, SourceError>>);

impl RecordStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, SourceError>> + Send + 'static,
    {
        RecordStream(stream.boxed())
    }

    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::new(stream::iter(values.into_iter().map(Ok)))
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self::from_values(records.into_iter().map(Value::Object))
    }
}

/// Write half of a record channel: producers push records and finish with `close` or `fail`.
#[derive(Clone)]
pub struct RecordSink(UnboundedSender<Result<Value, SourceError>>);

impl RecordSink {
    pub fn send(&self, record: Value) -> Result<(), AppError> {
        self.0.unbounded_send(Ok(record)).map_err(|e| AppError::Custom(format!("record channel closed: {}", e)))
    }

    pub fn fail(&self, error: SourceError) -> Result<(), AppError> {
        let sent = self.0.unbounded_send(Err(error));
        self.0.close_channel();
        sent.map_err(|e| AppError::Custom(format!("record channel closed: {}", e)))
    }

    pub fn close(&self) {
        self.0.close_channel();
    }
}

pub fn record_channel() -> (RecordSink, RecordStream) {
    let (tx, rx): (UnboundedSender<Result<Value, SourceError>>, UnboundedReceiver<Result<Value, SourceError>>) = unbounded();
    (RecordSink(tx), RecordStream::new(rx))
}

pub enum UpsertInput {
    Records(Vec<Record>),
    Json(Value),
    Stream(RecordStream),
    Sink(RecordSink),
}

impl From<Vec<Record>> for UpsertInput {
    fn from(records: Vec<Record>) -> Self { UpsertInput::Records(records) }
}

impl From<Value> for UpsertInput {
    fn from(value: Value) -> Self { UpsertInput::Json(value) }
}

impl From<Vec<Value>> for UpsertInput {
    fn from(values: Vec<Value>) -> Self { UpsertInput::Json(Value::Array(values)) }
}

impl From<RecordStream> for UpsertInput {
    fn from(stream: RecordStream) -> Self { UpsertInput::Stream(stream) }
}

impl From<RecordSink> for UpsertInput {
    fn from(sink: RecordSink) -> Self { UpsertInput::Sink(sink) }
}

pub(crate) type RecordSequence = BoxStream<'static, Result<Record, AppError>>;

pub(crate) enum RecordSource {
    Empty,
    Sequence(RecordSequence),
}

pub(crate) fn normalize(input: Option<UpsertInput>) -> Result<RecordSource, AppError> {
    match input {
        None => Err(AppError::InvalidInput("no records given".to_string())),
        Some(UpsertInput::Sink(_)) => Err(AppError::InvalidInput("a record sink is write-only and cannot be read from".to_string())),
        Some(UpsertInput::Records(records)) => Ok(finite(records)),
        Some(UpsertInput::Json(Value::Array(values))) => {
            let mut records = Vec::with_capacity(values.len());
            for (index, value) in values.into_iter().enumerate() {
                records.push(into_record(value, index)?);
            }
            Ok(finite(records))
        }
        Some(UpsertInput::Json(other)) => {
            Err(AppError::InvalidInput(format!("expected a collection or stream of records, got {}", crate::schema::type_of(&other))))
        }
        Some(UpsertInput::Stream(RecordStream(inner))) => {
            let sequence = inner
                .enumerate()
                .map(|(index, item)| match item {
                    Ok(value) => into_record(value, index),
                    Err(source) => Err(AppError::StreamSource(source)),
                })
                .boxed();
            Ok(RecordSource::Sequence(sequence))
        }
    }
}

fn finite(records: Vec<Record>) -> RecordSource {
    if records.is_empty() {
        RecordSource::Empty
    } else {
        RecordSource::Sequence(stream::iter(records.into_iter().map(Ok)).boxed())
    }
}

fn into_record(value: Value, index: usize) -> Result<Record, AppError> {
    match value {
        Value::Object(record) => Ok(record),
        other => Err(AppError::InvalidInput(format!("record #{} is {}, expected an object", index, crate::schema::type_of(&other)))),
    }
}
