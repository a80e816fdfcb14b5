use crate::collector::BatchPolicy;
use crate::transaction::Transaction;
use redb::Durability;

/// Passed through to the write primitive of an engine-owned transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub durability: Option<Durability>,
}

impl WriteOptions {
    pub fn durability(durability: Durability) -> Self {
        WriteOptions { durability: Some(durability) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Natural key attributes, the primary key when unset.
    pub id_fields: Option<Vec<String>>,
    /// Logical attributes left out of the written payload.
    pub omit: Vec<String>,
    /// Caller transaction; without one the engine begins and commits its own.
    pub transaction: Option<Transaction>,
    pub write: WriteOptions,
    /// Overrides the store's configured `BatchPolicy`.
    pub batch: Option<BatchPolicy>,
}

impl UpsertOptions {
    pub fn new() -> Self { Self::default() }

    pub fn id_fields(mut self, fields: &[&str]) -> Self {
        self.id_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn omit(mut self, attributes: &[&str]) -> Self {
        self.omit = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn transaction(mut self, tx: &Transaction) -> Self {
        self.transaction = Some(tx.clone());
        self
    }

    pub fn write(mut self, write: WriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn batch(mut self, policy: BatchPolicy) -> Self {
        self.batch = Some(policy);
        self
    }
}
