//! Bulk upsert: normalize, project, plan and write a record sequence as one operation.

use crate::collector::{Batch, BatchCollector};
use crate::context::{OperationContext, UpsertState};
use crate::error::AppError;
use crate::executor::{OnConflict, Statement, StatementOutcome};
use crate::hooks::Hooks;
use crate::input::{normalize, RecordSource, UpsertInput};
use crate::options::UpsertOptions;
use crate::planner::MergePlan;
use crate::projector::{KeySpec, RecordProjector};
use crate::record::Record;
use crate::table::Table;
use crate::transaction::Transaction;
use crate::{debug, info, warn};
use chrono::Utc;

/// Per-invocation bookkeeping; dropped when the invocation returns.
struct UpsertRun<'t> {
    table: &'t Table,
    state: UpsertState,
    /// A statement has been executed inside the caller's transaction.
    wrote_to_caller: bool,
}

impl<'t> UpsertRun<'t> {
    fn transition(&mut self, next: UpsertState) {
        debug!("{} bulk upsert {} -> {}", self.table.name(), self.state, next);
        self.state = next;
    }

    /// Ends the invocation with `err`, leaving a caller transaction aborted when it was written to.
    fn fail(&mut self, options: &UpsertOptions, err: AppError) -> AppError {
        if let Some(tx) = &options.transaction {
            if self.state == UpsertState::Writing || self.wrote_to_caller {
                if let Err(e) = tx.poison(err.to_string()) {
                    warn!("could not abort transaction {}: {}", tx.id(), e);
                }
            }
        }
        self.transition(UpsertState::Aborted);
        err
    }
}

impl Table {
    /// Inserts or merges `records` in order, see `bulk_upsert_stream`.
    pub async fn bulk_upsert(&self, records: Vec<Record>, options: UpsertOptions) -> Result<Table, AppError> {
        self.bulk_upsert_stream(Some(records.into()), options).await
    }

    /// Inserts every record of `input`, merging those whose natural key already has a row.
    ///
    /// With the default `BatchPolicy::Whole` all records are written by one statement in one
    /// transaction: either every row is written or none. Without a caller transaction the engine
    /// begins and commits its own. A failure inside a caller transaction leaves it aborted; the
    /// caller rolls it back.
    pub async fn bulk_upsert_stream(&self, input: Option<UpsertInput>, options: UpsertOptions) -> Result<Table, AppError> {
        let mut run = UpsertRun { table: self, state: UpsertState::Idle, wrote_to_caller: false };
        match self.run(&mut run, input, &options).await {
            Ok(()) => Ok(self.clone()),
            Err(err) => Err(run.fail(&options, err)),
        }
    }

    async fn run(&self, run: &mut UpsertRun<'_>, input: Option<UpsertInput>, options: &UpsertOptions) -> Result<(), AppError> {
        run.transition(UpsertState::Validating);
        let source = normalize(input)?;
        if let RecordSource::Empty = source {
            debug!("{} bulk upsert of nothing", self.name());
            return Ok(());
        }
        let schema = self.schema();
        let key = KeySpec::resolve(schema, options.id_fields.as_deref(), &options.omit)?;
        let hooks = self.hooks()?;
        if options.transaction.is_some() && options.write.durability.is_some() {
            debug!("{} bulk upsert ignores write options inside a caller transaction", self.name());
        }

        run.transition(UpsertState::Projecting);
        let projector = RecordProjector::new(schema.clone(), key.clone(), &options.omit, Utc::now())?;
        let policy = options.batch.unwrap_or(self.store().settings().batch_policy);
        let mut collector = BatchCollector::new(source, projector, policy);
        let mut plan: Option<MergePlan> = None;
        let mut total = StatementOutcome::default();

        while let Some(batch) = collector.next_batch().await? {
            run.transition(UpsertState::Planning);
            let plan = plan.get_or_insert_with(|| {
                let plan = MergePlan::new(schema, &key, collector.projector().columns());
                debug!("{} {}", self.name(), plan);
                plan
            });
            let statement = Statement::new(schema, &key, collector.projector().columns(), OnConflict::Merge(plan));

            run.transition(UpsertState::Writing);
            let outcome = self.write_batch(run, &hooks, &statement, batch, options).await?;
            total.inserted += outcome.inserted;
            total.merged += outcome.merged;
            run.transition(UpsertState::Projecting);
        }

        if total.inserted + total.merged == 0 {
            debug!("{} bulk upsert of an empty stream", self.name());
        }
        run.transition(UpsertState::Committed);
        Ok(())
    }

    async fn write_batch(
        &self,
        run: &mut UpsertRun<'_>,
        hooks: &Hooks,
        statement: &Statement<'_>,
        batch: Batch,
        options: &UpsertOptions,
    ) -> Result<StatementOutcome, AppError> {
        let (tx, owned) = match &options.transaction {
            Some(tx) => (tx.clone(), false),
            None => (self.store().begin_with(options.write).await?, true),
        };
        let merge_keys = if hooks.is_empty() { Vec::new() } else { tx.inspect(|w| statement.probe(w, &batch.payloads))? };
        let mut ctx = OperationContext {
            table: self.clone(),
            transaction: tx.clone(),
            owned,
            omit: options.omit.clone(),
            id_fields: statement.key_attributes().to_vec(),
            batch_len: batch.len(),
            batch_index: batch.index,
            merge_keys,
            state: UpsertState::Writing,
        };

        let written = async {
            hooks.before_bulk_upsert(&ctx).await?;
            hooks.before_bulk_upsert_merge(&ctx).await?;
            let outcome = tx.write(|w| statement.execute(w, &batch.payloads))?;
            if owned {
                tx.commit().await?;
            }
            Ok::<StatementOutcome, AppError>(outcome)
        }
        .await;

        let outcome = match written {
            Ok(outcome) => outcome,
            Err(err) => {
                if owned {
                    release(&tx).await;
                }
                return Err(err);
            }
        };
        if !owned {
            run.wrote_to_caller = true;
        }
        info!(
            "{} upserted {} rows in batch {} ({} inserted, {} merged) in transaction {}",
            self.name(),
            batch.len(),
            batch.index,
            outcome.inserted,
            outcome.merged,
            tx.id()
        );

        ctx.state = UpsertState::Committed;
        hooks.after_bulk_upsert(&ctx).await?;
        Ok(outcome)
    }
}

async fn release(tx: &Transaction) {
    if let Err(e) = tx.rollback().await {
        warn!("rollback of transaction {} failed: {}", tx.id(), e);
    }
}
