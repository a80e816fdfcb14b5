//! Lifecycle callbacks of a table's bulk upserts.

use crate::context::OperationContext;
use crate::error::AppError;
use crate::record::NaturalKey;
use futures::future::BoxFuture;
use std::sync::Arc;

pub type ContextHook = Arc<dyn for<'a> Fn(&'a OperationContext) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync>;
pub type MergeHook = Arc<dyn for<'a> Fn(&'a OperationContext, &'a NaturalKey) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync>;

/// Registered callbacks per slot, in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    before: Vec<ContextHook>,
    merge: Vec<MergeHook>,
    after: Vec<ContextHook>,
}

impl Hooks {
    pub(crate) fn push_before(&mut self, hook: ContextHook) { self.before.push(hook) }
    pub(crate) fn push_merge(&mut self, hook: MergeHook) { self.merge.push(hook) }
    pub(crate) fn push_after(&mut self, hook: ContextHook) { self.after.push(hook) }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.merge.is_empty() && self.after.is_empty()
    }

    pub(crate) async fn before_bulk_upsert(&self, ctx: &OperationContext) -> Result<(), AppError> {
        for hook in &self.before {
            hook(ctx).await?;
        }
        Ok(())
    }

    /// Fires every merge hook for each key, keys in arrival order.
    pub(crate) async fn before_bulk_upsert_merge(&self, ctx: &OperationContext) -> Result<(), AppError> {
        for key in ctx.merge_keys() {
            for hook in &self.merge {
                hook(ctx, key).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn after_bulk_upsert(&self, ctx: &OperationContext) -> Result<(), AppError> {
        for hook in &self.after {
            hook(ctx).await?;
        }
        Ok(())
    }
}
