//! Secondary stage: turn work-stack items into a new batch and process it.

use std::sync::Arc;

use enrichkit_shared::{LookupKind, Result, StateRecord};
use tracing::{info, instrument};

use crate::context::PipelineContext;
use crate::pipeline::{BatchReport, Pipeline, ProgressReporter};

/// Result of [`drain_stack`].
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Records created from stack items.
    pub staged: usize,
    /// Run over the drain batch.
    pub batch: BatchReport,
}

/// Pop up to `limit` items off the context's stack into `batch_id` as
/// `Pending` records of `kind`.
///
/// Popping and record creation share one transaction, so an item is never
/// consumed without its record. Records that already exist in the batch are
/// left untouched.
#[instrument(skip_all, fields(batch_id = %batch_id, kind = %kind, limit))]
pub async fn stage_from_stack(
    ctx: &PipelineContext,
    batch_id: &str,
    kind: LookupKind,
    limit: u32,
) -> Result<Vec<StateRecord>> {
    let staged = ctx
        .storage
        .stage_stack_items(&ctx.config.stack_name, limit, batch_id, kind)
        .await?;
    info!(
        staged = staged.len(),
        stack = %ctx.config.stack_name,
        "staged stack items"
    );
    Ok(staged)
}

/// Stage stack items into `batch_id` and run a fresh [`Pipeline`] over it.
///
/// The batch is run even when nothing new was staged, so records left over
/// from an interrupted drain still get processed.
pub async fn drain_stack(
    ctx: Arc<PipelineContext>,
    batch_id: &str,
    kind: LookupKind,
    limit: u32,
    progress: Option<Arc<dyn ProgressReporter>>,
) -> Result<DrainReport> {
    ctx.require_adapter(kind)?;
    let staged = stage_from_stack(&ctx, batch_id, kind, limit).await?.len();

    let mut pipeline = Pipeline::new(ctx, kind);
    if let Some(progress) = progress {
        pipeline = pipeline.with_progress(progress);
    }
    let report = pipeline.run(batch_id).await?;

    Ok(DrainReport {
        staged,
        batch: report,
    })
}
