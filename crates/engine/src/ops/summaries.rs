use chrono::Utc;
use sea_orm::{ActiveValue, DatabaseTransaction, QueryFilter, TransactionTrait, prelude::*};
use tracing::{debug, warn};

use crate::{
    Expense, ResultEngine,
    expenses::{self, ExportErrorType, ExportState, ExportSummary, summary_to_column},
    ports::{SourceError, SourcePlatform},
    retry::{RetryPolicy, retry_source_call},
};

use super::{Engine, with_tx};

impl Engine {
    /// Writes a new export summary on every listed expense.
    ///
    /// An `ERROR` summary with the same `error_type` as the current one is
    /// left untouched. Returns the ids whose summary changed and must be
    /// pushed upstream.
    pub(super) async fn stamp_summaries(
        &self,
        db: &DatabaseTransaction,
        expense_ids: &[String],
        state: ExportState,
        error_type: Option<ExportErrorType>,
        url: Option<&str>,
    ) -> ResultEngine<Vec<String>> {
        if expense_ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let models = expenses::Entity::find()
            .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
            .all(db)
            .await?;

        let mut changed = Vec::with_capacity(models.len());
        for model in models {
            let expense = Expense::try_from(model.clone())?;
            if let Some(current) = &expense.export_summary
                && current.state == ExportState::Error
                && state == ExportState::Error
                && current.error_type == error_type
            {
                debug!(expense_id = %expense.expense_id, "export summary already in same error");
                continue;
            }

            let link = url
                .map(ToString::to_string)
                .unwrap_or_else(|| self.settings.expense_url(&expense.expense_id));
            let summary = ExportSummary::new(&expense.expense_id, state, error_type, Some(link));

            let mut active: expenses::ActiveModel = model.into();
            active.previous_export_state =
                ActiveValue::Set(expense.export_state().map(|s| s.as_str().to_string()));
            active.export_summary = ActiveValue::Set(summary_to_column(Some(&summary))?);
            active.updated_at = ActiveValue::Set(now);
            active.update(db).await?;
            changed.push(expense.expense_id);
        }
        Ok(changed)
    }

    /// Pushes the unsynced export summaries of `expense_ids` upstream.
    ///
    /// Summaries go in batches with bounded retry on transient failures. When
    /// the platform denies permission for some ids, those are reclassified as
    /// `DELETED` and the rest of the batch is pushed once more. Failures are
    /// logged and never propagated. Returns the number of summaries synced.
    pub async fn push_export_summaries(
        &self,
        account_id: &str,
        expense_ids: &[String],
        source: &dyn SourcePlatform,
    ) -> ResultEngine<usize> {
        if expense_ids.is_empty() {
            return Ok(0);
        }
        let pending: Vec<ExportSummary> = with_tx!(self, |db_tx| {
            let models = expenses::Entity::find()
                .filter(expenses::Column::AccountId.eq(account_id.to_string()))
                .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
                .all(&db_tx)
                .await?;
            let mut pending = Vec::new();
            for model in models {
                if let Some(summary) = Expense::try_from(model)?.export_summary
                    && !summary.synced
                {
                    pending.push(summary);
                }
            }
            Ok::<_, crate::EngineError>(pending)
        })?;

        let policy = RetryPolicy::new(
            self.settings.export_summary_max_attempts,
            self.settings.export_summary_backoff(),
        );
        let mut synced = 0;
        for batch in pending.chunks(self.settings.export_summary_batch_size) {
            let result = retry_source_call(policy, "push_export_summaries", || {
                source.push_export_summaries(account_id, batch)
            })
            .await;

            match result {
                Ok(()) => {
                    synced += self.mark_synced(batch).await?;
                }
                Err(SourceError::PermissionDenied(denied)) => {
                    warn!(
                        account_id,
                        denied = denied.len(),
                        "export summary push denied, reclassifying as DELETED"
                    );
                    self.mark_deleted(&denied).await?;
                    let rest: Vec<ExportSummary> = batch
                        .iter()
                        .filter(|s| !denied.contains(&s.id))
                        .cloned()
                        .collect();
                    if rest.is_empty() {
                        continue;
                    }
                    match source.push_export_summaries(account_id, &rest).await {
                        Ok(()) => synced += self.mark_synced(&rest).await?,
                        Err(err) => {
                            warn!(account_id, error = %err, "export summary push failed")
                        }
                    }
                }
                Err(err) => {
                    warn!(account_id, error = %err, "export summary push failed");
                }
            }
        }
        Ok(synced)
    }

    async fn mark_synced(&self, batch: &[ExportSummary]) -> ResultEngine<usize> {
        with_tx!(self, |db_tx| {
            let mut count = 0;
            for pushed in batch {
                let Some(model) = expenses::Entity::find_by_id(pushed.id.clone())
                    .one(&db_tx)
                    .await?
                else {
                    continue;
                };
                let Some(mut summary) = Expense::try_from(model.clone())?.export_summary else {
                    continue;
                };
                // A newer summary written meanwhile stays unsynced.
                if summary.state != pushed.state || summary.error_type != pushed.error_type {
                    continue;
                }
                summary.synced = true;
                let mut active: expenses::ActiveModel = model.into();
                active.export_summary = ActiveValue::Set(summary_to_column(Some(&summary))?);
                active.update(&db_tx).await?;
                count += 1;
            }
            Ok(count)
        })
    }

    async fn mark_deleted(&self, expense_ids: &[String]) -> ResultEngine<()> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let models = expenses::Entity::find()
                .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
                .all(&db_tx)
                .await?;
            for model in models {
                let expense = Expense::try_from(model.clone())?;
                let mut summary = ExportSummary::new(
                    &expense.expense_id,
                    ExportState::Deleted,
                    None,
                    expense.export_summary.as_ref().and_then(|s| s.url.clone()),
                );
                summary.synced = true;
                let mut active: expenses::ActiveModel = model.into();
                active.previous_export_state =
                    ActiveValue::Set(expense.export_state().map(|s| s.as_str().to_string()));
                active.export_summary = ActiveValue::Set(summary_to_column(Some(&summary))?);
                active.updated_at = ActiveValue::Set(now);
                active.update(&db_tx).await?;
            }
            Ok(())
        })
    }
}
