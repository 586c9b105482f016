use chrono::{DateTime, Utc};
use sea_orm::{QueryFilter, QuerySelect, TransactionTrait, prelude::*, sea_query::Expr};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    AccountConfig, EngineError, Expense, ExpenseGroup, LedgerTransaction, ResultEngine, TaskLog,
    account_configs::TransactionKind,
    expense_groups,
    expenses::{self, ExportErrorType, ExportState},
    exporters::{ExportContext, LedgerPayload, exporter_for},
    ledger_transactions,
    ports::{Collaborators, LedgerError, LedgerReceipt},
    task_logs::{self, TaskStatus, TriggerSource},
    util::first_of_month,
    validation::ValidationFailure,
};

use super::{Engine, with_tx};

/// One enqueued export, as handed to a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportJob {
    pub task_log_id: Uuid,
    pub account_id: String,
    pub expense_group_id: String,
    pub kind: TransactionKind,
    pub trigger: TriggerSource,
    /// Last job of its scheduling batch.
    pub is_last: bool,
}

enum Claim {
    Started {
        config: AccountConfig,
        group: ExpenseGroup,
        expenses: Vec<Expense>,
        notify: Vec<String>,
    },
    /// Another worker owns the task, or it already finished.
    Held(TaskStatus),
}

enum Failure {
    Validation(ValidationFailure),
    Ledger(LedgerError),
    Unexpected(String),
}

impl Engine {
    /// Runs one export task through the state machine.
    ///
    /// The task log is claimed with a compare-and-set from `ENQUEUED` to
    /// `IN_PROGRESS`; a task in any other status is left alone and that
    /// status returned. Returns the final status of the task.
    pub async fn run_export(
        &self,
        job: &ExportJob,
        collaborators: &Collaborators,
    ) -> ResultEngine<TaskStatus> {
        let now = Utc::now();
        let claim = self.claim_export(job, now).await?;
        let (config, group, expenses, notify) = match claim {
            Claim::Held(status) => {
                info!(
                    task_log_id = %job.task_log_id,
                    expense_group_id = %job.expense_group_id,
                    status = %status,
                    "export not claimable, skipping"
                );
                return Ok(status);
            }
            Claim::Started {
                config,
                group,
                expenses,
                notify,
            } => (config, group, expenses, notify),
        };

        self.push_export_summaries(&job.account_id, &notify, collaborators.source.as_ref())
            .await?;

        let ctx = ExportContext {
            config: &config,
            group: &group,
            expenses: &expenses,
            now,
        };
        let result = self.export_group(job, &ctx, collaborators).await;
        let (status, notify, receipt) = self.settle_export(job, &ctx, result).await?;

        self.push_export_summaries(&job.account_id, &notify, collaborators.source.as_ref())
            .await?;
        if job.is_last {
            self.recompute_last_export_detail(&job.account_id).await?;
        }
        if let (Some(receipt), Some(queue)) = (receipt, collaborators.attachments.as_ref())
            && let Err(err) = queue
                .enqueue(&job.account_id, &job.expense_group_id, &receipt.external_id)
                .await
        {
            warn!(
                expense_group_id = %job.expense_group_id,
                error = %err,
                "attachment upload not enqueued"
            );
        }
        Ok(status)
    }

    async fn claim_export(&self, job: &ExportJob, now: DateTime<Utc>) -> ResultEngine<Claim> {
        with_tx!(self, |db_tx| {
            let model = task_logs::Entity::find_by_id(job.task_log_id.to_string())
                .lock_exclusive()
                .one(&db_tx)
                .await?
                .ok_or_else(|| EngineError::KeyNotFound(format!("task log {}", job.task_log_id)))?;
            let current = TaskLog::try_from(model)?;

            // FAILED and FATAL end an attempt; only a fresh schedule re-enqueues.
            let claimed = if current.status != TaskStatus::Enqueued {
                0
            } else {
                task_logs::Entity::update_many()
                    .col_expr(
                        task_logs::Column::Status,
                        Expr::value(TaskStatus::InProgress.as_str()),
                    )
                    .col_expr(task_logs::Column::UpdatedAt, Expr::value(now))
                    .filter(task_logs::Column::Id.eq(job.task_log_id.to_string()))
                    .filter(task_logs::Column::Status.eq(TaskStatus::Enqueued.as_str()))
                    .exec(&db_tx)
                    .await?
                    .rows_affected
            };

            let claim = if claimed == 0 {
                Claim::Held(current.status)
            } else {
                let config = self
                    .require_account_config(&db_tx, &job.account_id)
                    .await?;
                let group = ExpenseGroup::try_from(
                    self.require_group(&db_tx, &job.account_id, &job.expense_group_id)
                        .await?,
                )?;
                let expenses =
                    expenses::to_domain(self.group_members(&db_tx, &group.id).await?)?;

                // A retry of an errored export keeps the ERROR summary visible.
                let quiet = job.trigger.is_auto()
                    && expenses
                        .iter()
                        .any(|e| e.export_state() == Some(ExportState::Error));
                let notify = if quiet {
                    Vec::new()
                } else {
                    let ids: Vec<String> = expenses.iter().map(|e| e.expense_id.clone()).collect();
                    self.stamp_summaries(&db_tx, &ids, ExportState::InProgress, None, None)
                        .await?
                };
                info!(
                    task_log_id = %job.task_log_id,
                    expense_group_id = %group.id,
                    kind = %job.kind,
                    "export started"
                );
                Claim::Started {
                    config,
                    group,
                    expenses,
                    notify,
                }
            };
            Ok(claim)
        })
    }

    /// Validates, builds and posts the payload of a group.
    async fn export_group(
        &self,
        job: &ExportJob,
        ctx: &ExportContext<'_>,
        collaborators: &Collaborators,
    ) -> Result<(LedgerPayload, LedgerReceipt), Failure> {
        let exporter = exporter_for(job.kind);
        let dims = match exporter
            .validate(ctx, collaborators.mappings.as_ref())
            .await
        {
            Ok(dims) => dims,
            Err(EngineError::Validation(failure)) => return Err(Failure::Validation(failure)),
            Err(err) => return Err(Failure::Unexpected(err.to_string())),
        };
        let mut payload = exporter.build_payload(ctx, &dims);

        let ledger = collaborators.ledger.as_ref();
        let first_attempt = exporter.post(ledger, &job.account_id, &payload).await;
        match first_attempt {
            Ok(receipt) => Ok((payload, receipt)),
            Err(LedgerError::AccountingPeriodClosed(reason))
                if ctx.config.auto_correct_accounting_period =>
            {
                let corrected = first_of_month(ctx.now);
                info!(
                    expense_group_id = %job.expense_group_id,
                    %reason,
                    transaction_date = %corrected,
                    "accounting period closed, retrying at start of month"
                );
                payload.transaction_date = corrected;
                exporter
                    .post(ledger, &job.account_id, &payload)
                    .await
                    .map(|receipt| (payload, receipt))
                    .map_err(Failure::Ledger)
            }
            Err(err) => Err(Failure::Ledger(err)),
        }
    }

    /// Persists the outcome of an export. Returns the final status, the
    /// expenses whose summary changed and the receipt on success.
    async fn settle_export(
        &self,
        job: &ExportJob,
        ctx: &ExportContext<'_>,
        result: Result<(LedgerPayload, LedgerReceipt), Failure>,
    ) -> ResultEngine<(TaskStatus, Vec<String>, Option<LedgerReceipt>)> {
        let now = Utc::now();
        let account_id = job.account_id.as_str();
        let group_id = job.expense_group_id.as_str();
        let member_ids: Vec<String> = ctx.expenses.iter().map(|e| e.expense_id.clone()).collect();

        with_tx!(self, |db_tx| {
            let mut task_log = TaskLog::try_from(
                task_logs::Entity::find_by_id(job.task_log_id.to_string())
                    .one(&db_tx)
                    .await?
                    .ok_or_else(|| {
                        EngineError::KeyNotFound(format!("task log {}", job.task_log_id))
                    })?,
            )?;
            task_log.updated_at = now;

            let (notify, receipt) = match result {
                Ok((payload, receipt)) => {
                    let transaction = LedgerTransaction {
                        id: Uuid::new_v4(),
                        account_id: account_id.to_string(),
                        expense_group_id: group_id.to_string(),
                        kind: job.kind,
                        external_id: receipt.external_id.clone(),
                        entity_id: payload.entity_id.clone(),
                        amount: payload.total(),
                        currency: payload.currency.clone(),
                        transaction_date: payload.transaction_date,
                        paid_on_ledger: false,
                        paid_on_source: false,
                        payment_synced: false,
                        created_at: now,
                        updated_at: now,
                    };
                    ledger_transactions::ActiveModel::from(&transaction)
                        .insert(&db_tx)
                        .await?;

                    let url = receipt.url.clone().unwrap_or_else(|| {
                        self.settings
                            .ledger_url(job.kind.as_str(), &receipt.external_id)
                    });
                    let mut group = ctx.group.clone();
                    group.exported_at = Some(now);
                    group.response = Some(receipt.raw.clone());
                    group.export_url = Some(url.clone());
                    group.updated_at = now;
                    expense_groups::ActiveModel::try_from(&group)?
                        .update(&db_tx)
                        .await?;

                    let resolved = self
                        .resolve_errors_in_tx(&db_tx, account_id, group_id, now)
                        .await?;

                    task_log.status = TaskStatus::Complete;
                    task_log.ledger_transaction_id = Some(transaction.id.to_string());
                    task_log.detail = Some(receipt.raw.clone());
                    info!(
                        task_log_id = %task_log.id,
                        expense_group_id = group_id,
                        external_id = %receipt.external_id,
                        resolved_errors = resolved,
                        "export complete"
                    );
                    let notify = self
                        .stamp_summaries(
                            &db_tx,
                            &member_ids,
                            ExportState::Complete,
                            None,
                            Some(&url),
                        )
                        .await?;
                    (notify, Some(receipt))
                }
                Err(Failure::Validation(failure)) => {
                    warn!(
                        task_log_id = %task_log.id,
                        expense_group_id = group_id,
                        missing = failure.missing.len(),
                        "export blocked by missing mappings"
                    );
                    task_log.status = TaskStatus::Failed;
                    task_log.detail = Some(json!({
                        "error": failure.to_string(),
                        "missing": failure.missing,
                    }));
                    self.record_mapping_errors(&db_tx, account_id, group_id, &failure.missing, now)
                        .await?;
                    let notify = self
                        .stamp_summaries(
                            &db_tx,
                            &member_ids,
                            ExportState::Error,
                            Some(ExportErrorType::Mapping),
                            None,
                        )
                        .await?;
                    (notify, None)
                }
                Err(Failure::Ledger(err)) if err.is_transient() => {
                    warn!(
                        task_log_id = %task_log.id,
                        expense_group_id = group_id,
                        error = %err,
                        "ledger unavailable, export left for the next run"
                    );
                    task_log.status = TaskStatus::Failed;
                    task_log.detail = Some(json!({
                        "error": err.to_string(),
                        "detail": err.detail(),
                    }));
                    let notify = self
                        .stamp_summaries(
                            &db_tx,
                            &member_ids,
                            ExportState::Error,
                            Some(ExportErrorType::AccountingIntegrationError),
                            None,
                        )
                        .await?;
                    (notify, None)
                }
                Err(Failure::Ledger(err)) if err.is_expected() => {
                    warn!(
                        task_log_id = %task_log.id,
                        expense_group_id = group_id,
                        error = %err,
                        "ledger rejected export"
                    );
                    task_log.status = TaskStatus::Failed;
                    task_log.detail = Some(json!({
                        "error": err.to_string(),
                        "detail": err.detail(),
                    }));
                    self.record_ledger_error(
                        &db_tx,
                        account_id,
                        group_id,
                        err.to_string(),
                        err.detail(),
                        now,
                    )
                    .await?;
                    let notify = self
                        .stamp_summaries(
                            &db_tx,
                            &member_ids,
                            ExportState::Error,
                            Some(ExportErrorType::AccountingIntegrationError),
                            None,
                        )
                        .await?;
                    (notify, None)
                }
                Err(Failure::Ledger(err)) => {
                    error!(
                        task_log_id = %task_log.id,
                        expense_group_id = group_id,
                        error = %err,
                        "export failed unexpectedly"
                    );
                    task_log.status = TaskStatus::Fatal;
                    task_log.detail = Some(json!({ "error": err.to_string() }));
                    let notify = self
                        .stamp_summaries(
                            &db_tx,
                            &member_ids,
                            ExportState::Error,
                            Some(ExportErrorType::AccountingIntegrationError),
                            None,
                        )
                        .await?;
                    (notify, None)
                }
                Err(Failure::Unexpected(message)) => {
                    error!(
                        task_log_id = %task_log.id,
                        expense_group_id = group_id,
                        error = %message,
                        "export failed unexpectedly"
                    );
                    task_log.status = TaskStatus::Fatal;
                    task_log.detail = Some(json!({ "error": message }));
                    let notify = self
                        .stamp_summaries(
                            &db_tx,
                            &member_ids,
                            ExportState::Error,
                            Some(ExportErrorType::AccountingIntegrationError),
                            None,
                        )
                        .await?;
                    (notify, None)
                }
            };

            task_logs::ActiveModel::try_from(&task_log)?
                .update(&db_tx)
                .await?;
            Ok((task_log.status, notify, receipt))
        })
    }

    /// The export task log of a group, if one was ever enqueued.
    pub async fn task_log_for_group(
        &self,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<Option<TaskLog>> {
        with_tx!(self, |db_tx| {
            task_logs::Entity::find()
                .filter(task_logs::Column::AccountId.eq(account_id.to_string()))
                .filter(task_logs::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
                .one(&db_tx)
                .await?
                .map(TaskLog::try_from)
                .transpose()
        })
    }
}
