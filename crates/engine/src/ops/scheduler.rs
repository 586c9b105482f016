use std::collections::HashSet;

use chrono::{Duration, Utc};
use sea_orm::{QueryFilter, QueryOrder, TransactionTrait, prelude::*};
use tracing::{debug, info, warn};

use crate::{
    EngineError, Money, ResultEngine, TaskLog,
    account_configs::TransactionKind,
    expense_groups,
    expenses::{self, ExportErrorType, ExportState},
    export_errors::ErrorKind,
    last_export_details::ExportMode,
    ledger_transactions,
    ports::SourcePlatform,
    task_logs::{self, TaskStatus, TriggerSource},
};

use super::{Engine, ExportJob, with_tx};

/// One scheduling run for an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub account_id: String,
    /// Groups to consider; empty means every unexported group of the account.
    pub expense_group_ids: Vec<String>,
    pub trigger: TriggerSource,
    /// Interval of the automatic export, used to stamp the next run.
    pub interval_hours: Option<i64>,
}

impl ScheduleRequest {
    pub fn new(account_id: &str, trigger: TriggerSource) -> Self {
        Self {
            account_id: account_id.to_string(),
            expense_group_ids: Vec::new(),
            trigger,
            interval_hours: None,
        }
    }

    pub fn groups(mut self, expense_group_ids: Vec<String>) -> Self {
        self.expense_group_ids = expense_group_ids;
        self
    }

    pub fn every(mut self, hours: i64) -> Self {
        self.interval_hours = Some(hours);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Enqueued jobs; the last one carries `is_last`.
    pub jobs: Vec<ExportJob>,
    /// Groups held back by unresolved errors or a missing export type.
    pub skipped_group_ids: Vec<String>,
}

impl Engine {
    /// Enqueues an export task for every eligible group.
    ///
    /// A group is eligible while it is unexported, has no ledger transaction
    /// and no task log in `IN_PROGRESS` or `COMPLETE`. Groups with an
    /// unresolved error are held back until the error is resolved.
    pub async fn schedule_exports(
        &self,
        request: &ScheduleRequest,
        source: &dyn SourcePlatform,
    ) -> ResultEngine<ScheduleOutcome> {
        let now = Utc::now();
        let account_id = request.account_id.as_str();
        if request.interval_hours.is_some_and(|hours| hours <= 0) {
            return Err(EngineError::InvalidConfig(
                "export interval must be positive".to_string(),
            ));
        }

        let (outcome, notify) = with_tx!(self, |db_tx| {
            let config = self.require_account_config(&db_tx, account_id).await?;

            let mut query = expense_groups::Entity::find()
                .filter(expense_groups::Column::AccountId.eq(account_id.to_string()))
                .filter(expense_groups::Column::ExportedAt.is_null());
            if !request.expense_group_ids.is_empty() {
                query = query
                    .filter(expense_groups::Column::Id.is_in(request.expense_group_ids.clone()));
            }
            let groups = expense_groups::to_domain(
                query
                    .order_by_asc(expense_groups::Column::CreatedAt)
                    .order_by_asc(expense_groups::Column::Id)
                    .all(&db_tx)
                    .await?,
            )?;

            let booked: HashSet<String> = ledger_transactions::Entity::find()
                .filter(ledger_transactions::Column::AccountId.eq(account_id.to_string()))
                .all(&db_tx)
                .await?
                .into_iter()
                .map(|tx| tx.expense_group_id)
                .collect();

            let mut outcome = ScheduleOutcome::default();
            let mut notify = Vec::new();
            for group in groups {
                if booked.contains(&group.id) {
                    continue;
                }
                let existing = task_logs::Entity::find()
                    .filter(task_logs::Column::ExpenseGroupId.eq(group.id.clone()))
                    .one(&db_tx)
                    .await?
                    .map(TaskLog::try_from)
                    .transpose()?;
                if existing.as_ref().is_some_and(|log| log.status.is_locked()) {
                    debug!(expense_group_id = %group.id, "export already running or done");
                    continue;
                }

                let members = expenses::to_domain(self.group_members(&db_tx, &group.id).await?)?;
                if members.is_empty() {
                    continue;
                }

                let blocking = self.blocking_errors(&db_tx, account_id, &group.id).await?;
                if !blocking.is_empty() {
                    info!(
                        account_id,
                        expense_group_id = %group.id,
                        errors = blocking.len(),
                        "export held back by unresolved errors"
                    );
                    if request.trigger == TriggerSource::Direct {
                        let error_type = if blocking.iter().any(|e| e.kind == ErrorKind::Mapping) {
                            ExportErrorType::Mapping
                        } else {
                            ExportErrorType::AccountingIntegrationError
                        };
                        let ids: Vec<String> =
                            members.iter().map(|e| e.expense_id.clone()).collect();
                        notify.extend(
                            self.stamp_summaries(
                                &db_tx,
                                &ids,
                                ExportState::Error,
                                Some(error_type),
                                None,
                            )
                            .await?,
                        );
                    }
                    outcome.skipped_group_ids.push(group.id);
                    continue;
                }

                let Some(kind) = config.export_type(group.fund_source) else {
                    warn!(
                        account_id,
                        expense_group_id = %group.id,
                        fund_source = %group.fund_source,
                        "no export type configured"
                    );
                    outcome.skipped_group_ids.push(group.id);
                    continue;
                };
                let total: Money = members.iter().map(|e| e.amount).sum();
                let refund = kind == TransactionKind::CreditCardCharge && total.is_negative();
                let task_type = kind.task_type(refund);

                let task_log = match existing {
                    Some(mut log) => {
                        log.task_type = task_type;
                        log.status = TaskStatus::Enqueued;
                        log.triggered_by = Some(request.trigger);
                        log.updated_at = now;
                        task_logs::ActiveModel::try_from(&log)?
                            .update(&db_tx)
                            .await?;
                        log
                    }
                    None => {
                        let mut log = TaskLog::new(
                            account_id,
                            Some(group.id.clone()),
                            task_type,
                            TaskStatus::Enqueued,
                            now,
                        );
                        log.triggered_by = Some(request.trigger);
                        task_logs::ActiveModel::try_from(&log)?
                            .insert(&db_tx)
                            .await?;
                        log
                    }
                };

                outcome.jobs.push(ExportJob {
                    task_log_id: task_log.id,
                    account_id: account_id.to_string(),
                    expense_group_id: group.id,
                    kind,
                    trigger: request.trigger,
                    is_last: false,
                });
            }

            let (mode, next_export_at) = if request.trigger.is_auto() {
                (
                    ExportMode::Auto,
                    request.interval_hours.map(|hours| now + Duration::hours(hours)),
                )
            } else {
                (ExportMode::Manual, None)
            };
            self.mark_export_run(&db_tx, account_id, mode, next_export_at, now)
                .await?;

            match outcome.jobs.last_mut() {
                Some(last) => last.is_last = true,
                None => {
                    self.recompute_last_export_in_tx(&db_tx, account_id, now)
                        .await?;
                }
            }
            Ok::<_, EngineError>((outcome, notify))
        })?;

        self.push_export_summaries(account_id, &notify, source)
            .await?;

        info!(
            account_id,
            trigger = %request.trigger,
            enqueued = outcome.jobs.len(),
            skipped = outcome.skipped_group_ids.len(),
            "exports scheduled"
        );
        Ok(outcome)
    }
}
