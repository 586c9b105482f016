//! Payment reconciliation between the ledger and the source platform.
//!
//! Both directions are idempotent: a run only touches rows whose paid flags
//! are still unset, so re-running after a partial failure is safe.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    DatabaseTransaction, QueryFilter, QueryOrder, TransactionTrait, prelude::*, sea_query::Expr,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    EngineError, LedgerTransaction, Money, ResultEngine, TaskLog, expenses, ledger_transactions,
    ports::{Collaborators, MarkPaidFailureReason, PaymentDocument, ReportPayment, VendorPayment},
    task_logs::{self, TaskStatus, TaskType, payment_key},
};

use super::{Engine, with_tx};

/// Report state that confirms a report was reimbursed on the source platform.
const PAID_REPORT_STATE: &str = "PAID";

/// Attempts older than this are retired for good.
const RETIRE_AFTER_DAYS: i64 = 60;
/// Attempts older than this are retried at most once a month.
const MONTHLY_AFTER_DAYS: i64 = 30;
/// Fresh attempts are retried at most once a week.
const WEEKLY_RETRY_DAYS: i64 = 7;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerPaymentSync {
    /// Ledger transactions found paid during this run.
    pub newly_paid: usize,
    /// Reports confirmed paid upstream.
    pub reports_marked: usize,
    /// Reports the platform refused for good; they are marked paid locally.
    pub reports_rejected: usize,
    /// Reports refused for any other reason; the next run offers them again.
    pub reports_pending: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourcePaymentSync {
    /// Consolidated payments posted to the ledger.
    pub payments_posted: usize,
    /// Documents settled by those payments.
    pub documents_paid: usize,
    /// Payment attempts retired during this run.
    pub retired: usize,
    /// Documents held back by backoff or unpaid reports.
    pub deferred: usize,
}

/// Backoff decision for a previous payment attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttemptAge {
    Retry,
    Wait,
    Retire,
}

fn attempt_age(log: &TaskLog, now: DateTime<Utc>) -> AttemptAge {
    let age = now - log.created_at;
    let idle = now - log.updated_at;
    if age > Duration::days(RETIRE_AFTER_DAYS) {
        AttemptAge::Retire
    } else if age > Duration::days(MONTHLY_AFTER_DAYS) {
        if idle >= Duration::days(MONTHLY_AFTER_DAYS) {
            AttemptAge::Retry
        } else {
            AttemptAge::Wait
        }
    } else if idle >= Duration::days(WEEKLY_RETRY_DAYS) {
        AttemptAge::Retry
    } else {
        AttemptAge::Wait
    }
}

impl Engine {
    async fn payable_transactions(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
    ) -> ResultEngine<Vec<LedgerTransaction>> {
        let models = ledger_transactions::Entity::find()
            .filter(ledger_transactions::Column::AccountId.eq(account_id.to_string()))
            .filter(ledger_transactions::Column::PaidOnLedger.eq(false))
            .order_by_asc(ledger_transactions::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(ledger_transactions::to_domain(models)?
            .into_iter()
            .filter(|tx| tx.kind.is_payable())
            .collect())
    }

    async fn payment_log(
        &self,
        db: &DatabaseTransaction,
        expense_group_id: &str,
    ) -> ResultEngine<Option<TaskLog>> {
        task_logs::Entity::find()
            .filter(task_logs::Column::PaymentKey.eq(payment_key(expense_group_id)))
            .one(db)
            .await?
            .map(TaskLog::try_from)
            .transpose()
    }

    /// Polls the ledger for paid transactions and marks the matching reports
    /// paid on the source platform.
    pub async fn sync_ledger_payments_to_source(
        &self,
        account_id: &str,
        collaborators: &Collaborators,
    ) -> ResultEngine<LedgerPaymentSync> {
        self.sync_ledger_payments_to_source_at(account_id, collaborators, Utc::now())
            .await
    }

    pub async fn sync_ledger_payments_to_source_at(
        &self,
        account_id: &str,
        collaborators: &Collaborators,
        now: DateTime<Utc>,
    ) -> ResultEngine<LedgerPaymentSync> {
        let mut outcome = LedgerPaymentSync::default();
        let config = self.account_config(account_id).await?;
        if !config.sync_ledger_payments_to_source {
            debug!(account_id, "ledger to source payment sync disabled");
            return Ok(outcome);
        }

        let unpaid = with_tx!(self, |db_tx| {
            self.payable_transactions(&db_tx, account_id).await
        })?;

        let mut paid = Vec::new();
        for transaction in &unpaid {
            match collaborators
                .ledger
                .transaction_status(account_id, transaction.kind, &transaction.external_id)
                .await
            {
                Ok(status) if status.paid => paid.push(transaction.clone()),
                Ok(_) => {}
                Err(err) => warn!(
                    account_id,
                    external_id = %transaction.external_id,
                    error = %err,
                    "ledger payment status unavailable"
                ),
            }
        }
        outcome.newly_paid = paid.len();

        let reports = with_tx!(self, |db_tx| {
            for transaction in &paid {
                ledger_transactions::Entity::update_many()
                    .col_expr(ledger_transactions::Column::PaidOnLedger, Expr::value(true))
                    .col_expr(ledger_transactions::Column::UpdatedAt, Expr::value(now))
                    .filter(ledger_transactions::Column::Id.eq(transaction.id.to_string()))
                    .exec(&db_tx)
                    .await?;
                expenses::Entity::update_many()
                    .col_expr(expenses::Column::PaidOnLedger, Expr::value(true))
                    .col_expr(expenses::Column::UpdatedAt, Expr::value(now))
                    .filter(
                        expenses::Column::ExpenseGroupId.eq(transaction.expense_group_id.clone()),
                    )
                    .exec(&db_tx)
                    .await?;
            }
            self.reports_ready_to_mark(&db_tx, account_id).await
        })?;

        let (confirmed, rejected, pending) = self
            .mark_reports_paid(account_id, reports, collaborators, now)
            .await;
        outcome.reports_marked = confirmed.len();
        outcome.reports_rejected = rejected.len();
        outcome.reports_pending = pending.len();

        let settled: Vec<String> = confirmed.into_iter().chain(rejected).collect();
        with_tx!(self, |db_tx| {
            self.settle_reports(&db_tx, account_id, &settled, now)
                .await
        })?;

        info!(
            account_id,
            newly_paid = outcome.newly_paid,
            reports_marked = outcome.reports_marked,
            reports_rejected = outcome.reports_rejected,
            reports_pending = outcome.reports_pending,
            "ledger payments synced to source"
        );
        Ok(outcome)
    }

    /// Reports whose expenses are all paid on the ledger and not yet marked
    /// paid upstream.
    async fn reports_ready_to_mark(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
    ) -> ResultEngine<Vec<String>> {
        let pending: BTreeSet<String> = expenses::Entity::find()
            .filter(expenses::Column::AccountId.eq(account_id.to_string()))
            .filter(expenses::Column::PaidOnLedger.eq(true))
            .filter(expenses::Column::PaidOnSource.eq(false))
            .filter(expenses::Column::ReportId.is_not_null())
            .all(db)
            .await?
            .into_iter()
            .filter_map(|model| model.report_id)
            .collect();

        let mut ready = Vec::new();
        for report_id in pending {
            let members = expenses::Entity::find()
                .filter(expenses::Column::AccountId.eq(account_id.to_string()))
                .filter(expenses::Column::ReportId.eq(report_id.clone()))
                .all(db)
                .await?;
            if members.iter().all(|model| model.paid_on_ledger) {
                ready.push(report_id);
            }
        }
        Ok(ready)
    }

    /// Calls the platform until every report is accepted or refused, up to
    /// `mark_paid_max_retries` extra rounds.
    ///
    /// Returns the accepted ids, the ids refused for permission or state
    /// (settled locally, never offered again) and the ids refused for any
    /// other reason (left unpaid for the next run).
    async fn mark_reports_paid(
        &self,
        account_id: &str,
        reports: Vec<String>,
        collaborators: &Collaborators,
        now: DateTime<Utc>,
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let mut remaining = reports;
        let mut confirmed = Vec::new();
        let mut rejected = Vec::new();
        let mut pending = Vec::new();
        let mut attempt = 0;
        while !remaining.is_empty() && attempt <= self.settings.mark_paid_max_retries {
            attempt += 1;
            let batch: Vec<ReportPayment> = remaining
                .iter()
                .map(|report_id| ReportPayment {
                    report_id: report_id.clone(),
                    paid_at: now,
                })
                .collect();
            let response = match collaborators
                .source
                .mark_reports_paid(account_id, &batch)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(account_id, attempt, error = %err, "mark reports paid failed");
                    break;
                }
            };
            if response.failures.is_empty() {
                confirmed.append(&mut remaining);
                break;
            }
            let refused: HashMap<String, MarkPaidFailureReason> = response
                .failures
                .into_iter()
                .map(|failure| (failure.report_id, failure.reason))
                .collect();
            warn!(
                account_id,
                attempt,
                refused = refused.len(),
                "reports refused by the platform, retrying the rest"
            );
            let mut keep = Vec::new();
            for report_id in remaining {
                match refused.get(&report_id) {
                    Some(
                        MarkPaidFailureReason::PermissionDenied
                        | MarkPaidFailureReason::InvalidState,
                    ) => rejected.push(report_id),
                    Some(MarkPaidFailureReason::Other) => pending.push(report_id),
                    None => keep.push(report_id),
                }
            }
            remaining = keep;
        }
        (confirmed, rejected, pending)
    }

    async fn settle_reports(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        report_ids: &[String],
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        if report_ids.is_empty() {
            return Ok(());
        }
        expenses::Entity::update_many()
            .col_expr(expenses::Column::PaidOnSource, Expr::value(true))
            .col_expr(expenses::Column::UpdatedAt, Expr::value(now))
            .filter(expenses::Column::AccountId.eq(account_id.to_string()))
            .filter(expenses::Column::ReportId.is_in(report_ids.iter().cloned()))
            .exec(db)
            .await?;

        let candidates = ledger_transactions::Entity::find()
            .filter(ledger_transactions::Column::AccountId.eq(account_id.to_string()))
            .filter(ledger_transactions::Column::PaidOnLedger.eq(true))
            .filter(ledger_transactions::Column::PaidOnSource.eq(false))
            .all(db)
            .await?;
        for candidate in candidates {
            let members = self.group_members(db, &candidate.expense_group_id).await?;
            if !members.is_empty() && members.iter().all(|model| model.paid_on_source) {
                ledger_transactions::Entity::update_many()
                    .col_expr(ledger_transactions::Column::PaidOnSource, Expr::value(true))
                    .col_expr(ledger_transactions::Column::UpdatedAt, Expr::value(now))
                    .filter(ledger_transactions::Column::Id.eq(candidate.id))
                    .exec(db)
                    .await?;
            }
        }
        Ok(())
    }

    /// Posts one consolidated payment per ledger entity for exported
    /// documents whose reports are paid on the source platform.
    pub async fn sync_source_payments_to_ledger(
        &self,
        account_id: &str,
        collaborators: &Collaborators,
    ) -> ResultEngine<SourcePaymentSync> {
        self.sync_source_payments_to_ledger_at(account_id, collaborators, Utc::now())
            .await
    }

    pub async fn sync_source_payments_to_ledger_at(
        &self,
        account_id: &str,
        collaborators: &Collaborators,
        now: DateTime<Utc>,
    ) -> ResultEngine<SourcePaymentSync> {
        let mut outcome = SourcePaymentSync::default();
        let config = self.account_config(account_id).await?;
        if !config.sync_source_payments_to_ledger {
            debug!(account_id, "source to ledger payment sync disabled");
            return Ok(outcome);
        }

        let (due, retired, deferred) = with_tx!(self, |db_tx| {
            let mut due: Vec<(LedgerTransaction, Vec<String>)> = Vec::new();
            let mut retired = 0;
            let mut deferred = 0;
            for transaction in self.payable_transactions(&db_tx, account_id).await? {
                if transaction.payment_synced {
                    continue;
                }
                if let Some(mut log) = self
                    .payment_log(&db_tx, &transaction.expense_group_id)
                    .await?
                {
                    if log.is_retired {
                        continue;
                    }
                    match attempt_age(&log, now) {
                        AttemptAge::Retry => {}
                        AttemptAge::Wait => {
                            deferred += 1;
                            continue;
                        }
                        AttemptAge::Retire => {
                            log.is_retired = true;
                            log.updated_at = now;
                            task_logs::ActiveModel::try_from(&log)?
                                .update(&db_tx)
                                .await?;
                            info!(
                                account_id,
                                expense_group_id = %transaction.expense_group_id,
                                "payment attempt retired"
                            );
                            retired += 1;
                            continue;
                        }
                    }
                }
                let reports: BTreeSet<String> = self
                    .group_members(&db_tx, &transaction.expense_group_id)
                    .await?
                    .into_iter()
                    .filter_map(|model| model.report_id)
                    .collect();
                due.push((transaction, reports.into_iter().collect()));
            }
            Ok::<_, EngineError>((due, retired, deferred))
        })?;
        outcome.retired = retired;
        outcome.deferred = deferred;
        if due.is_empty() {
            return Ok(outcome);
        }

        // The local paid flags are not trusted; report states are re-read.
        let report_ids: Vec<String> = due
            .iter()
            .flat_map(|(_, reports)| reports.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let states = match collaborators
            .source
            .report_states(account_id, &report_ids)
            .await
        {
            Ok(states) => states,
            Err(err) => {
                warn!(account_id, error = %err, "report states unavailable");
                outcome.deferred += due.len();
                return Ok(outcome);
            }
        };

        let mut by_entity: BTreeMap<(String, String), Vec<LedgerTransaction>> = BTreeMap::new();
        for (transaction, reports) in due {
            let all_paid = !reports.is_empty()
                && reports
                    .iter()
                    .all(|id| states.get(id).map(String::as_str) == Some(PAID_REPORT_STATE));
            if all_paid {
                by_entity
                    .entry((transaction.entity_id.clone(), transaction.currency.clone()))
                    .or_default()
                    .push(transaction);
            } else {
                outcome.deferred += 1;
            }
        }

        for ((entity_id, currency), documents) in by_entity {
            let settled = self
                .post_vendor_payment(
                    account_id,
                    &entity_id,
                    &currency,
                    documents,
                    collaborators,
                    now,
                )
                .await?;
            if settled > 0 {
                outcome.payments_posted += 1;
                outcome.documents_paid += settled;
            }
        }

        info!(
            account_id,
            payments = outcome.payments_posted,
            documents = outcome.documents_paid,
            retired = outcome.retired,
            deferred = outcome.deferred,
            "source payments synced to ledger"
        );
        Ok(outcome)
    }

    /// Posts one payment for `documents`. Returns how many were settled.
    async fn post_vendor_payment(
        &self,
        account_id: &str,
        entity_id: &str,
        currency: &str,
        documents: Vec<LedgerTransaction>,
        collaborators: &Collaborators,
        now: DateTime<Utc>,
    ) -> ResultEngine<usize> {
        let mut logs = with_tx!(self, |db_tx| {
            let mut logs = Vec::with_capacity(documents.len());
            for document in &documents {
                let log = match self.payment_log(&db_tx, &document.expense_group_id).await? {
                    Some(mut log) => {
                        log.status = TaskStatus::InProgress;
                        log.updated_at = now;
                        task_logs::ActiveModel::try_from(&log)?
                            .update(&db_tx)
                            .await?;
                        log
                    }
                    None => {
                        let mut log = TaskLog::new(
                            account_id,
                            None,
                            TaskType::CreatingVendorPayment,
                            TaskStatus::InProgress,
                            now,
                        );
                        log.payment_key = Some(payment_key(&document.expense_group_id));
                        task_logs::ActiveModel::try_from(&log)?
                            .insert(&db_tx)
                            .await?;
                        log
                    }
                };
                logs.push(log);
            }
            Ok::<_, EngineError>(logs)
        })?;

        let payment = VendorPayment {
            entity_id: entity_id.to_string(),
            currency: currency.to_string(),
            amount: documents.iter().map(|d| d.amount).sum::<Money>(),
            payment_date: now,
            documents: documents
                .iter()
                .map(|d| PaymentDocument {
                    external_id: d.external_id.clone(),
                    kind: d.kind,
                    amount: d.amount,
                })
                .collect(),
        };
        let result = collaborators
            .ledger
            .post_vendor_payment(account_id, &payment)
            .await;

        with_tx!(self, |db_tx| {
            let settled = match &result {
                Ok(receipt) => {
                    for document in &documents {
                        ledger_transactions::Entity::update_many()
                            .col_expr(ledger_transactions::Column::PaidOnLedger, Expr::value(true))
                            .col_expr(ledger_transactions::Column::PaymentSynced, Expr::value(true))
                            .col_expr(ledger_transactions::Column::UpdatedAt, Expr::value(now))
                            .filter(ledger_transactions::Column::Id.eq(document.id.to_string()))
                            .exec(&db_tx)
                            .await?;
                        expenses::Entity::update_many()
                            .col_expr(expenses::Column::PaidOnLedger, Expr::value(true))
                            .col_expr(expenses::Column::UpdatedAt, Expr::value(now))
                            .filter(
                                expenses::Column::ExpenseGroupId
                                    .eq(document.expense_group_id.clone()),
                            )
                            .exec(&db_tx)
                            .await?;
                    }
                    for log in &mut logs {
                        log.status = TaskStatus::Complete;
                        log.detail = Some(receipt.raw.clone());
                    }
                    info!(
                        account_id,
                        entity_id,
                        documents = documents.len(),
                        "vendor payment posted"
                    );
                    documents.len()
                }
                Err(err) => {
                    let status = if err.is_expected() {
                        TaskStatus::Failed
                    } else {
                        TaskStatus::Fatal
                    };
                    warn!(account_id, entity_id, error = %err, "vendor payment failed");
                    for log in &mut logs {
                        log.status = status;
                        log.detail = Some(json!({
                            "error": err.to_string(),
                            "detail": err.detail(),
                        }));
                    }
                    0
                }
            };
            for log in &mut logs {
                log.updated_at = now;
                task_logs::ActiveModel::try_from(&*log)?
                    .update(&db_tx)
                    .await?;
            }
            Ok(settled)
        })
    }

    /// The vendor payment task log of an exported group.
    pub async fn payment_task_log(
        &self,
        expense_group_id: &str,
    ) -> ResultEngine<Option<TaskLog>> {
        with_tx!(self, |db_tx| {
            self.payment_log(&db_tx, expense_group_id).await
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn log(created_days_ago: i64, updated_days_ago: i64, now: DateTime<Utc>) -> TaskLog {
        let mut log = TaskLog::new(
            "acc",
            None,
            TaskType::CreatingVendorPayment,
            TaskStatus::Failed,
            now - Duration::days(created_days_ago),
        );
        log.updated_at = now - Duration::days(updated_days_ago);
        log
    }

    #[test]
    fn attempts_back_off_by_age() {
        let now = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();

        assert_eq!(attempt_age(&log(61, 1, now), now), AttemptAge::Retire);
        assert_eq!(attempt_age(&log(61, 61, now), now), AttemptAge::Retire);

        assert_eq!(attempt_age(&log(45, 10, now), now), AttemptAge::Wait);
        assert_eq!(attempt_age(&log(45, 31, now), now), AttemptAge::Retry);

        assert_eq!(attempt_age(&log(10, 3, now), now), AttemptAge::Wait);
        assert_eq!(attempt_age(&log(10, 8, now), now), AttemptAge::Retry);
    }
}
