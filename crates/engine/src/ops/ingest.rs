use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue, DatabaseTransaction, QueryFilter, QueryOrder, TransactionTrait, prelude::*,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    AccountConfig, Expense, ExpenseGroup, Money, ResultEngine, TaskLog,
    expenses::{self, FundSource, RawExpense, normalize_custom_properties},
    ports::{ExpenseQuery, SourcePlatform},
    retry::{RetryPolicy, retry_source_call},
    task_logs::{self, TaskStatus, TaskType},
    util::normalize_optional_text,
};

use super::{Engine, with_tx};

/// Per fund source high-water marks of the source platform's
/// `updated_at`. Owned by the caller and passed back in on the next import.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub reimbursable: Option<DateTime<Utc>>,
    pub ccc: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn get(&self, fund_source: FundSource) -> Option<DateTime<Utc>> {
        match fund_source {
            FundSource::Personal => self.reimbursable,
            FundSource::CorporateCard => self.ccc,
        }
    }

    fn advance(&mut self, fund_source: FundSource, seen: DateTime<Utc>) {
        let slot = match fund_source {
            FundSource::Personal => &mut self.reimbursable,
            FundSource::CorporateCard => &mut self.ccc,
        };
        if slot.is_none_or(|current| seen > current) {
            *slot = Some(seen);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportOutcome {
    pub cursor: SyncCursor,
    /// Number of records upserted.
    pub ingested: usize,
    pub groups: Vec<ExpenseGroup>,
    /// Expenses skipped by filters or by the sign policy.
    pub skipped_expense_ids: Vec<String>,
}

fn round_optional(value: Option<f64>) -> Option<i64> {
    value.map(|v| Money::from_major(v).cents())
}

impl Engine {
    pub(super) async fn ingest_in_tx(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        records: Vec<RawExpense>,
        skip_update: bool,
        now: DateTime<Utc>,
    ) -> ResultEngine<Vec<Expense>> {
        let mut ids = Vec::with_capacity(records.len());
        for raw in records {
            let existing = expenses::Entity::find_by_id(raw.id.clone()).one(db).await?;
            let is_new = existing.is_none();
            let mut active: expenses::ActiveModel = match existing {
                Some(model) => model.into(),
                None => expenses::ActiveModel {
                    expense_id: ActiveValue::Set(raw.id.clone()),
                    account_id: ActiveValue::Set(account_id.to_string()),
                    is_skipped: ActiveValue::Set(false),
                    export_summary: ActiveValue::Set(None),
                    previous_export_state: ActiveValue::Set(None),
                    paid_on_ledger: ActiveValue::Set(false),
                    paid_on_source: ActiveValue::Set(false),
                    expense_group_id: ActiveValue::Set(None),
                    created_at: ActiveValue::Set(now),
                    ..Default::default()
                },
            };

            // Historical fields survive correction payloads.
            if is_new || !skip_update {
                active.expense_number = ActiveValue::Set(raw.expense_number.clone());
                active.employee_email = ActiveValue::Set(raw.employee_email.clone());
                active.employee_name = ActiveValue::Set(raw.employee_name.clone());
                active.report_id = ActiveValue::Set(raw.report_id.clone());
                active.report_title = ActiveValue::Set(raw.report_title.clone());
                active.claim_number = ActiveValue::Set(raw.claim_number.clone());
                active.spent_at = ActiveValue::Set(raw.spent_at);
                active.approved_at = ActiveValue::Set(raw.approved_at);
                active.posted_at = ActiveValue::Set(raw.posted_at);
                active.expense_created_at = ActiveValue::Set(raw.created_at);
                active.expense_updated_at = ActiveValue::Set(raw.updated_at);
            }

            active.category = ActiveValue::Set(normalize_optional_text(raw.category));
            active.sub_category = ActiveValue::Set(normalize_optional_text(raw.sub_category));
            active.project = ActiveValue::Set(normalize_optional_text(raw.project));
            active.cost_center = ActiveValue::Set(normalize_optional_text(raw.cost_center));
            active.merchant = ActiveValue::Set(normalize_optional_text(raw.merchant));
            active.purpose = ActiveValue::Set(raw.purpose);
            active.settlement_id = ActiveValue::Set(raw.settlement_id);
            active.corporate_card_id = ActiveValue::Set(raw.corporate_card_id);
            active.bank_transaction_id = ActiveValue::Set(raw.bank_transaction_id);
            active.amount_minor = ActiveValue::Set(Money::from_major(raw.amount).cents());
            active.tax_amount_minor = ActiveValue::Set(round_optional(raw.tax_amount));
            active.tax_group_id = ActiveValue::Set(raw.tax_group_id);
            active.currency = ActiveValue::Set(raw.currency);
            active.foreign_amount_minor = ActiveValue::Set(round_optional(raw.foreign_amount));
            active.foreign_currency = ActiveValue::Set(raw.foreign_currency);
            active.fund_source = ActiveValue::Set(raw.fund_source.as_str().to_string());
            active.state = ActiveValue::Set(raw.state);
            active.billable = ActiveValue::Set(raw.billable);
            active.custom_properties = ActiveValue::Set(serde_json::to_string(
                &normalize_custom_properties(raw.custom_properties),
            )?);
            active.updated_at = ActiveValue::Set(now);

            if is_new {
                active.insert(db).await?;
            } else {
                active.update(db).await?;
            }
            ids.push(raw.id);
        }

        let models = expenses::Entity::find()
            .filter(expenses::Column::ExpenseId.is_in(ids))
            .filter(expenses::Column::IsSkipped.eq(false))
            .filter(expenses::Column::ExpenseGroupId.is_null())
            .order_by_asc(expenses::Column::ExpenseId)
            .all(db)
            .await?;
        expenses::to_domain(models)
    }

    /// Upserts raw source records by external id.
    ///
    /// With `skip_update`, historical fields of existing rows (report and
    /// claim identifiers, employee, dates) are kept. Returns the upserted
    /// expenses that are neither skipped nor grouped yet.
    pub async fn ingest_expenses(
        &self,
        account_id: &str,
        records: Vec<RawExpense>,
        skip_update: bool,
    ) -> ResultEngine<Vec<Expense>> {
        let now = Utc::now();
        let count = records.len();
        let eligible = with_tx!(self, |db_tx| {
            self.ingest_in_tx(&db_tx, account_id, records, skip_update, now)
                .await
        })?;
        info!(account_id, count, eligible = eligible.len(), "expenses ingested");
        Ok(eligible)
    }

    /// Fetches new and updated expenses, then ingests, filters and groups
    /// them under a `FETCHING_EXPENSES` task log.
    pub async fn import_expenses(
        &self,
        account_id: &str,
        cursor: SyncCursor,
        source: &dyn SourcePlatform,
    ) -> ResultEngine<ImportOutcome> {
        let now = Utc::now();
        let (config, mut task_log) = with_tx!(self, |db_tx| {
            let config = self.require_account_config(&db_tx, account_id).await?;
            let task_log = TaskLog::new(
                account_id,
                None,
                TaskType::FetchingExpenses,
                TaskStatus::InProgress,
                now,
            );
            task_logs::ActiveModel::try_from(&task_log)?
                .insert(&db_tx)
                .await?;
            Ok::<_, crate::EngineError>((config, task_log))
        })?;

        let policy = RetryPolicy::new(
            self.settings.export_summary_max_attempts,
            self.settings.export_summary_backoff(),
        );
        let mut next_cursor = cursor;
        let mut records = Vec::new();
        for fund_source in [FundSource::Personal, FundSource::CorporateCard] {
            if config.export_type(fund_source).is_none() {
                continue;
            }
            let query = ExpenseQuery {
                fund_sources: vec![fund_source],
                states: config.expense_states(fund_source).to_vec(),
                updated_since: cursor.get(fund_source),
            };
            let fetched = match retry_source_call(policy, "fetch_expenses", || {
                source.fetch_expenses(account_id, &query)
            })
            .await
            {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(account_id, error = %err, "expense fetch failed");
                    self.fail_fetch_log(&mut task_log, &err).await?;
                    return Err(err.into());
                }
            };
            for raw in &fetched {
                next_cursor.advance(fund_source, raw.updated_at);
            }
            records.extend(fetched);
        }

        let ingested = records.len();
        let (groups, skipped_expense_ids) = match self
            .store_import(account_id, &config, records, &mut task_log, now)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                error!(account_id, error = %err, "expense import failed");
                self.fail_fetch_log(&mut task_log, &err).await?;
                return Err(err);
            }
        };

        self.push_export_summaries(account_id, &skipped_expense_ids, source)
            .await?;

        info!(
            account_id,
            ingested,
            groups = groups.len(),
            skipped = skipped_expense_ids.len(),
            "expense import finished"
        );
        Ok(ImportOutcome {
            cursor: next_cursor,
            ingested,
            groups,
            skipped_expense_ids,
        })
    }

    /// Ingests, filters and groups one fetched batch and completes the fetch
    /// log, all in one transaction.
    async fn store_import(
        &self,
        account_id: &str,
        config: &AccountConfig,
        records: Vec<RawExpense>,
        task_log: &mut TaskLog,
        now: DateTime<Utc>,
    ) -> ResultEngine<(Vec<ExpenseGroup>, Vec<String>)> {
        let ingested = records.len();
        with_tx!(self, |db_tx| {
            let eligible = self
                .ingest_in_tx(&db_tx, account_id, records, false, now)
                .await?;
            let eligible_ids: Vec<String> =
                eligible.iter().map(|e| e.expense_id.clone()).collect();
            let filtered: HashSet<String> = self
                .apply_filters_in_tx(&db_tx, account_id, &eligible_ids, now)
                .await?
                .into_iter()
                .map(|e| e.expense_id)
                .collect();
            let remaining: Vec<String> = eligible_ids
                .into_iter()
                .filter(|id| !filtered.contains(id))
                .collect();
            let grouping = self.group_in_tx(&db_tx, config, &remaining, now).await?;

            let mut skipped: Vec<String> = filtered.into_iter().collect();
            skipped.extend(grouping.skipped_expense_ids);
            skipped.sort();

            task_log.status = TaskStatus::Complete;
            task_log.detail = Some(json!({
                "ingested": ingested,
                "groups": grouping.groups.len(),
                "skipped": skipped.len(),
            }));
            task_log.updated_at = Utc::now();
            task_logs::ActiveModel::try_from(&*task_log)?
                .update(&db_tx)
                .await?;
            Ok((grouping.groups, skipped))
        })
    }

    async fn fail_fetch_log(
        &self,
        task_log: &mut TaskLog,
        error: &dyn std::fmt::Display,
    ) -> ResultEngine<()> {
        task_log.status = TaskStatus::Failed;
        task_log.detail = Some(json!({ "error": error.to_string() }));
        task_log.updated_at = Utc::now();
        with_tx!(self, |db_tx| {
            task_logs::ActiveModel::try_from(&*task_log)?
                .update(&db_tx)
                .await?;
            Ok(())
        })
    }

    /// `FETCHING_EXPENSES` task logs of an account, newest first.
    pub async fn fetch_task_logs(&self, account_id: &str) -> ResultEngine<Vec<TaskLog>> {
        with_tx!(self, |db_tx| {
            task_logs::Entity::find()
                .filter(task_logs::Column::AccountId.eq(account_id.to_string()))
                .filter(task_logs::Column::TaskType.eq(TaskType::FetchingExpenses.as_str()))
                .order_by_desc(task_logs::Column::CreatedAt)
                .all(&db_tx)
                .await?
                .into_iter()
                .map(TaskLog::try_from)
                .collect::<ResultEngine<Vec<_>>>()
        })
    }
}
