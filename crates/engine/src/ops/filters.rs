use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use sea_orm::{
    DatabaseTransaction, QueryFilter, QueryOrder, TransactionTrait, prelude::*, sea_query::Expr,
};
use tracing::info;

use crate::{
    EngineError, Expense, ExpenseFilter, ResultEngine, expense_filters,
    expense_filters::{MAX_FILTERS_PER_ACCOUNT, NewExpenseFilter},
    expense_groups, expenses,
    filter::{build_filter_query, build_predicate},
    task_logs::{self, TaskStatus},
};

use super::{Engine, with_tx};

#[derive(Clone, Debug, PartialEq)]
pub struct FilterUpdate {
    pub filter: ExpenseFilter,
    /// Expenses newly skipped by the re-evaluation, if one ran.
    pub skipped_expense_ids: Vec<String>,
}

impl Engine {
    async fn load_filters(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
    ) -> ResultEngine<Vec<ExpenseFilter>> {
        let models = expense_filters::Entity::find()
            .filter(expense_filters::Column::AccountId.eq(account_id.to_string()))
            .order_by_asc(expense_filters::Column::Rank)
            .all(db)
            .await?;
        expense_filters::to_domain(models)
    }

    /// Marks the ungrouped, not yet skipped candidates matching the account's
    /// filters skipped. Returns the matched expenses.
    pub(super) async fn apply_filters_in_tx(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        candidate_ids: &[String],
        now: DateTime<Utc>,
    ) -> ResultEngine<Vec<Expense>> {
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }
        let filters = self.load_filters(db, account_id).await?;
        let Some(query) = build_filter_query(&filters)? else {
            return Ok(Vec::new());
        };

        let models = expenses::Entity::find()
            .filter(expenses::Column::AccountId.eq(account_id.to_string()))
            .filter(expenses::Column::ExpenseId.is_in(candidate_ids.iter().cloned()))
            .filter(expenses::Column::IsSkipped.eq(false))
            .filter(expenses::Column::ExpenseGroupId.is_null())
            .order_by_asc(expenses::Column::ExpenseId)
            .all(db)
            .await?;
        let matched: Vec<String> = expenses::to_domain(models)?
            .into_iter()
            .filter(|expense| query.matches(expense))
            .map(|expense| expense.expense_id)
            .collect();

        self.mark_skipped(db, &matched, now).await?;
        self.reload_expenses(db, &matched).await
    }

    async fn reload_expenses(
        &self,
        db: &DatabaseTransaction,
        expense_ids: &[String],
    ) -> ResultEngine<Vec<Expense>> {
        if expense_ids.is_empty() {
            return Ok(Vec::new());
        }
        let models = expenses::Entity::find()
            .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
            .order_by_asc(expenses::Column::ExpenseId)
            .all(db)
            .await?;
        expenses::to_domain(models)
    }

    /// Re-runs the filters over every unexported, not yet skipped expense of
    /// the account. Matched expenses leave their group; groups left empty are
    /// deleted together with their task logs and errors.
    async fn reevaluate_filters(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<Vec<String>> {
        let filters = self.load_filters(db, account_id).await?;
        let Some(query) = build_filter_query(&filters)? else {
            return Ok(Vec::new());
        };

        let frozen = self.frozen_groups(db, account_id).await?;
        let models = expenses::Entity::find()
            .filter(expenses::Column::AccountId.eq(account_id.to_string()))
            .filter(expenses::Column::IsSkipped.eq(false))
            .order_by_asc(expenses::Column::ExpenseId)
            .all(db)
            .await?;
        let matched: Vec<Expense> = expenses::to_domain(models)?
            .into_iter()
            .filter(|expense| match &expense.expense_group_id {
                Some(group_id) => !frozen.contains(group_id),
                None => true,
            })
            .filter(|expense| query.matches(expense))
            .collect();
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let matched_ids: Vec<String> = matched.iter().map(|e| e.expense_id.clone()).collect();
        let touched_groups: BTreeSet<String> = matched
            .iter()
            .filter_map(|e| e.expense_group_id.clone())
            .collect();

        expenses::Entity::update_many()
            .col_expr(expenses::Column::ExpenseGroupId, Expr::value(Option::<String>::None))
            .filter(expenses::Column::ExpenseId.is_in(matched_ids.iter().cloned()))
            .exec(db)
            .await?;
        self.mark_skipped(db, &matched_ids, now).await?;

        let mut failed_removed = 0;
        for group_id in &touched_groups {
            if !self.group_members(db, group_id).await?.is_empty() {
                continue;
            }
            failed_removed += self.dissolve_group(db, account_id, group_id).await?;
        }
        self.discount_failed_groups(db, account_id, failed_removed, now)
            .await?;

        info!(
            account_id,
            skipped = matched_ids.len(),
            groups_touched = touched_groups.len(),
            "filters re-evaluated"
        );
        Ok(matched_ids)
    }

    /// Groups that are exported or locked by a running or finished export.
    async fn frozen_groups(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
    ) -> ResultEngine<HashSet<String>> {
        let mut frozen: HashSet<String> = expense_groups::Entity::find()
            .filter(expense_groups::Column::AccountId.eq(account_id.to_string()))
            .filter(expense_groups::Column::ExportedAt.is_not_null())
            .all(db)
            .await?
            .into_iter()
            .map(|group| group.id)
            .collect();
        let locked = task_logs::Entity::find()
            .filter(task_logs::Column::AccountId.eq(account_id.to_string()))
            .filter(task_logs::Column::ExpenseGroupId.is_not_null())
            .filter(task_logs::Column::Status.is_in([
                TaskStatus::InProgress.as_str(),
                TaskStatus::Complete.as_str(),
            ]))
            .all(db)
            .await?;
        frozen.extend(locked.into_iter().filter_map(|log| log.expense_group_id));
        Ok(frozen)
    }

    /// Deletes an empty group with its task logs and errors. Returns how many
    /// failed task logs went with it.
    async fn dissolve_group(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<i32> {
        let failed = task_logs::Entity::find()
            .filter(task_logs::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
            .filter(task_logs::Column::Status.is_in([
                TaskStatus::Failed.as_str(),
                TaskStatus::Fatal.as_str(),
            ]))
            .all(db)
            .await?
            .len();
        task_logs::Entity::delete_many()
            .filter(task_logs::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
            .exec(db)
            .await?;
        self.forget_group_errors(db, account_id, expense_group_id)
            .await?;
        expense_groups::Entity::delete_by_id(expense_group_id.to_string())
            .exec(db)
            .await?;
        info!(account_id, expense_group_id, "empty expense group deleted");
        Ok(i32::try_from(failed).unwrap_or(i32::MAX))
    }

    /// Creates or replaces the filter at `input.rank`.
    ///
    /// Saving a filter without a join (the last filter of the chain) re-runs
    /// the whole chain over the account's unexported expenses.
    pub async fn upsert_expense_filter(
        &self,
        account_id: &str,
        input: NewExpenseFilter,
    ) -> ResultEngine<FilterUpdate> {
        input.validate()?;
        let now = Utc::now();
        let reevaluate = input.join_by.is_none();
        let mut filter = ExpenseFilter::new(account_id, input, now);
        build_predicate(&filter)?;

        with_tx!(self, |db_tx| {
            let existing = self.load_filters(&db_tx, account_id).await?;
            match existing.iter().find(|f| f.rank == filter.rank) {
                Some(current) => {
                    filter.id = current.id;
                    filter.created_at = current.created_at;
                    expense_filters::ActiveModel::try_from(&filter)?
                        .update(&db_tx)
                        .await?;
                }
                None if existing.len() >= MAX_FILTERS_PER_ACCOUNT => {
                    return Err(EngineError::InvalidFilter(format!(
                        "an account has at most {MAX_FILTERS_PER_ACCOUNT} filters"
                    )));
                }
                None => {
                    expense_filters::ActiveModel::try_from(&filter)?
                        .insert(&db_tx)
                        .await?;
                }
            }

            let skipped_expense_ids = if reevaluate {
                self.reevaluate_filters(&db_tx, account_id, now).await?
            } else {
                Vec::new()
            };
            Ok(FilterUpdate {
                filter: filter.clone(),
                skipped_expense_ids,
            })
        })
    }

    /// Filters of an account, in rank order.
    pub async fn expense_filters(&self, account_id: &str) -> ResultEngine<Vec<ExpenseFilter>> {
        with_tx!(self, |db_tx| { self.load_filters(&db_tx, account_id).await })
    }

    pub async fn delete_expense_filters(&self, account_id: &str) -> ResultEngine<u64> {
        with_tx!(self, |db_tx| {
            let result = expense_filters::Entity::delete_many()
                .filter(expense_filters::Column::AccountId.eq(account_id.to_string()))
                .exec(&db_tx)
                .await?;
            info!(account_id, deleted = result.rows_affected, "expense filters deleted");
            Ok(result.rows_affected)
        })
    }

    /// Marks the ungrouped candidates that match the account's filters
    /// skipped, with a SKIPPED summary. Returns the skipped expenses.
    pub async fn apply_skip_filters(
        &self,
        account_id: &str,
        candidate_ids: &[String],
    ) -> ResultEngine<Vec<Expense>> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            self.apply_filters_in_tx(&db_tx, account_id, candidate_ids, now)
                .await
        })
    }
}
