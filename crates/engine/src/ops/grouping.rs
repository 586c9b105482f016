use chrono::{DateTime, Utc};
use sea_orm::{
    DatabaseTransaction, QueryFilter, QueryOrder, TransactionTrait, prelude::*, sea_query::Expr,
};
use tracing::{debug, info};

use crate::{
    AccountConfig, Expense, ExpenseGroup, ResultEngine, expense_groups,
    expenses::{self, ExportState, FundSource},
    grouping::{GroupingPolicy, partition},
};

use super::{Engine, with_tx};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupingResult {
    pub groups: Vec<ExpenseGroup>,
    /// Expenses skipped by the sign policy. Their SKIPPED summaries are
    /// written but not yet pushed upstream.
    pub skipped_expense_ids: Vec<String>,
}

impl Engine {
    pub(super) async fn mark_skipped(
        &self,
        db: &DatabaseTransaction,
        expense_ids: &[String],
        now: DateTime<Utc>,
    ) -> ResultEngine<Vec<String>> {
        if expense_ids.is_empty() {
            return Ok(Vec::new());
        }
        expenses::Entity::update_many()
            .col_expr(expenses::Column::IsSkipped, Expr::value(true))
            .col_expr(expenses::Column::UpdatedAt, Expr::value(now))
            .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
            .exec(db)
            .await?;
        self.stamp_summaries(db, expense_ids, ExportState::Skipped, None, None)
            .await
    }

    pub(super) async fn group_in_tx(
        &self,
        db: &DatabaseTransaction,
        config: &AccountConfig,
        expense_ids: &[String],
        now: DateTime<Utc>,
    ) -> ResultEngine<GroupingResult> {
        if expense_ids.is_empty() {
            return Ok(GroupingResult::default());
        }
        // Grouped or skipped expenses are never re-examined.
        let models = expenses::Entity::find()
            .filter(expenses::Column::AccountId.eq(config.account_id.clone()))
            .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
            .filter(expenses::Column::IsSkipped.eq(false))
            .filter(expenses::Column::ExpenseGroupId.is_null())
            .order_by_asc(expenses::Column::ExpenseId)
            .all(db)
            .await?;
        let eligible = expenses::to_domain(models)?;

        let personal = GroupingPolicy::for_fund_source(config, FundSource::Personal);
        let corporate_card = GroupingPolicy::for_fund_source(config, FundSource::CorporateCard);
        let outcome = partition(&eligible, personal.as_ref(), corporate_card.as_ref(), now);

        let mut groups = Vec::with_capacity(outcome.groups.len());
        for candidate in outcome.groups {
            let group = ExpenseGroup::new(
                &config.account_id,
                candidate.fund_source,
                candidate.description,
                now,
            );
            expense_groups::ActiveModel::try_from(&group)?
                .insert(db)
                .await?;
            expenses::Entity::update_many()
                .col_expr(expenses::Column::ExpenseGroupId, Expr::value(group.id.clone()))
                .col_expr(expenses::Column::UpdatedAt, Expr::value(now))
                .filter(expenses::Column::ExpenseId.is_in(candidate.expense_ids.iter().cloned()))
                .exec(db)
                .await?;
            debug!(
                expense_group_id = %group.id,
                members = candidate.expense_ids.len(),
                "expense group created"
            );
            groups.push(group);
        }

        self.mark_skipped(db, &outcome.skipped_expense_ids, now)
            .await?;

        info!(
            account_id = %config.account_id,
            groups = groups.len(),
            skipped = outcome.skipped_expense_ids.len(),
            "expenses grouped"
        );
        Ok(GroupingResult {
            groups,
            skipped_expense_ids: outcome.skipped_expense_ids,
        })
    }

    /// Groups the eligible subset of `expenses` per the account's grouping
    /// configuration.
    pub async fn group_expenses(
        &self,
        account_id: &str,
        expenses: &[Expense],
    ) -> ResultEngine<GroupingResult> {
        let now = Utc::now();
        let ids: Vec<String> = expenses.iter().map(|e| e.expense_id.clone()).collect();
        with_tx!(self, |db_tx| {
            let config = self.require_account_config(&db_tx, account_id).await?;
            self.group_in_tx(&db_tx, &config, &ids, now).await
        })
    }

    pub async fn expense_group(
        &self,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<ExpenseGroup> {
        with_tx!(self, |db_tx| {
            let model = self
                .require_group(&db_tx, account_id, expense_group_id)
                .await?;
            ExpenseGroup::try_from(model)
        })
    }

    /// Groups of an account, oldest first.
    pub async fn expense_groups(&self, account_id: &str) -> ResultEngine<Vec<ExpenseGroup>> {
        with_tx!(self, |db_tx| {
            let models = expense_groups::Entity::find()
                .filter(expense_groups::Column::AccountId.eq(account_id.to_string()))
                .order_by_asc(expense_groups::Column::CreatedAt)
                .order_by_asc(expense_groups::Column::Id)
                .all(&db_tx)
                .await?;
            expense_groups::to_domain(models)
        })
    }

    pub async fn expenses_for_group(
        &self,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<Vec<Expense>> {
        with_tx!(self, |db_tx| {
            self.require_group(&db_tx, account_id, expense_group_id)
                .await?;
            let models = self.group_members(&db_tx, expense_group_id).await?;
            expenses::to_domain(models)
        })
    }

    /// Fetches expenses by id, in id order.
    pub async fn expenses(
        &self,
        account_id: &str,
        expense_ids: &[String],
    ) -> ResultEngine<Vec<Expense>> {
        with_tx!(self, |db_tx| {
            let models = expenses::Entity::find()
                .filter(expenses::Column::AccountId.eq(account_id.to_string()))
                .filter(expenses::Column::ExpenseId.is_in(expense_ids.iter().cloned()))
                .order_by_asc(expenses::Column::ExpenseId)
                .all(&db_tx)
                .await?;
            expenses::to_domain(models)
        })
    }
}
