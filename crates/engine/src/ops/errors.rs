use chrono::{DateTime, Utc};
use sea_orm::{
    Condition, DatabaseTransaction, QueryFilter, QueryOrder, TransactionTrait, prelude::*,
    sea_query::Expr,
};
use tracing::info;

use crate::{
    ExportError, ResultEngine,
    export_errors::{self, ErrorKind, MappingSourceType},
    validation::MissingMapping,
};

use super::{Engine, with_tx};

impl Engine {
    /// Unresolved errors that block `expense_group_id`.
    pub(super) async fn blocking_errors(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<Vec<ExportError>> {
        let models = export_errors::Entity::find()
            .filter(export_errors::Column::AccountId.eq(account_id.to_string()))
            .filter(export_errors::Column::IsResolved.eq(false))
            .filter(
                Condition::any()
                    .add(export_errors::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
                    .add(
                        export_errors::Column::AffectedGroupIds
                            .contains(format!("\"{expense_group_id}\"")),
                    ),
            )
            .all(db)
            .await?;
        Ok(export_errors::to_domain(models)?
            .into_iter()
            .filter(|error| error.blocks(expense_group_id))
            .collect())
    }

    /// Creates or re-opens one mapping error per missing mapping and adds the
    /// group to each affected list.
    pub(super) async fn record_mapping_errors(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
        missing: &[MissingMapping],
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        for item in missing {
            let existing = export_errors::Entity::find()
                .filter(export_errors::Column::AccountId.eq(account_id.to_string()))
                .filter(export_errors::Column::Kind.eq(ErrorKind::Mapping.as_str()))
                .filter(export_errors::Column::SourceType.eq(item.source_type.as_str()))
                .filter(export_errors::Column::SourceValue.eq(item.source_value.clone()))
                .one(db)
                .await?;

            match existing {
                Some(model) => {
                    let mut error = ExportError::try_from(model)?;
                    if !error.affected_group_ids.iter().any(|id| id == expense_group_id) {
                        error.affected_group_ids.push(expense_group_id.to_string());
                    }
                    error.repetition_count += 1;
                    error.is_resolved = false;
                    error.updated_at = now;
                    export_errors::ActiveModel::try_from(&error)?
                        .update(db)
                        .await?;
                }
                None => {
                    let error = ExportError::mapping(
                        account_id,
                        item.source_type,
                        &item.source_value,
                        expense_group_id,
                        now,
                    );
                    export_errors::ActiveModel::try_from(&error)?
                        .insert(db)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Creates or re-opens the ledger error of a group.
    pub(super) async fn record_ledger_error(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
        title: String,
        detail: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        let existing = export_errors::Entity::find()
            .filter(export_errors::Column::AccountId.eq(account_id.to_string()))
            .filter(export_errors::Column::Kind.eq(ErrorKind::Ledger.as_str()))
            .filter(export_errors::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
            .one(db)
            .await?;

        match existing {
            Some(model) => {
                let mut error = ExportError::try_from(model)?;
                error.repetition_count += 1;
                error.is_resolved = false;
                error.title = title;
                error.detail = detail;
                error.updated_at = now;
                export_errors::ActiveModel::try_from(&error)?
                    .update(db)
                    .await?;
            }
            None => {
                let error = ExportError::ledger(account_id, expense_group_id, title, detail, now);
                export_errors::ActiveModel::try_from(&error)?
                    .insert(db)
                    .await?;
            }
        }
        Ok(())
    }

    /// Marks every error blocking the group resolved.
    pub(super) async fn resolve_errors_in_tx(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<usize> {
        let blocking = self.blocking_errors(db, account_id, expense_group_id).await?;
        for error in &blocking {
            export_errors::Entity::update_many()
                .col_expr(export_errors::Column::IsResolved, Expr::value(true))
                .col_expr(export_errors::Column::UpdatedAt, Expr::value(now))
                .filter(export_errors::Column::Id.eq(error.id.to_string()))
                .exec(db)
                .await?;
        }
        Ok(blocking.len())
    }

    /// Drops a dissolved group from every error: its ledger errors are
    /// deleted, and mapping errors left without groups are deleted too.
    pub(super) async fn forget_group_errors(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<()> {
        export_errors::Entity::delete_many()
            .filter(export_errors::Column::AccountId.eq(account_id.to_string()))
            .filter(export_errors::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
            .exec(db)
            .await?;

        let models = export_errors::Entity::find()
            .filter(export_errors::Column::AccountId.eq(account_id.to_string()))
            .filter(export_errors::Column::Kind.eq(ErrorKind::Mapping.as_str()))
            .filter(
                export_errors::Column::AffectedGroupIds
                    .contains(format!("\"{expense_group_id}\"")),
            )
            .all(db)
            .await?;
        for model in models {
            let mut error = ExportError::try_from(model)?;
            error
                .affected_group_ids
                .retain(|id| id != expense_group_id);
            if error.affected_group_ids.is_empty() {
                export_errors::Entity::delete_by_id(error.id.to_string())
                    .exec(db)
                    .await?;
            } else {
                export_errors::ActiveModel::try_from(&error)?
                    .update(db)
                    .await?;
            }
        }
        Ok(())
    }

    /// Marks the mapping errors of a source value resolved once the mapping
    /// exists. Returns the groups that were blocked by them.
    pub async fn resolve_mapping_errors(
        &self,
        account_id: &str,
        source_type: MappingSourceType,
        source_value: &str,
    ) -> ResultEngine<Vec<String>> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let models = export_errors::Entity::find()
                .filter(export_errors::Column::AccountId.eq(account_id.to_string()))
                .filter(export_errors::Column::Kind.eq(ErrorKind::Mapping.as_str()))
                .filter(export_errors::Column::SourceType.eq(source_type.as_str()))
                .filter(export_errors::Column::SourceValue.eq(source_value.to_string()))
                .filter(export_errors::Column::IsResolved.eq(false))
                .all(&db_tx)
                .await?;

            let mut unblocked = Vec::new();
            for model in models {
                let mut error = ExportError::try_from(model)?;
                error.is_resolved = true;
                error.updated_at = now;
                unblocked.extend(error.affected_group_ids.iter().cloned());
                export_errors::ActiveModel::try_from(&error)?
                    .update(&db_tx)
                    .await?;
            }
            info!(
                account_id,
                source_type = %source_type,
                source_value,
                groups = unblocked.len(),
                "mapping errors resolved"
            );
            Ok(unblocked)
        })
    }

    /// Marks every error blocking a group resolved.
    pub async fn resolve_group_errors(
        &self,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<usize> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            self.resolve_errors_in_tx(&db_tx, account_id, expense_group_id, now)
                .await
        })
    }

    /// Errors of an account, newest first.
    pub async fn export_errors(
        &self,
        account_id: &str,
        include_resolved: bool,
    ) -> ResultEngine<Vec<ExportError>> {
        with_tx!(self, |db_tx| {
            let mut query = export_errors::Entity::find()
                .filter(export_errors::Column::AccountId.eq(account_id.to_string()));
            if !include_resolved {
                query = query.filter(export_errors::Column::IsResolved.eq(false));
            }
            let models = query
                .order_by_desc(export_errors::Column::UpdatedAt)
                .all(&db_tx)
                .await?;
            export_errors::to_domain(models)
        })
    }
}
