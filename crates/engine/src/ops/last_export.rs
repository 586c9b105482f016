use chrono::{DateTime, Utc};
use sea_orm::{DatabaseTransaction, PaginatorTrait, QueryFilter, TransactionTrait, prelude::*};
use tracing::debug;

use crate::{
    LastExportDetail, ResultEngine, last_export_details,
    last_export_details::ExportMode,
    task_logs::{self, TaskStatus, TaskType},
};

use super::{Engine, with_tx};

impl Engine {
    async fn load_last_export(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<(LastExportDetail, bool)> {
        match last_export_details::Entity::find_by_id(account_id.to_string())
            .one(db)
            .await?
        {
            Some(model) => Ok((LastExportDetail::try_from(model)?, true)),
            None => Ok((LastExportDetail::new(account_id, now), false)),
        }
    }

    async fn save_last_export(
        &self,
        db: &DatabaseTransaction,
        detail: &LastExportDetail,
        exists: bool,
    ) -> ResultEngine<()> {
        let active = last_export_details::ActiveModel::from(detail);
        if exists {
            active.update(db).await?;
        } else {
            active.insert(db).await?;
        }
        Ok(())
    }

    /// Stamps the start of an export run.
    pub(super) async fn mark_export_run(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        mode: ExportMode,
        next_export_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        let (mut detail, exists) = self.load_last_export(db, account_id, now).await?;
        detail.last_exported_at = Some(now);
        detail.export_mode = Some(mode);
        detail.next_export_at = next_export_at;
        detail.updated_at = now;
        self.save_last_export(db, &detail, exists).await
    }

    /// Removes dissolved failed groups from the counters.
    pub(super) async fn discount_failed_groups(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        removed: i32,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        if removed == 0 {
            return Ok(());
        }
        let Some(model) = last_export_details::Entity::find_by_id(account_id.to_string())
            .one(db)
            .await?
        else {
            return Ok(());
        };
        let mut detail = LastExportDetail::try_from(model)?;
        detail.discount_failed(removed);
        detail.updated_at = now;
        self.save_last_export(db, &detail, true).await
    }

    pub(super) async fn recompute_last_export_in_tx(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<LastExportDetail> {
        let (mut detail, exists) = self.load_last_export(db, account_id, now).await?;
        let export_types = TaskType::EXPORTS.iter().map(|t| t.as_str());

        let failed = task_logs::Entity::find()
            .filter(task_logs::Column::AccountId.eq(account_id.to_string()))
            .filter(task_logs::Column::TaskType.is_in(export_types.clone()))
            .filter(task_logs::Column::Status.is_in([
                TaskStatus::Failed.as_str(),
                TaskStatus::Fatal.as_str(),
            ]))
            .count(db)
            .await?;

        let mut successful_query = task_logs::Entity::find()
            .filter(task_logs::Column::AccountId.eq(account_id.to_string()))
            .filter(task_logs::Column::TaskType.is_in(export_types))
            .filter(task_logs::Column::Status.eq(TaskStatus::Complete.as_str()));
        if let Some(since) = detail.last_exported_at {
            successful_query = successful_query.filter(task_logs::Column::UpdatedAt.gte(since));
        }
        let successful = successful_query.count(db).await?;

        detail.failed_expense_groups_count = i32::try_from(failed).unwrap_or(i32::MAX);
        detail.successful_expense_groups_count = i32::try_from(successful).unwrap_or(i32::MAX);
        detail.total_expense_groups_count = detail
            .failed_expense_groups_count
            .saturating_add(detail.successful_expense_groups_count);
        detail.updated_at = now;
        self.save_last_export(db, &detail, exists).await?;

        debug!(
            account_id,
            failed = detail.failed_expense_groups_count,
            successful = detail.successful_expense_groups_count,
            "last export detail recomputed"
        );
        Ok(detail)
    }

    /// Recounts failed and successful groups since the last export run.
    pub async fn recompute_last_export_detail(
        &self,
        account_id: &str,
    ) -> ResultEngine<LastExportDetail> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            self.recompute_last_export_in_tx(&db_tx, account_id, now)
                .await
        })
    }

    pub async fn last_export_detail(
        &self,
        account_id: &str,
    ) -> ResultEngine<Option<LastExportDetail>> {
        with_tx!(self, |db_tx| {
            last_export_details::Entity::find_by_id(account_id.to_string())
                .one(&db_tx)
                .await?
                .map(LastExportDetail::try_from)
                .transpose()
        })
    }
}
