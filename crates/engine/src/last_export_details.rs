//! Per-account export summary shown on the dashboard.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};

use crate::{EngineError, macros::impl_str_enum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportMode {
    Manual,
    Auto,
}

impl_str_enum!(ExportMode {
    Manual => "MANUAL",
    Auto => "AUTO",
});

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LastExportDetail {
    pub account_id: String,
    pub last_exported_at: Option<DateTime<Utc>>,
    pub next_export_at: Option<DateTime<Utc>>,
    pub export_mode: Option<ExportMode>,
    pub failed_expense_groups_count: i32,
    pub successful_expense_groups_count: i32,
    pub total_expense_groups_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl LastExportDetail {
    pub fn new(account_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            last_exported_at: None,
            next_export_at: None,
            export_mode: None,
            failed_expense_groups_count: 0,
            successful_expense_groups_count: 0,
            total_expense_groups_count: 0,
            updated_at: now,
        }
    }

    /// Removes dissolved groups from the failed and total counters.
    pub fn discount_failed(&mut self, removed: i32) {
        self.failed_expense_groups_count = (self.failed_expense_groups_count - removed).max(0);
        self.total_expense_groups_count = (self.total_expense_groups_count - removed).max(0);
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "last_export_details")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub account_id: String,
    pub last_exported_at: Option<DateTimeUtc>,
    pub next_export_at: Option<DateTimeUtc>,
    pub export_mode: Option<String>,
    pub failed_expense_groups_count: i32,
    pub successful_expense_groups_count: i32,
    pub total_expense_groups_count: i32,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&LastExportDetail> for ActiveModel {
    fn from(value: &LastExportDetail) -> Self {
        Self {
            account_id: ActiveValue::Set(value.account_id.clone()),
            last_exported_at: ActiveValue::Set(value.last_exported_at),
            next_export_at: ActiveValue::Set(value.next_export_at),
            export_mode: ActiveValue::Set(value.export_mode.map(|m| m.as_str().to_string())),
            failed_expense_groups_count: ActiveValue::Set(value.failed_expense_groups_count),
            successful_expense_groups_count: ActiveValue::Set(
                value.successful_expense_groups_count,
            ),
            total_expense_groups_count: ActiveValue::Set(value.total_expense_groups_count),
            updated_at: ActiveValue::Set(value.updated_at),
        }
    }
}

impl TryFrom<Model> for LastExportDetail {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            export_mode: model
                .export_mode
                .as_deref()
                .map(ExportMode::try_from)
                .transpose()?,
            account_id: model.account_id,
            last_exported_at: model.last_exported_at,
            next_export_at: model.next_export_at,
            failed_expense_groups_count: model.failed_expense_groups_count,
            successful_expense_groups_count: model.successful_expense_groups_count,
            total_expense_groups_count: model.total_expense_groups_count,
            updated_at: model.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_saturates_at_zero() {
        let mut detail = LastExportDetail::new("acc", Utc::now());
        detail.failed_expense_groups_count = 1;
        detail.total_expense_groups_count = 3;

        detail.discount_failed(2);
        assert_eq!(detail.failed_expense_groups_count, 0);
        assert_eq!(detail.total_expense_groups_count, 1);
    }
}
