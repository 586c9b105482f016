//! Task logs: the persisted state machine of every export and payment job.
//!
//! ```text
//! (none) -> ENQUEUED -> IN_PROGRESS -> COMPLETE
//!                               \---> FAILED | FATAL
//! ```
//!
//! `IN_PROGRESS` and `COMPLETE` lock the group against re-enqueueing;
//! `FAILED` and `FATAL` are retryable on the next schedule run.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, macros::impl_str_enum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    CreatingBill,
    CreatingExpenseReport,
    CreatingJournalEntry,
    CreatingCreditCardCharge,
    CreatingCreditCardRefund,
    CreatingVendorPayment,
    FetchingExpenses,
}

impl_str_enum!(TaskType {
    CreatingBill => "CREATING_BILL",
    CreatingExpenseReport => "CREATING_EXPENSE_REPORT",
    CreatingJournalEntry => "CREATING_JOURNAL_ENTRY",
    CreatingCreditCardCharge => "CREATING_CREDIT_CARD_CHARGE",
    CreatingCreditCardRefund => "CREATING_CREDIT_CARD_REFUND",
    CreatingVendorPayment => "CREATING_VENDOR_PAYMENT",
    FetchingExpenses => "FETCHING_EXPENSES",
});

impl TaskType {
    /// Task types that represent the export of an expense group.
    pub const EXPORTS: [TaskType; 5] = [
        TaskType::CreatingBill,
        TaskType::CreatingExpenseReport,
        TaskType::CreatingJournalEntry,
        TaskType::CreatingCreditCardCharge,
        TaskType::CreatingCreditCardRefund,
    ];

    pub fn is_export(self) -> bool {
        Self::EXPORTS.contains(&self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Enqueued,
    InProgress,
    Complete,
    Failed,
    Fatal,
}

impl_str_enum!(TaskStatus {
    Enqueued => "ENQUEUED",
    InProgress => "IN_PROGRESS",
    Complete => "COMPLETE",
    Failed => "FAILED",
    Fatal => "FATAL",
});

impl TaskStatus {
    /// Statuses that block a group from being enqueued again.
    pub fn is_locked(self) -> bool {
        matches!(self, Self::InProgress | Self::Complete)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Fatal)
    }
}

/// What started an export run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    /// Manual sync from the dashboard.
    Manual,
    /// Scheduled background export.
    Auto,
    /// Export requested directly from the source platform.
    Direct,
}

impl_str_enum!(TriggerSource {
    Manual => "MANUAL",
    Auto => "AUTO",
    Direct => "DIRECT",
});

impl TriggerSource {
    pub fn is_auto(self) -> bool {
        self == Self::Auto
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskLog {
    pub id: Uuid,
    pub account_id: String,
    pub expense_group_id: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub detail: Option<serde_json::Value>,
    pub ledger_transaction_id: Option<String>,
    pub triggered_by: Option<TriggerSource>,
    pub payment_key: Option<String>,
    pub is_retired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskLog {
    pub fn new(
        account_id: &str,
        expense_group_id: Option<String>,
        task_type: TaskType,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            expense_group_id,
            task_type,
            status,
            detail: None,
            ledger_transaction_id: None,
            triggered_by: None,
            payment_key: None,
            is_retired: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Idempotency key of the vendor payment task of an expense group.
pub fn payment_key(expense_group_id: &str) -> String {
    format!("PAYMENT_{expense_group_id}")
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "task_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub account_id: String,
    pub expense_group_id: Option<String>,
    pub task_type: String,
    pub status: String,
    pub detail: Option<String>,
    pub ledger_transaction_id: Option<String>,
    pub triggered_by: Option<String>,
    pub payment_key: Option<String>,
    pub is_retired: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::expense_groups::Entity",
        from = "Column::ExpenseGroupId",
        to = "super::expense_groups::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    ExpenseGroup,
}

impl Related<super::expense_groups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExpenseGroup.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&TaskLog> for ActiveModel {
    type Error = EngineError;

    fn try_from(value: &TaskLog) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ActiveValue::Set(value.id.to_string()),
            account_id: ActiveValue::Set(value.account_id.clone()),
            expense_group_id: ActiveValue::Set(value.expense_group_id.clone()),
            task_type: ActiveValue::Set(value.task_type.as_str().to_string()),
            status: ActiveValue::Set(value.status.as_str().to_string()),
            detail: ActiveValue::Set(value.detail.as_ref().map(serde_json::to_string).transpose()?),
            ledger_transaction_id: ActiveValue::Set(value.ledger_transaction_id.clone()),
            triggered_by: ActiveValue::Set(value.triggered_by.map(|t| t.as_str().to_string())),
            payment_key: ActiveValue::Set(value.payment_key.clone()),
            is_retired: ActiveValue::Set(value.is_retired),
            created_at: ActiveValue::Set(value.created_at),
            updated_at: ActiveValue::Set(value.updated_at),
        })
    }
}

impl TryFrom<Model> for TaskLog {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: crate::util::parse_uuid(&model.id, "task log")?,
            task_type: TaskType::try_from(model.task_type.as_str())?,
            status: TaskStatus::try_from(model.status.as_str())?,
            detail: model
                .detail
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            triggered_by: model
                .triggered_by
                .as_deref()
                .map(TriggerSource::try_from)
                .transpose()?,
            account_id: model.account_id,
            expense_group_id: model.expense_group_id,
            ledger_transaction_id: model.ledger_transaction_id,
            payment_key: model.payment_key,
            is_retired: model.is_retired,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_statuses() {
        assert!(TaskStatus::InProgress.is_locked());
        assert!(TaskStatus::Complete.is_locked());
        assert!(!TaskStatus::Enqueued.is_locked());
        assert!(!TaskStatus::Failed.is_locked());
        assert!(TaskStatus::Fatal.is_failure());
    }

    #[test]
    fn payment_key_is_derived_from_group() {
        assert_eq!(payment_key("g-1"), "PAYMENT_g-1");
    }

    #[test]
    fn fetching_is_not_an_export() {
        assert!(!TaskType::FetchingExpenses.is_export());
        assert!(!TaskType::CreatingVendorPayment.is_export());
        assert!(TaskType::CreatingCreditCardRefund.is_export());
    }
}
