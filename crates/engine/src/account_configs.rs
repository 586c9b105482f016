//! Per-account export configuration.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};

use crate::{
    EngineError, ResultEngine, expenses::FundSource, macros::impl_str_enum, task_logs::TaskType,
};

/// Destination transaction kind of an export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Bill,
    ExpenseReport,
    JournalEntry,
    CreditCardCharge,
}

impl_str_enum!(TransactionKind {
    Bill => "BILL",
    ExpenseReport => "EXPENSE_REPORT",
    JournalEntry => "JOURNAL_ENTRY",
    CreditCardCharge => "CREDIT_CARD_CHARGE",
});

impl TransactionKind {
    /// Task type of the export job; card charges with a negative total are
    /// exported as refunds.
    pub fn task_type(self, refund: bool) -> TaskType {
        match self {
            Self::Bill => TaskType::CreatingBill,
            Self::ExpenseReport => TaskType::CreatingExpenseReport,
            Self::JournalEntry => TaskType::CreatingJournalEntry,
            Self::CreditCardCharge if refund => TaskType::CreatingCreditCardRefund,
            Self::CreditCardCharge => TaskType::CreatingCreditCardCharge,
        }
    }

    /// Kinds that the ledger settles through a vendor/employee payment.
    pub fn is_payable(self) -> bool {
        matches!(self, Self::Bill | Self::ExpenseReport)
    }
}

/// Whether employees are represented as employees or vendors on the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmployeeFieldMapping {
    Employee,
    Vendor,
}

impl_str_enum!(EmployeeFieldMapping {
    Employee => "EMPLOYEE",
    Vendor => "VENDOR",
});

/// The closed set of attributes expenses can be grouped by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingField {
    EmployeeEmail,
    ReportId,
    ClaimNumber,
    FundSource,
    ExpenseId,
    ExpenseNumber,
    SpentAt,
    ApprovedAt,
    PostedAt,
    SettlementId,
    Category,
    Project,
    CostCenter,
    CorporateCardId,
    BankTransactionId,
}

impl_str_enum!(GroupingField {
    EmployeeEmail => "employee_email",
    ReportId => "report_id",
    ClaimNumber => "claim_number",
    FundSource => "fund_source",
    ExpenseId => "expense_id",
    ExpenseNumber => "expense_number",
    SpentAt => "spent_at",
    ApprovedAt => "approved_at",
    PostedAt => "posted_at",
    SettlementId => "settlement_id",
    Category => "category",
    Project => "project",
    CostCenter => "cost_center",
    CorporateCardId => "corporate_card_id",
    BankTransactionId => "bank_transaction_id",
});

impl GroupingField {
    pub fn is_date(self) -> bool {
        matches!(self, Self::SpentAt | Self::ApprovedAt | Self::PostedAt)
    }
}

/// Which date becomes the transaction date of an exported group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportDateType {
    CurrentDate,
    SpentAt,
    ApprovedAt,
    PostedAt,
    LastSpentAt,
}

impl_str_enum!(ExportDateType {
    CurrentDate => "current_date",
    SpentAt => "spent_at",
    ApprovedAt => "approved_at",
    PostedAt => "posted_at",
    LastSpentAt => "last_spent_at",
});

impl ExportDateType {
    /// The grouping field implied by this date type, if any.
    ///
    /// `last_spent_at` is computed per group and never part of the key.
    pub fn grouping_field(self) -> Option<GroupingField> {
        match self {
            Self::SpentAt => Some(GroupingField::SpentAt),
            Self::ApprovedAt => Some(GroupingField::ApprovedAt),
            Self::PostedAt => Some(GroupingField::PostedAt),
            Self::CurrentDate | Self::LastSpentAt => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingSettings {
    pub fields: Vec<GroupingField>,
    pub date_type: ExportDateType,
}

impl GroupingSettings {
    /// Configured fields plus the one implied by the export date type,
    /// without duplicates.
    pub fn effective_fields(&self) -> Vec<GroupingField> {
        let mut fields: Vec<GroupingField> = Vec::with_capacity(self.fields.len() + 1);
        for field in self
            .fields
            .iter()
            .copied()
            .chain(self.date_type.grouping_field())
        {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccountConfig {
    pub account_id: String,
    pub reimbursable_export_type: Option<TransactionKind>,
    pub ccc_export_type: Option<TransactionKind>,
    pub reimbursable_grouping: GroupingSettings,
    pub ccc_grouping: GroupingSettings,
    pub split_ccc_by_bank_transaction: bool,
    pub employee_field_mapping: EmployeeFieldMapping,
    pub tax_override_enabled: bool,
    pub auto_correct_accounting_period: bool,
    pub sync_ledger_payments_to_source: bool,
    pub sync_source_payments_to_ledger: bool,
    pub default_ccc_account_id: Option<String>,
    pub default_ccc_vendor_id: Option<String>,
    pub reimbursable_expense_states: Vec<String>,
    pub ccc_expense_states: Vec<String>,
}

impl AccountConfig {
    /// A configuration with the usual defaults: reimbursable expenses
    /// exported as bills grouped per report, card expenses not exported.
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            reimbursable_export_type: Some(TransactionKind::Bill),
            ccc_export_type: None,
            reimbursable_grouping: GroupingSettings {
                fields: vec![
                    GroupingField::EmployeeEmail,
                    GroupingField::ReportId,
                    GroupingField::ClaimNumber,
                    GroupingField::FundSource,
                ],
                date_type: ExportDateType::CurrentDate,
            },
            ccc_grouping: GroupingSettings {
                fields: vec![
                    GroupingField::EmployeeEmail,
                    GroupingField::ReportId,
                    GroupingField::ExpenseId,
                    GroupingField::FundSource,
                ],
                date_type: ExportDateType::SpentAt,
            },
            split_ccc_by_bank_transaction: false,
            employee_field_mapping: EmployeeFieldMapping::Vendor,
            tax_override_enabled: false,
            auto_correct_accounting_period: false,
            sync_ledger_payments_to_source: false,
            sync_source_payments_to_ledger: false,
            default_ccc_account_id: None,
            default_ccc_vendor_id: None,
            reimbursable_expense_states: vec!["PAYMENT_PROCESSING".to_string()],
            ccc_expense_states: vec!["APPROVED".to_string(), "PAYMENT_PROCESSING".to_string()],
        }
    }

    pub fn export_type(&self, fund_source: FundSource) -> Option<TransactionKind> {
        match fund_source {
            FundSource::Personal => self.reimbursable_export_type,
            FundSource::CorporateCard => self.ccc_export_type,
        }
    }

    pub fn grouping(&self, fund_source: FundSource) -> &GroupingSettings {
        match fund_source {
            FundSource::Personal => &self.reimbursable_grouping,
            FundSource::CorporateCard => &self.ccc_grouping,
        }
    }

    pub fn expense_states(&self, fund_source: FundSource) -> &[String] {
        match fund_source {
            FundSource::Personal => &self.reimbursable_expense_states,
            FundSource::CorporateCard => &self.ccc_expense_states,
        }
    }

    /// Groups of this kind must not carry a negative total.
    pub fn requires_non_negative(&self, kind: TransactionKind) -> bool {
        match kind {
            TransactionKind::Bill => true,
            TransactionKind::JournalEntry => {
                self.employee_field_mapping == EmployeeFieldMapping::Vendor
            }
            TransactionKind::ExpenseReport | TransactionKind::CreditCardCharge => false,
        }
    }

    pub(crate) fn validate(&self) -> ResultEngine<()> {
        if self.account_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "account id must not be empty".to_string(),
            ));
        }
        if self.reimbursable_export_type == Some(TransactionKind::CreditCardCharge) {
            return Err(EngineError::InvalidConfig(
                "reimbursable expenses cannot be exported as credit card charges".to_string(),
            ));
        }
        if self.reimbursable_export_type == Some(TransactionKind::ExpenseReport)
            && self.employee_field_mapping == EmployeeFieldMapping::Vendor
        {
            return Err(EngineError::InvalidConfig(
                "expense reports require employees mapped as EMPLOYEE".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "account_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub account_id: String,
    pub reimbursable_export_type: Option<String>,
    pub ccc_export_type: Option<String>,
    pub reimbursable_grouping: String,
    pub ccc_grouping: String,
    pub split_ccc_by_bank_transaction: bool,
    pub employee_field_mapping: String,
    pub tax_override_enabled: bool,
    pub auto_correct_accounting_period: bool,
    pub sync_ledger_payments_to_source: bool,
    pub sync_source_payments_to_ledger: bool,
    pub default_ccc_account_id: Option<String>,
    pub default_ccc_vendor_id: Option<String>,
    pub reimbursable_expense_states: String,
    pub ccc_expense_states: String,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl AccountConfig {
    pub(crate) fn to_active_model(&self, now: DateTime<Utc>) -> ResultEngine<ActiveModel> {
        Ok(ActiveModel {
            account_id: ActiveValue::Set(self.account_id.clone()),
            reimbursable_export_type: ActiveValue::Set(
                self.reimbursable_export_type.map(|k| k.as_str().to_string()),
            ),
            ccc_export_type: ActiveValue::Set(self.ccc_export_type.map(|k| k.as_str().to_string())),
            reimbursable_grouping: ActiveValue::Set(serde_json::to_string(
                &self.reimbursable_grouping,
            )?),
            ccc_grouping: ActiveValue::Set(serde_json::to_string(&self.ccc_grouping)?),
            split_ccc_by_bank_transaction: ActiveValue::Set(self.split_ccc_by_bank_transaction),
            employee_field_mapping: ActiveValue::Set(
                self.employee_field_mapping.as_str().to_string(),
            ),
            tax_override_enabled: ActiveValue::Set(self.tax_override_enabled),
            auto_correct_accounting_period: ActiveValue::Set(self.auto_correct_accounting_period),
            sync_ledger_payments_to_source: ActiveValue::Set(self.sync_ledger_payments_to_source),
            sync_source_payments_to_ledger: ActiveValue::Set(self.sync_source_payments_to_ledger),
            default_ccc_account_id: ActiveValue::Set(self.default_ccc_account_id.clone()),
            default_ccc_vendor_id: ActiveValue::Set(self.default_ccc_vendor_id.clone()),
            reimbursable_expense_states: ActiveValue::Set(serde_json::to_string(
                &self.reimbursable_expense_states,
            )?),
            ccc_expense_states: ActiveValue::Set(serde_json::to_string(&self.ccc_expense_states)?),
            updated_at: ActiveValue::Set(now),
        })
    }
}

impl TryFrom<Model> for AccountConfig {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            reimbursable_export_type: model
                .reimbursable_export_type
                .as_deref()
                .map(TransactionKind::try_from)
                .transpose()?,
            ccc_export_type: model
                .ccc_export_type
                .as_deref()
                .map(TransactionKind::try_from)
                .transpose()?,
            reimbursable_grouping: serde_json::from_str(&model.reimbursable_grouping)?,
            ccc_grouping: serde_json::from_str(&model.ccc_grouping)?,
            split_ccc_by_bank_transaction: model.split_ccc_by_bank_transaction,
            employee_field_mapping: EmployeeFieldMapping::try_from(
                model.employee_field_mapping.as_str(),
            )?,
            tax_override_enabled: model.tax_override_enabled,
            auto_correct_accounting_period: model.auto_correct_accounting_period,
            sync_ledger_payments_to_source: model.sync_ledger_payments_to_source,
            sync_source_payments_to_ledger: model.sync_source_payments_to_ledger,
            default_ccc_account_id: model.default_ccc_account_id,
            default_ccc_vendor_id: model.default_ccc_vendor_id,
            reimbursable_expense_states: serde_json::from_str(&model.reimbursable_expense_states)?,
            ccc_expense_states: serde_json::from_str(&model.ccc_expense_states)?,
            account_id: model.account_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_type_adds_its_grouping_field_once() {
        let settings = GroupingSettings {
            fields: vec![GroupingField::ReportId, GroupingField::SpentAt],
            date_type: ExportDateType::SpentAt,
        };
        assert_eq!(
            settings.effective_fields(),
            vec![GroupingField::ReportId, GroupingField::SpentAt]
        );

        let settings = GroupingSettings {
            fields: vec![GroupingField::ReportId],
            date_type: ExportDateType::ApprovedAt,
        };
        assert_eq!(
            settings.effective_fields(),
            vec![GroupingField::ReportId, GroupingField::ApprovedAt]
        );
    }

    #[test]
    fn last_spent_at_is_not_a_key_field() {
        let settings = GroupingSettings {
            fields: vec![GroupingField::EmployeeEmail],
            date_type: ExportDateType::LastSpentAt,
        };
        assert_eq!(settings.effective_fields(), vec![GroupingField::EmployeeEmail]);
    }

    #[test]
    fn non_negative_policy_depends_on_kind_and_mapping() {
        let mut config = AccountConfig::new("acc");
        assert!(config.requires_non_negative(TransactionKind::Bill));
        assert!(config.requires_non_negative(TransactionKind::JournalEntry));
        assert!(!config.requires_non_negative(TransactionKind::ExpenseReport));

        config.employee_field_mapping = EmployeeFieldMapping::Employee;
        assert!(!config.requires_non_negative(TransactionKind::JournalEntry));
    }

    #[test]
    fn grouping_settings_serialize_with_snake_case_names() {
        let settings = GroupingSettings {
            fields: vec![GroupingField::EmployeeEmail, GroupingField::BankTransactionId],
            date_type: ExportDateType::LastSpentAt,
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(
            json,
            r#"{"fields":["employee_email","bank_transaction_id"],"date_type":"last_spent_at"}"#
        );
    }

    #[test]
    fn card_charges_with_negative_total_are_refunds() {
        assert_eq!(
            TransactionKind::CreditCardCharge.task_type(true),
            TaskType::CreatingCreditCardRefund
        );
        assert_eq!(
            TransactionKind::CreditCardCharge.task_type(false),
            TaskType::CreatingCreditCardCharge
        );
        assert_eq!(TransactionKind::Bill.task_type(true), TaskType::CreatingBill);
    }
}
