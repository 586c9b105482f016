//! Canonical expense line items.
//!
//! An `Expense` is keyed by the source platform's external id, which is
//! globally unique. It is created and refreshed through an idempotent upsert
//! (see `Engine::ingest_expenses`) and never hard-deleted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    EngineError, Money, ResultEngine, account_configs::GroupingField, macros::impl_str_enum,
};

/// Format used for every date rendered into grouping keys and descriptions.
pub const SECONDS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundSource {
    Personal,
    CorporateCard,
}

impl_str_enum!(FundSource {
    Personal => "PERSONAL",
    CorporateCard => "CORPORATE_CARD",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportState {
    InProgress,
    Skipped,
    Error,
    Complete,
    Deleted,
}

impl_str_enum!(ExportState {
    InProgress => "IN_PROGRESS",
    Skipped => "SKIPPED",
    Error => "ERROR",
    Complete => "COMPLETE",
    Deleted => "DELETED",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportErrorType {
    Mapping,
    AccountingIntegrationError,
}

/// The per-expense state snapshot shown to users in the source platform.
///
/// The serialized shape `{id, state, error_type, url, synced}` is shared with
/// the source platform and must not change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub id: String,
    pub state: ExportState,
    pub error_type: Option<ExportErrorType>,
    pub url: Option<String>,
    pub synced: bool,
}

impl ExportSummary {
    pub fn new(
        id: &str,
        state: ExportState,
        error_type: Option<ExportErrorType>,
        url: Option<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            state,
            error_type,
            url,
            synced: false,
        }
    }
}

/// A value of a schema-less custom property.
///
/// `null` values are kept distinct from absent keys: a property map is a
/// `BTreeMap<String, Option<CustomPropertyValue>>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomPropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Select(Vec<String>),
}

impl CustomPropertyValue {
    /// Textual forms of the value; a multi-select yields one entry per option.
    pub fn texts(&self) -> Vec<String> {
        match self {
            Self::Bool(value) => vec![value.to_string()],
            Self::Number(value) => vec![value.to_string()],
            Self::Text(value) => vec![value.clone()],
            Self::Select(values) => values.clone(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
            Self::Bool(_) | Self::Select(_) => None,
        }
    }
}

pub type CustomProperties = BTreeMap<String, Option<CustomPropertyValue>>;

/// Empty strings coming from the platform mean "not set".
pub fn normalize_custom_properties(properties: CustomProperties) -> CustomProperties {
    properties
        .into_iter()
        .map(|(key, value)| match value {
            Some(CustomPropertyValue::Text(text)) if text.is_empty() => (key, None),
            other => (key, other),
        })
        .collect()
}

/// A raw expense record as returned by the source platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawExpense {
    pub id: String,
    pub expense_number: Option<String>,
    pub employee_email: String,
    pub employee_name: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub project: Option<String>,
    pub cost_center: Option<String>,
    pub merchant: Option<String>,
    pub purpose: Option<String>,
    pub report_id: Option<String>,
    pub report_title: Option<String>,
    pub claim_number: Option<String>,
    pub settlement_id: Option<String>,
    pub corporate_card_id: Option<String>,
    pub bank_transaction_id: Option<String>,
    pub amount: f64,
    pub tax_amount: Option<f64>,
    pub tax_group_id: Option<String>,
    pub currency: String,
    pub foreign_amount: Option<f64>,
    pub foreign_currency: Option<String>,
    pub fund_source: FundSource,
    pub state: String,
    #[serde(default)]
    pub billable: bool,
    pub spent_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub custom_properties: CustomProperties,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub expense_id: String,
    pub account_id: String,
    pub expense_number: Option<String>,
    pub employee_email: String,
    pub employee_name: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub project: Option<String>,
    pub cost_center: Option<String>,
    pub merchant: Option<String>,
    pub purpose: Option<String>,
    pub report_id: Option<String>,
    pub report_title: Option<String>,
    pub claim_number: Option<String>,
    pub settlement_id: Option<String>,
    pub corporate_card_id: Option<String>,
    pub bank_transaction_id: Option<String>,
    pub amount: Money,
    pub tax_amount: Option<Money>,
    pub tax_group_id: Option<String>,
    pub currency: String,
    pub foreign_amount: Option<Money>,
    pub foreign_currency: Option<String>,
    pub fund_source: FundSource,
    pub state: String,
    pub billable: bool,
    pub spent_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub expense_created_at: DateTime<Utc>,
    pub expense_updated_at: DateTime<Utc>,
    pub custom_properties: CustomProperties,
    pub is_skipped: bool,
    pub export_summary: Option<ExportSummary>,
    pub previous_export_state: Option<ExportState>,
    pub paid_on_ledger: bool,
    pub paid_on_source: bool,
    pub expense_group_id: Option<String>,
}

impl Expense {
    /// Value of a grouping field, as used in grouping keys.
    ///
    /// Dates are rendered to second precision.
    pub fn grouping_value(&self, field: GroupingField) -> Option<String> {
        let date = |value: Option<DateTime<Utc>>| value.map(|d| d.format(SECONDS_FORMAT).to_string());
        match field {
            GroupingField::EmployeeEmail => Some(self.employee_email.clone()),
            GroupingField::ReportId => self.report_id.clone(),
            GroupingField::ClaimNumber => self.claim_number.clone(),
            GroupingField::FundSource => Some(self.fund_source.as_str().to_string()),
            GroupingField::ExpenseId => Some(self.expense_id.clone()),
            GroupingField::ExpenseNumber => self.expense_number.clone(),
            GroupingField::SpentAt => date(self.spent_at),
            GroupingField::ApprovedAt => date(self.approved_at),
            GroupingField::PostedAt => date(self.posted_at),
            GroupingField::SettlementId => self.settlement_id.clone(),
            GroupingField::Category => self.category.clone(),
            GroupingField::Project => self.project.clone(),
            GroupingField::CostCenter => self.cost_center.clone(),
            GroupingField::CorporateCardId => self.corporate_card_id.clone(),
            GroupingField::BankTransactionId => self.bank_transaction_id.clone(),
        }
    }

    /// Ledger-side category key: `category` or `category / sub_category`.
    pub fn category_key(&self) -> Option<String> {
        let category = self.category.as_deref()?;
        match self.sub_category.as_deref() {
            Some(sub) if !sub.is_empty() && sub != category => Some(format!("{category} / {sub}")),
            _ => Some(category.to_string()),
        }
    }

    pub fn export_state(&self) -> Option<ExportState> {
        self.export_summary.as_ref().map(|summary| summary.state)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "expenses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub expense_id: String,
    pub account_id: String,
    pub expense_number: Option<String>,
    pub employee_email: String,
    pub employee_name: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub project: Option<String>,
    pub cost_center: Option<String>,
    pub merchant: Option<String>,
    pub purpose: Option<String>,
    pub report_id: Option<String>,
    pub report_title: Option<String>,
    pub claim_number: Option<String>,
    pub settlement_id: Option<String>,
    pub corporate_card_id: Option<String>,
    pub bank_transaction_id: Option<String>,
    pub amount_minor: i64,
    pub tax_amount_minor: Option<i64>,
    pub tax_group_id: Option<String>,
    pub currency: String,
    pub foreign_amount_minor: Option<i64>,
    pub foreign_currency: Option<String>,
    pub fund_source: String,
    pub state: String,
    pub billable: bool,
    pub spent_at: Option<DateTimeUtc>,
    pub approved_at: Option<DateTimeUtc>,
    pub posted_at: Option<DateTimeUtc>,
    pub expense_created_at: DateTimeUtc,
    pub expense_updated_at: DateTimeUtc,
    pub custom_properties: String,
    pub is_skipped: bool,
    pub export_summary: Option<String>,
    pub previous_export_state: Option<String>,
    pub paid_on_ledger: bool,
    pub paid_on_source: bool,
    pub expense_group_id: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::expense_groups::Entity",
        from = "Column::ExpenseGroupId",
        to = "super::expense_groups::Column::Id"
    )]
    ExpenseGroup,
}

impl Related<super::expense_groups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExpenseGroup.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub(crate) fn summary_to_column(summary: Option<&ExportSummary>) -> ResultEngine<Option<String>> {
    summary
        .map(serde_json::to_string)
        .transpose()
        .map_err(EngineError::from)
}

impl TryFrom<Model> for Expense {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let export_summary = model
            .export_summary
            .as_deref()
            .map(serde_json::from_str::<ExportSummary>)
            .transpose()?;
        let previous_export_state = model
            .previous_export_state
            .as_deref()
            .map(ExportState::try_from)
            .transpose()?;
        Ok(Self {
            fund_source: FundSource::try_from(model.fund_source.as_str())?,
            custom_properties: serde_json::from_str(&model.custom_properties)?,
            expense_id: model.expense_id,
            account_id: model.account_id,
            expense_number: model.expense_number,
            employee_email: model.employee_email,
            employee_name: model.employee_name,
            category: model.category,
            sub_category: model.sub_category,
            project: model.project,
            cost_center: model.cost_center,
            merchant: model.merchant,
            purpose: model.purpose,
            report_id: model.report_id,
            report_title: model.report_title,
            claim_number: model.claim_number,
            settlement_id: model.settlement_id,
            corporate_card_id: model.corporate_card_id,
            bank_transaction_id: model.bank_transaction_id,
            amount: Money::new(model.amount_minor),
            tax_amount: model.tax_amount_minor.map(Money::new),
            tax_group_id: model.tax_group_id,
            currency: model.currency,
            foreign_amount: model.foreign_amount_minor.map(Money::new),
            foreign_currency: model.foreign_currency,
            state: model.state,
            billable: model.billable,
            spent_at: model.spent_at,
            approved_at: model.approved_at,
            posted_at: model.posted_at,
            expense_created_at: model.expense_created_at,
            expense_updated_at: model.expense_updated_at,
            is_skipped: model.is_skipped,
            export_summary,
            previous_export_state,
            paid_on_ledger: model.paid_on_ledger,
            paid_on_source: model.paid_on_source,
            expense_group_id: model.expense_group_id,
        })
    }
}

pub(crate) fn to_domain(models: Vec<Model>) -> ResultEngine<Vec<Expense>> {
    models.into_iter().map(Expense::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_properties_become_null() {
        let mut properties = CustomProperties::new();
        properties.insert("Team".to_string(), Some(CustomPropertyValue::Text(String::new())));
        properties.insert("Cost".to_string(), Some(CustomPropertyValue::Number(3.0)));
        properties.insert("Gone".to_string(), None);

        let normalized = normalize_custom_properties(properties);
        assert_eq!(normalized.get("Team"), Some(&None));
        assert_eq!(
            normalized.get("Cost"),
            Some(&Some(CustomPropertyValue::Number(3.0)))
        );
        assert_eq!(normalized.get("Gone"), Some(&None));
    }

    #[test]
    fn custom_properties_keep_null_distinct_from_absent() {
        let parsed: CustomProperties =
            serde_json::from_str(r#"{"Team": null, "Tags": ["a", "b"], "Flag": true}"#).unwrap();
        assert_eq!(parsed.get("Team"), Some(&None));
        assert!(!parsed.contains_key("Missing"));
        assert_eq!(
            parsed.get("Tags"),
            Some(&Some(CustomPropertyValue::Select(vec![
                "a".to_string(),
                "b".to_string()
            ])))
        );
        assert_eq!(parsed.get("Flag"), Some(&Some(CustomPropertyValue::Bool(true))));
    }

    #[test]
    fn export_summary_shape_is_stable() {
        let summary = ExportSummary::new(
            "tx1",
            ExportState::Error,
            Some(ExportErrorType::Mapping),
            Some("https://example.test".to_string()),
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "tx1",
                "state": "ERROR",
                "error_type": "MAPPING",
                "url": "https://example.test",
                "synced": false
            })
        );
    }
}
