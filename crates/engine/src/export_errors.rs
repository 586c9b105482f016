//! Persistent, user-facing export errors.
//!
//! A mapping error is keyed by `(account, source_type, source_value)` and
//! lists every group it blocks; a ledger error belongs to one group. Errors
//! are resolved rather than deleted, except when their group is dissolved.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, macros::impl_str_enum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Mapping,
    Ledger,
}

impl_str_enum!(ErrorKind {
    Mapping => "MAPPING",
    Ledger => "LEDGER_ERROR",
});

/// Kind of source attribute a mapping translates to a ledger identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingSourceType {
    Employee,
    Category,
    TaxGroup,
    CorporateCard,
    Merchant,
}

impl_str_enum!(MappingSourceType {
    Employee => "EMPLOYEE",
    Category => "CATEGORY",
    TaxGroup => "TAX_GROUP",
    CorporateCard => "CORPORATE_CARD",
    Merchant => "MERCHANT",
});

#[derive(Clone, Debug, PartialEq)]
pub struct ExportError {
    pub id: Uuid,
    pub account_id: String,
    pub kind: ErrorKind,
    pub source_type: Option<MappingSourceType>,
    pub source_value: Option<String>,
    pub expense_group_id: Option<String>,
    pub affected_group_ids: Vec<String>,
    pub repetition_count: i32,
    pub is_resolved: bool,
    pub title: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportError {
    pub fn mapping(
        account_id: &str,
        source_type: MappingSourceType,
        source_value: &str,
        expense_group_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind: ErrorKind::Mapping,
            source_type: Some(source_type),
            source_value: Some(source_value.to_string()),
            expense_group_id: None,
            affected_group_ids: vec![expense_group_id.to_string()],
            repetition_count: 1,
            is_resolved: false,
            title: format!("{source_value} mapping is missing"),
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ledger(
        account_id: &str,
        expense_group_id: &str,
        title: String,
        detail: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind: ErrorKind::Ledger,
            source_type: None,
            source_value: None,
            expense_group_id: Some(expense_group_id.to_string()),
            affected_group_ids: Vec::new(),
            repetition_count: 1,
            is_resolved: false,
            title,
            detail,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this error blocks the given group.
    pub fn blocks(&self, expense_group_id: &str) -> bool {
        !self.is_resolved
            && (self.expense_group_id.as_deref() == Some(expense_group_id)
                || self.affected_group_ids.iter().any(|id| id == expense_group_id))
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "export_errors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub account_id: String,
    pub kind: String,
    pub source_type: Option<String>,
    pub source_value: Option<String>,
    pub expense_group_id: Option<String>,
    pub affected_group_ids: String,
    pub repetition_count: i32,
    pub is_resolved: bool,
    pub title: String,
    pub detail: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&ExportError> for ActiveModel {
    type Error = EngineError;

    fn try_from(value: &ExportError) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ActiveValue::Set(value.id.to_string()),
            account_id: ActiveValue::Set(value.account_id.clone()),
            kind: ActiveValue::Set(value.kind.as_str().to_string()),
            source_type: ActiveValue::Set(value.source_type.map(|t| t.as_str().to_string())),
            source_value: ActiveValue::Set(value.source_value.clone()),
            expense_group_id: ActiveValue::Set(value.expense_group_id.clone()),
            affected_group_ids: ActiveValue::Set(serde_json::to_string(
                &value.affected_group_ids,
            )?),
            repetition_count: ActiveValue::Set(value.repetition_count),
            is_resolved: ActiveValue::Set(value.is_resolved),
            title: ActiveValue::Set(value.title.clone()),
            detail: ActiveValue::Set(value.detail.as_ref().map(serde_json::to_string).transpose()?),
            created_at: ActiveValue::Set(value.created_at),
            updated_at: ActiveValue::Set(value.updated_at),
        })
    }
}

impl TryFrom<Model> for ExportError {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: crate::util::parse_uuid(&model.id, "export error")?,
            kind: ErrorKind::try_from(model.kind.as_str())?,
            source_type: model
                .source_type
                .as_deref()
                .map(MappingSourceType::try_from)
                .transpose()?,
            affected_group_ids: serde_json::from_str(&model.affected_group_ids)?,
            detail: model
                .detail
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            account_id: model.account_id,
            source_value: model.source_value,
            expense_group_id: model.expense_group_id,
            repetition_count: model.repetition_count,
            is_resolved: model.is_resolved,
            title: model.title,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

pub(crate) fn to_domain(models: Vec<Model>) -> ResultEngine<Vec<ExportError>> {
    models.into_iter().map(ExportError::try_from).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn resolved_errors_do_not_block() {
        let now = Utc::now();
        let mut error = ExportError::mapping("acc", MappingSourceType::Category, "Meals", "g1", now);
        assert!(error.blocks("g1"));
        assert!(!error.blocks("g2"));

        error.is_resolved = true;
        assert!(!error.blocks("g1"));
    }

    #[test]
    fn ledger_error_blocks_its_group() {
        let error = ExportError::ledger("acc", "g1", "rejected".to_string(), None, Utc::now());
        assert!(error.blocks("g1"));
        assert_eq!(error.kind.as_str(), "LEDGER_ERROR");
    }
}
