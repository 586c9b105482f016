//! User-defined skip rules.
//!
//! An account owns at most two ranked filters. Rank 1 is evaluated first;
//! the `join_by` of a filter tells how it combines with the next one.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, macros::impl_str_enum};

pub const MAX_FILTERS_PER_ACCOUNT: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    In,
    NotIn,
    Iexact,
    Icontains,
    Lt,
    Lte,
    #[serde(rename = "isnull")]
    IsNull,
}

impl_str_enum!(FilterOperator {
    In => "in",
    NotIn => "not_in",
    Iexact => "iexact",
    Icontains => "icontains",
    Lt => "lt",
    Lte => "lte",
    IsNull => "isnull",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinBy {
    And,
    Or,
}

impl_str_enum!(JoinBy {
    And => "AND",
    Or => "OR",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CustomFieldType {
    Select,
    Text,
    Number,
    Boolean,
}

impl_str_enum!(CustomFieldType {
    Select => "SELECT",
    Text => "TEXT",
    Number => "NUMBER",
    Boolean => "BOOLEAN",
});

/// Filter as submitted by a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewExpenseFilter {
    pub condition: String,
    pub operator: FilterOperator,
    pub values: Vec<String>,
    pub rank: i32,
    pub join_by: Option<JoinBy>,
    #[serde(default)]
    pub is_custom: bool,
    pub custom_field_type: Option<CustomFieldType>,
}

impl NewExpenseFilter {
    pub(crate) fn validate(&self) -> ResultEngine<()> {
        if self.condition.trim().is_empty() {
            return Err(EngineError::InvalidFilter(
                "condition must not be empty".to_string(),
            ));
        }
        if !(1..=MAX_FILTERS_PER_ACCOUNT as i32).contains(&self.rank) {
            return Err(EngineError::InvalidFilter(format!(
                "rank must be between 1 and {MAX_FILTERS_PER_ACCOUNT}"
            )));
        }
        if self.is_custom && self.custom_field_type.is_none() {
            return Err(EngineError::InvalidFilter(format!(
                "custom filter on '{}' needs a field type",
                self.condition
            )));
        }
        if self.values.is_empty() {
            return Err(EngineError::InvalidFilter(format!(
                "filter on '{}' has no values",
                self.condition
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExpenseFilter {
    pub id: Uuid,
    pub account_id: String,
    pub condition: String,
    pub operator: FilterOperator,
    pub values: Vec<String>,
    pub rank: i32,
    pub join_by: Option<JoinBy>,
    pub is_custom: bool,
    pub custom_field_type: Option<CustomFieldType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExpenseFilter {
    pub fn new(account_id: &str, input: NewExpenseFilter, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            condition: input.condition.trim().to_string(),
            operator: input.operator,
            values: input.values,
            rank: input.rank,
            join_by: input.join_by,
            is_custom: input.is_custom,
            custom_field_type: input.custom_field_type,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "expense_filters")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub account_id: String,
    pub condition: String,
    pub operator: String,
    pub values: String,
    pub rank: i32,
    pub join_by: Option<String>,
    pub is_custom: bool,
    pub custom_field_type: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&ExpenseFilter> for ActiveModel {
    type Error = EngineError;

    fn try_from(value: &ExpenseFilter) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ActiveValue::Set(value.id.to_string()),
            account_id: ActiveValue::Set(value.account_id.clone()),
            condition: ActiveValue::Set(value.condition.clone()),
            operator: ActiveValue::Set(value.operator.as_str().to_string()),
            values: ActiveValue::Set(serde_json::to_string(&value.values)?),
            rank: ActiveValue::Set(value.rank),
            join_by: ActiveValue::Set(value.join_by.map(|j| j.as_str().to_string())),
            is_custom: ActiveValue::Set(value.is_custom),
            custom_field_type: ActiveValue::Set(
                value.custom_field_type.map(|t| t.as_str().to_string()),
            ),
            created_at: ActiveValue::Set(value.created_at),
            updated_at: ActiveValue::Set(value.updated_at),
        })
    }
}

impl TryFrom<Model> for ExpenseFilter {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: crate::util::parse_uuid(&model.id, "expense filter")?,
            operator: FilterOperator::try_from(model.operator.as_str())?,
            values: serde_json::from_str(&model.values)?,
            join_by: model.join_by.as_deref().map(JoinBy::try_from).transpose()?,
            custom_field_type: model
                .custom_field_type
                .as_deref()
                .map(CustomFieldType::try_from)
                .transpose()?,
            account_id: model.account_id,
            condition: model.condition,
            rank: model.rank,
            is_custom: model.is_custom,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

pub(crate) fn to_domain(models: Vec<Model>) -> ResultEngine<Vec<ExpenseFilter>> {
    models.into_iter().map(ExpenseFilter::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(rank: i32) -> NewExpenseFilter {
        NewExpenseFilter {
            condition: "employee_email".to_string(),
            operator: FilterOperator::In,
            values: vec!["a@example.test".to_string()],
            rank,
            join_by: None,
            is_custom: false,
            custom_field_type: None,
        }
    }

    #[test]
    fn rank_outside_range_is_rejected() {
        assert!(input(1).validate().is_ok());
        assert!(input(2).validate().is_ok());
        assert!(matches!(
            input(3).validate(),
            Err(EngineError::InvalidFilter(_))
        ));
    }

    #[test]
    fn custom_filter_needs_field_type() {
        let mut filter = input(1);
        filter.is_custom = true;
        assert!(filter.validate().is_err());
        filter.custom_field_type = Some(CustomFieldType::Text);
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn operator_tags_match_wire_names() {
        let parsed: FilterOperator = serde_json::from_str("\"isnull\"").unwrap();
        assert_eq!(parsed, FilterOperator::IsNull);
        assert_eq!(FilterOperator::NotIn.as_str(), "not_in");
    }
}
