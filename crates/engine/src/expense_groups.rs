//! Expense groups: the unit of export.
//!
//! A group is a set of expenses sharing the values of the configured grouping
//! fields. Membership lives on the expense rows (`expenses.expense_group_id`),
//! so an expense belongs to at most one group.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, expenses::FundSource};

/// Grouping field name -> rendered value.
pub type GroupDescription = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq)]
pub struct ExpenseGroup {
    pub id: String,
    pub account_id: String,
    pub fund_source: FundSource,
    pub description: GroupDescription,
    pub exported_at: Option<DateTime<Utc>>,
    pub response: Option<serde_json::Value>,
    pub export_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExpenseGroup {
    pub fn new(
        account_id: &str,
        fund_source: FundSource,
        description: GroupDescription,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            fund_source,
            description,
            exported_at: None,
            response: None,
            export_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_exported(&self) -> bool {
        self.exported_at.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "expense_groups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub account_id: String,
    pub fund_source: String,
    pub description: String,
    pub exported_at: Option<DateTimeUtc>,
    pub response: Option<String>,
    pub export_url: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::expenses::Entity")]
    Expenses,
    #[sea_orm(has_many = "super::task_logs::Entity")]
    TaskLogs,
}

impl Related<super::expenses::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Expenses.def()
    }
}

impl Related<super::task_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TaskLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&ExpenseGroup> for ActiveModel {
    type Error = EngineError;

    fn try_from(value: &ExpenseGroup) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ActiveValue::Set(value.id.clone()),
            account_id: ActiveValue::Set(value.account_id.clone()),
            fund_source: ActiveValue::Set(value.fund_source.as_str().to_string()),
            description: ActiveValue::Set(serde_json::to_string(&value.description)?),
            exported_at: ActiveValue::Set(value.exported_at),
            response: ActiveValue::Set(
                value.response.as_ref().map(serde_json::to_string).transpose()?,
            ),
            export_url: ActiveValue::Set(value.export_url.clone()),
            created_at: ActiveValue::Set(value.created_at),
            updated_at: ActiveValue::Set(value.updated_at),
        })
    }
}

impl TryFrom<Model> for ExpenseGroup {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            fund_source: FundSource::try_from(model.fund_source.as_str())?,
            description: serde_json::from_str(&model.description)?,
            response: model
                .response
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: model.id,
            account_id: model.account_id,
            exported_at: model.exported_at,
            export_url: model.export_url,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

pub(crate) fn to_domain(models: Vec<Model>) -> ResultEngine<Vec<ExpenseGroup>> {
    models.into_iter().map(ExpenseGroup::try_from).collect()
}
