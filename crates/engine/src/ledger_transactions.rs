//! Records of transactions successfully created on the ledger.
//!
//! One row per exported group. Payment reconciliation walks these rows in
//! both directions.

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use uuid::Uuid;

use crate::{EngineError, Money, ResultEngine, account_configs::TransactionKind};

#[derive(Clone, Debug, PartialEq)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub account_id: String,
    pub expense_group_id: String,
    pub kind: TransactionKind,
    pub external_id: String,
    pub entity_id: String,
    pub amount: Money,
    pub currency: String,
    pub transaction_date: DateTime<Utc>,
    pub paid_on_ledger: bool,
    pub paid_on_source: bool,
    pub payment_synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "ledger_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub account_id: String,
    #[sea_orm(unique)]
    pub expense_group_id: String,
    pub kind: String,
    pub external_id: String,
    pub entity_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub transaction_date: DateTimeUtc,
    pub paid_on_ledger: bool,
    pub paid_on_source: bool,
    pub payment_synced: bool,
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

impl From<&LedgerTransaction> for ActiveModel {
    fn from(value: &LedgerTransaction) -> Self {
        Self {
            id: ActiveValue::Set(value.id.to_string()),
            account_id: ActiveValue::Set(value.account_id.clone()),
            expense_group_id: ActiveValue::Set(value.expense_group_id.clone()),
            kind: ActiveValue::Set(value.kind.as_str().to_string()),
            external_id: ActiveValue::Set(value.external_id.clone()),
            entity_id: ActiveValue::Set(value.entity_id.clone()),
            amount_minor: ActiveValue::Set(value.amount.cents()),
            currency: ActiveValue::Set(value.currency.clone()),
            transaction_date: ActiveValue::Set(value.transaction_date),
            paid_on_ledger: ActiveValue::Set(value.paid_on_ledger),
            paid_on_source: ActiveValue::Set(value.paid_on_source),
            payment_synced: ActiveValue::Set(value.payment_synced),
            created_at: ActiveValue::Set(value.created_at),
            updated_at: ActiveValue::Set(value.updated_at),
        }
    }
}

impl TryFrom<Model> for LedgerTransaction {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: crate::util::parse_uuid(&model.id, "ledger transaction")?,
            kind: TransactionKind::try_from(model.kind.as_str())?,
            amount: Money::new(model.amount_minor),
            account_id: model.account_id,
            expense_group_id: model.expense_group_id,
            external_id: model.external_id,
            entity_id: model.entity_id,
            currency: model.currency,
            transaction_date: model.transaction_date,
            paid_on_ledger: model.paid_on_ledger,
            paid_on_source: model.paid_on_source,
            payment_synced: model.payment_synced,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

pub(crate) fn to_domain(models: Vec<Model>) -> ResultEngine<Vec<LedgerTransaction>> {
    models.into_iter().map(LedgerTransaction::try_from).collect()
}
