use sea_orm::{DatabaseConnection, DatabaseTransaction, QueryFilter, QueryOrder, prelude::*};

use crate::{
    AccountConfig, EngineError, EngineSettings, ResultEngine, account_configs, expense_groups,
    expenses,
};

mod config;
mod errors;
mod export;
mod filters;
mod grouping;
mod ingest;
mod last_export;
mod payments;
mod scheduler;
mod summaries;

pub use export::ExportJob;
pub use filters::FilterUpdate;
pub use grouping::GroupingResult;
pub use ingest::{ImportOutcome, SyncCursor};
pub use payments::{LedgerPaymentSync, SourcePaymentSync};
pub use scheduler::{ScheduleOutcome, ScheduleRequest};

/// Run a block inside a DB transaction, committing on success and rolling back on error.
macro_rules! with_tx {
    ($self:expr, |$tx:ident| $body:expr) => {{
        let $tx = $self.database.begin().await?;
        let result = $body;
        match result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }};
}

pub(crate) use with_tx;

#[derive(Clone, Debug)]
pub struct Engine {
    database: DatabaseConnection,
    settings: EngineSettings,
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    async fn require_account_config(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
    ) -> ResultEngine<AccountConfig> {
        let model = account_configs::Entity::find_by_id(account_id.to_string())
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound(format!("account config {account_id}")))?;
        AccountConfig::try_from(model)
    }

    async fn require_group(
        &self,
        db: &DatabaseTransaction,
        account_id: &str,
        expense_group_id: &str,
    ) -> ResultEngine<expense_groups::Model> {
        expense_groups::Entity::find_by_id(expense_group_id.to_string())
            .filter(expense_groups::Column::AccountId.eq(account_id.to_string()))
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound(format!("expense group {expense_group_id}")))
    }

    async fn group_members(
        &self,
        db: &DatabaseTransaction,
        expense_group_id: &str,
    ) -> ResultEngine<Vec<expenses::Model>> {
        Ok(expenses::Entity::find()
            .filter(expenses::Column::ExpenseGroupId.eq(expense_group_id.to_string()))
            .order_by_asc(expenses::Column::ExpenseId)
            .all(db)
            .await?)
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    database: DatabaseConnection,
    settings: EngineSettings,
}

impl EngineBuilder {
    /// Pass the required database
    pub fn database(mut self, db: DatabaseConnection) -> EngineBuilder {
        self.database = db;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> EngineBuilder {
        self.settings = settings;
        self
    }

    /// Construct `Engine`
    pub async fn build(self) -> ResultEngine<Engine> {
        if self.settings.export_summary_batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "export_summary_batch_size must be > 0".to_string(),
            ));
        }
        Ok(Engine {
            database: self.database,
            settings: self.settings,
        })
    }
}
