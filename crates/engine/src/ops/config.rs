use chrono::Utc;
use sea_orm::{TransactionTrait, prelude::*};
use tracing::info;

use crate::{AccountConfig, ResultEngine, account_configs};

use super::{Engine, with_tx};

impl Engine {
    /// Creates or replaces the export configuration of an account.
    pub async fn save_account_config(&self, config: &AccountConfig) -> ResultEngine<()> {
        config.validate()?;
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let model = config.to_active_model(now)?;
            let exists = account_configs::Entity::find_by_id(config.account_id.clone())
                .one(&db_tx)
                .await?
                .is_some();
            if exists {
                model.update(&db_tx).await?;
            } else {
                model.insert(&db_tx).await?;
            }
            info!(account_id = %config.account_id, "account config saved");
            Ok(())
        })
    }

    pub async fn account_config(&self, account_id: &str) -> ResultEngine<AccountConfig> {
        with_tx!(self, |db_tx| {
            self.require_account_config(&db_tx, account_id).await
        })
    }
}
