//! Runtime knobs of the engine.
//!
//! Every field has a default so a partial `[engine]` table (or none at all)
//! in the host's settings file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Base URL of the source platform, used for export summary deep links.
    pub source_app_url: String,
    /// Base URL of the ledger web app, used for exported transaction links.
    pub ledger_app_url: String,
    pub export_summary_batch_size: usize,
    pub export_summary_max_attempts: u32,
    pub export_summary_backoff_ms: u64,
    pub mark_paid_max_retries: u32,
    pub worker_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            source_app_url: "https://app.source.example".to_string(),
            ledger_app_url: "https://app.ledger.example".to_string(),
            export_summary_batch_size: 50,
            export_summary_max_attempts: 3,
            export_summary_backoff_ms: 1000,
            mark_paid_max_retries: 3,
            worker_concurrency: 4,
        }
    }
}

impl EngineSettings {
    pub fn export_summary_backoff(&self) -> Duration {
        Duration::from_millis(self.export_summary_backoff_ms)
    }

    /// Deep link to an expense in the source platform.
    pub fn expense_url(&self, expense_id: &str) -> String {
        format!(
            "{}/app/admin/#/view_expense/{expense_id}",
            self.source_app_url.trim_end_matches('/')
        )
    }

    /// Link to an exported transaction in the ledger.
    pub fn ledger_url(&self, kind: &str, external_id: &str) -> String {
        format!(
            "{}/{}/{external_id}",
            self.ledger_app_url.trim_end_matches('/'),
            kind.to_lowercase()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_use_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"export_summary_batch_size": 10}"#).unwrap();
        assert_eq!(settings.export_summary_batch_size, 10);
        assert_eq!(settings.export_summary_max_attempts, 3);
        assert_eq!(settings.export_summary_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn links_ignore_trailing_slash() {
        let settings = EngineSettings {
            source_app_url: "https://source.test/".to_string(),
            ..EngineSettings::default()
        };
        assert_eq!(
            settings.expense_url("tx1"),
            "https://source.test/app/admin/#/view_expense/tx1"
        );
        assert_eq!(
            settings.ledger_url("BILL", "B-9"),
            "https://app.ledger.example/bill/B-9"
        );
    }
}
