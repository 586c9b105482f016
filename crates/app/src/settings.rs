//! Settings of the `ledgerbridge` binary.
//!
//! Values come from `settings.toml` (or the file passed with `--config`),
//! then from `LEDGERBRIDGE__*` environment variables, then from the command
//! line. Later sources win.

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use engine::EngineSettings;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "settings";
const DEFAULT_DATABASE_URL: &str = "sqlite:./ledgerbridge.db?mode=rwc";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct App {
    pub level: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    Memory,
    Sqlite(String),
}

impl Database {
    pub fn url(&self) -> String {
        match self {
            Database::Memory => "sqlite::memory:".to_string(),
            Database::Sqlite(path) => format!("sqlite:{path}?mode=rwc"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub app: App,
    pub database: Option<Database>,
    pub engine: EngineSettings,
}

#[derive(Debug, Parser)]
#[command(name = "ledgerbridge", about = "Expense export orchestration")]
pub struct Args {
    /// Optional settings file path (TOML).
    #[arg(long)]
    pub config: Option<String>,
    /// Database URL; overrides the `[database]` table.
    #[arg(long, env = "LEDGERBRIDGE_DATABASE_URL")]
    pub database_url: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending schema migrations.
    Migrate,
    /// Recount the export counters of an account.
    RecomputeSummary {
        #[arg(long)]
        account: String,
    },
    /// Mark the mapping errors of a source value resolved.
    ResolveMapping {
        #[arg(long)]
        account: String,
        /// EMPLOYEE, CATEGORY, TAX_GROUP, CORPORATE_CARD or MERCHANT.
        #[arg(long)]
        source_type: String,
        #[arg(long)]
        value: String,
    },
    /// List the unresolved export errors of an account.
    Errors {
        #[arg(long)]
        account: String,
    },
}

impl Settings {
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let path = args.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
        Config::builder()
            .add_source(File::with_name(path).required(args.config.is_some()))
            .add_source(Environment::with_prefix("LEDGERBRIDGE").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn database_url(&self, args: &Args) -> String {
        args.database_url
            .clone()
            .or_else(|| self.database.as_ref().map(Database::url))
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
    }
}
