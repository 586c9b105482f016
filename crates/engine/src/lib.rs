//! Expense grouping and export orchestration.
//!
//! Expenses pulled from the source platform are ingested, filtered and
//! grouped; each group is exported to the ledger as one transaction through
//! a per-group task state machine, and payments are reconciled in both
//! directions afterwards. All state lives in the database behind [`Engine`].

mod macros;

pub mod account_configs;
pub mod expense_filters;
pub mod expense_groups;
pub mod expenses;
pub mod export_errors;
pub mod exporters;
pub mod filter;
pub mod grouping;
pub mod last_export_details;
pub mod ledger_transactions;
pub mod ports;
pub mod task_logs;
pub mod validation;
pub mod worker;

mod error;
mod money;
mod ops;
mod retry;
mod settings;
mod util;

pub use account_configs::{AccountConfig, TransactionKind};
pub use error::EngineError;
pub use expense_filters::{ExpenseFilter, NewExpenseFilter};
pub use expense_groups::ExpenseGroup;
pub use expenses::{Expense, ExportSummary, FundSource, RawExpense};
pub use export_errors::ExportError;
pub use last_export_details::LastExportDetail;
pub use ledger_transactions::LedgerTransaction;
pub use money::Money;
pub use ops::{
    Engine, EngineBuilder, ExportJob, FilterUpdate, GroupingResult, ImportOutcome,
    LedgerPaymentSync, ScheduleOutcome, ScheduleRequest, SourcePaymentSync, SyncCursor,
};
pub use ports::Collaborators;
pub use retry::RetryPolicy;
pub use settings::EngineSettings;
pub use task_logs::{TaskLog, TaskStatus, TriggerSource};

pub type ResultEngine<T> = Result<T, EngineError>;
