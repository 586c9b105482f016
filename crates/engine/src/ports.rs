//! Seams to the systems the engine talks to.
//!
//! The engine never speaks HTTP itself: the source platform, the ledger, the
//! mapping store and the attachment uploader are injected as trait objects.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    Money, ResultEngine,
    account_configs::TransactionKind,
    export_errors::MappingSourceType,
    exporters::LedgerPayload,
    expenses::{ExportSummary, FundSource, RawExpense},
};

/// Failures reported by the source platform.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SourceError {
    /// 5xx-class failure; the call may be retried.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The caller may not touch these expense/report ids any more.
    #[error("permission denied for {0:?}")]
    PermissionDenied(Vec<String>),
    #[error("{0}")]
    Other(String),
}

/// Failures reported by the ledger.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LedgerError {
    /// The transaction date falls inside a closed accounting period.
    #[error("accounting period closed: {0}")]
    AccountingPeriodClosed(String),
    #[error("invalid ledger credentials: {0}")]
    Login(String),
    #[error("rate limited by the ledger")]
    RateLimited,
    /// The ledger refused the payload; `detail` is its raw response.
    #[error("{message}")]
    Rejected {
        message: String,
        detail: serde_json::Value,
    },
    #[error("unexpected ledger failure: {0}")]
    Unexpected(String),
}

impl LedgerError {
    /// Expected errors are recorded as FAILED; anything else ends the task
    /// as FATAL.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Unexpected(_))
    }

    /// Errors that clear on their own. They fail the attempt without leaving
    /// a blocking export error behind.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Login(_))
    }

    pub fn detail(&self) -> Option<serde_json::Value> {
        match self {
            Self::Rejected { detail, .. } => Some(detail.clone()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseQuery {
    pub fund_sources: Vec<FundSource>,
    pub states: Vec<String>,
    pub updated_since: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportPayment {
    pub report_id: String,
    pub paid_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkPaidFailureReason {
    PermissionDenied,
    InvalidState,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkPaidFailure {
    pub report_id: String,
    pub reason: MarkPaidFailureReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkPaidResponse {
    pub failures: Vec<MarkPaidFailure>,
}

#[async_trait]
pub trait SourcePlatform: Send + Sync {
    async fn fetch_expenses(
        &self,
        account_id: &str,
        query: &ExpenseQuery,
    ) -> Result<Vec<RawExpense>, SourceError>;

    async fn push_export_summaries(
        &self,
        account_id: &str,
        summaries: &[ExportSummary],
    ) -> Result<(), SourceError>;

    /// Marks reports paid. Per-report failures come back in the response.
    async fn mark_reports_paid(
        &self,
        account_id: &str,
        reports: &[ReportPayment],
    ) -> Result<MarkPaidResponse, SourceError>;

    /// Current state of each report (e.g. `PAID`).
    async fn report_states(
        &self,
        account_id: &str,
        report_ids: &[String],
    ) -> Result<HashMap<String, String>, SourceError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct LedgerReceipt {
    pub external_id: String,
    pub url: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LedgerStatus {
    pub paid: bool,
    pub raw: serde_json::Value,
}

/// A document settled by a vendor payment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentDocument {
    pub external_id: String,
    pub kind: TransactionKind,
    pub amount: Money,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VendorPayment {
    pub entity_id: String,
    pub currency: String,
    pub amount: Money,
    pub payment_date: DateTime<Utc>,
    pub documents: Vec<PaymentDocument>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn post_transaction(
        &self,
        account_id: &str,
        payload: &LedgerPayload,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn transaction_status(
        &self,
        account_id: &str,
        kind: TransactionKind,
        external_id: &str,
    ) -> Result<LedgerStatus, LedgerError>;

    async fn post_vendor_payment(
        &self,
        account_id: &str,
        payment: &VendorPayment,
    ) -> Result<LedgerReceipt, LedgerError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedMapping {
    pub destination_id: String,
    /// Only set for tax group mappings.
    pub tax_rate: Option<f64>,
}

#[async_trait]
pub trait MappingResolver: Send + Sync {
    async fn resolve(
        &self,
        account_id: &str,
        source_type: MappingSourceType,
        source_value: &str,
    ) -> ResultEngine<Option<ResolvedMapping>>;
}

#[async_trait]
pub trait AttachmentQueue: Send + Sync {
    async fn enqueue(
        &self,
        account_id: &str,
        expense_group_id: &str,
        external_id: &str,
    ) -> Result<(), SourceError>;
}

/// The injected collaborators of an engine run.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourcePlatform>,
    pub ledger: Arc<dyn Ledger>,
    pub mappings: Arc<dyn MappingResolver>,
    pub attachments: Option<Arc<dyn AttachmentQueue>>,
}

impl Collaborators {
    pub fn new(
        source: Arc<dyn SourcePlatform>,
        ledger: Arc<dyn Ledger>,
        mappings: Arc<dyn MappingResolver>,
    ) -> Self {
        Self {
            source,
            ledger,
            mappings,
            attachments: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Arc<dyn AttachmentQueue>) -> Self {
        self.attachments = Some(attachments);
        self
    }
}
