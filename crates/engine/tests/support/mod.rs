#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sea_orm::{Database, DatabaseConnection};

use engine::{
    AccountConfig, Collaborators, Engine, EngineSettings, ExportSummary, FundSource, RawExpense,
    ResultEngine, TransactionKind,
    export_errors::MappingSourceType,
    exporters::LedgerPayload,
    ports::{
        ExpenseQuery, Ledger, LedgerError, LedgerReceipt, LedgerStatus, MappingResolver,
        MarkPaidFailure, MarkPaidFailureReason, MarkPaidResponse, ReportPayment, ResolvedMapping,
        SourceError, SourcePlatform, VendorPayment,
    },
};
use migration::MigratorTrait;

pub const ACCOUNT: &str = "acc-1";

#[derive(Default)]
pub struct FakeSource {
    pub expenses: Mutex<Vec<RawExpense>>,
    pub queries: Mutex<Vec<ExpenseQuery>>,
    /// Transient failures returned before fetches succeed.
    pub fetch_failures: AtomicUsize,
    pub pushed: Mutex<Vec<ExportSummary>>,
    /// Expense ids the platform refuses summaries for.
    pub denied: Mutex<HashSet<String>>,
    pub mark_paid_calls: Mutex<Vec<Vec<String>>>,
    /// Reports refused by `mark_reports_paid`, with the reason given.
    pub refused_reports: Mutex<HashMap<String, MarkPaidFailureReason>>,
    pub report_states: Mutex<HashMap<String, String>>,
}

impl FakeSource {
    pub fn serve(&self, records: Vec<RawExpense>) {
        *self.expenses.lock().unwrap() = records;
    }

    pub fn pushed_state(&self, expense_id: &str) -> Option<ExportSummary> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|summary| summary.id == expense_id)
            .cloned()
    }

    pub fn set_report_state(&self, report_id: &str, state: &str) {
        self.report_states
            .lock()
            .unwrap()
            .insert(report_id.to_string(), state.to_string());
    }
}

#[async_trait]
impl SourcePlatform for FakeSource {
    async fn fetch_expenses(
        &self,
        _account_id: &str,
        query: &ExpenseQuery,
    ) -> Result<Vec<RawExpense>, SourceError> {
        self.queries.lock().unwrap().push(query.clone());
        if self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SourceError::Transient("502 bad gateway".to_string()));
        }
        Ok(self
            .expenses
            .lock()
            .unwrap()
            .iter()
            .filter(|raw| query.fund_sources.contains(&raw.fund_source))
            .filter(|raw| query.updated_since.is_none_or(|since| raw.updated_at > since))
            .cloned()
            .collect())
    }

    async fn push_export_summaries(
        &self,
        _account_id: &str,
        summaries: &[ExportSummary],
    ) -> Result<(), SourceError> {
        let denied: Vec<String> = {
            let denied = self.denied.lock().unwrap();
            summaries
                .iter()
                .filter(|summary| denied.contains(&summary.id))
                .map(|summary| summary.id.clone())
                .collect()
        };
        if !denied.is_empty() {
            return Err(SourceError::PermissionDenied(denied));
        }
        self.pushed.lock().unwrap().extend(summaries.iter().cloned());
        Ok(())
    }

    async fn mark_reports_paid(
        &self,
        _account_id: &str,
        reports: &[ReportPayment],
    ) -> Result<MarkPaidResponse, SourceError> {
        self.mark_paid_calls
            .lock()
            .unwrap()
            .push(reports.iter().map(|r| r.report_id.clone()).collect());
        let refused = self.refused_reports.lock().unwrap();
        Ok(MarkPaidResponse {
            failures: reports
                .iter()
                .filter_map(|r| {
                    refused.get(&r.report_id).map(|reason| MarkPaidFailure {
                        report_id: r.report_id.clone(),
                        reason: *reason,
                    })
                })
                .collect(),
        })
    }

    async fn report_states(
        &self,
        _account_id: &str,
        report_ids: &[String],
    ) -> Result<HashMap<String, String>, SourceError> {
        let states = self.report_states.lock().unwrap();
        Ok(report_ids
            .iter()
            .filter_map(|id| states.get(id).map(|state| (id.clone(), state.clone())))
            .collect())
    }
}

#[derive(Default)]
pub struct FakeLedger {
    pub posted: Mutex<Vec<LedgerPayload>>,
    /// Scripted outcomes, consumed before falling back to success.
    pub outcomes: Mutex<VecDeque<Result<(), LedgerError>>>,
    pub paid: Mutex<HashSet<String>>,
    pub payments: Mutex<Vec<VendorPayment>>,
    pub payment_outcomes: Mutex<VecDeque<Result<(), LedgerError>>>,
}

impl FakeLedger {
    pub fn fail_next(&self, error: LedgerError) {
        self.outcomes.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_next_payment(&self, error: LedgerError) {
        self.payment_outcomes.lock().unwrap().push_back(Err(error));
    }

    pub fn mark_paid(&self, external_id: &str) {
        self.paid.lock().unwrap().insert(external_id.to_string());
    }

    pub fn posted_count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn post_transaction(
        &self,
        _account_id: &str,
        payload: &LedgerPayload,
    ) -> Result<LedgerReceipt, LedgerError> {
        if let Some(Err(err)) = self.outcomes.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut posted = self.posted.lock().unwrap();
        posted.push(payload.clone());
        let external_id = format!("{}-{}", payload.kind, posted.len());
        Ok(LedgerReceipt {
            raw: serde_json::json!({ "id": external_id }),
            external_id,
            url: None,
        })
    }

    async fn transaction_status(
        &self,
        _account_id: &str,
        _kind: TransactionKind,
        external_id: &str,
    ) -> Result<LedgerStatus, LedgerError> {
        Ok(LedgerStatus {
            paid: self.paid.lock().unwrap().contains(external_id),
            raw: serde_json::Value::Null,
        })
    }

    async fn post_vendor_payment(
        &self,
        _account_id: &str,
        payment: &VendorPayment,
    ) -> Result<LedgerReceipt, LedgerError> {
        if let Some(Err(err)) = self.payment_outcomes.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut payments = self.payments.lock().unwrap();
        payments.push(payment.clone());
        let external_id = format!("PAY-{}", payments.len());
        Ok(LedgerReceipt {
            raw: serde_json::json!({ "id": external_id }),
            external_id,
            url: None,
        })
    }
}

#[derive(Default)]
pub struct FakeMappings {
    pub known: Mutex<HashMap<(MappingSourceType, String), ResolvedMapping>>,
}

impl FakeMappings {
    pub fn map(&self, source_type: MappingSourceType, source_value: &str, destination_id: &str) {
        self.known.lock().unwrap().insert(
            (source_type, source_value.to_string()),
            ResolvedMapping {
                destination_id: destination_id.to_string(),
                tax_rate: None,
            },
        );
    }
}

#[async_trait]
impl MappingResolver for FakeMappings {
    async fn resolve(
        &self,
        _account_id: &str,
        source_type: MappingSourceType,
        source_value: &str,
    ) -> ResultEngine<Option<ResolvedMapping>> {
        Ok(self
            .known
            .lock()
            .unwrap()
            .get(&(source_type, source_value.to_string()))
            .cloned())
    }
}

pub struct Harness {
    pub engine: Engine,
    /// Same connection the engine uses.
    pub db: DatabaseConnection,
    pub source: Arc<FakeSource>,
    pub ledger: Arc<FakeLedger>,
    pub mappings: Arc<FakeMappings>,
}

impl Harness {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.source.clone(),
            self.ledger.clone(),
            self.mappings.clone(),
        )
    }

    /// Maps the employee and categories used by [`raw`] records.
    pub fn map_defaults(&self) {
        self.mappings
            .map(MappingSourceType::Employee, "alice@example.test", "V-ALICE");
        self.mappings
            .map(MappingSourceType::Employee, "bob@example.test", "V-BOB");
        self.mappings
            .map(MappingSourceType::Category, "Travel", "ACC-TRAVEL");
        self.mappings
            .map(MappingSourceType::Category, "Meals", "ACC-MEALS");
    }
}

pub async fn harness() -> Harness {
    harness_with(AccountConfig::new(ACCOUNT)).await
}

pub async fn harness_with(config: AccountConfig) -> Harness {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    let settings = EngineSettings {
        export_summary_backoff_ms: 0,
        ..EngineSettings::default()
    };
    let engine = Engine::builder()
        .database(db.clone())
        .settings(settings)
        .build()
        .await
        .unwrap();
    engine.save_account_config(&config).await.unwrap();
    Harness {
        engine,
        db,
        source: Arc::new(FakeSource::default()),
        ledger: Arc::new(FakeLedger::default()),
        mappings: Arc::new(FakeMappings::default()),
    }
}

pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 10, 0, 0).unwrap()
}

/// A reimbursable Travel expense of `amount` for alice on `report`.
pub fn raw(id: &str, report: &str, amount: f64) -> RawExpense {
    RawExpense {
        id: id.to_string(),
        expense_number: Some(format!("E/{id}")),
        employee_email: "alice@example.test".to_string(),
        employee_name: Some("Alice".to_string()),
        category: Some("Travel".to_string()),
        sub_category: None,
        project: None,
        cost_center: None,
        merchant: None,
        purpose: None,
        report_id: Some(report.to_string()),
        report_title: Some(format!("Report {report}")),
        claim_number: Some(format!("C/{report}")),
        settlement_id: None,
        corporate_card_id: None,
        bank_transaction_id: None,
        amount,
        tax_amount: None,
        tax_group_id: None,
        currency: "USD".to_string(),
        foreign_amount: None,
        foreign_currency: None,
        fund_source: FundSource::Personal,
        state: "PAYMENT_PROCESSING".to_string(),
        billable: false,
        spent_at: Some(at(1)),
        approved_at: Some(at(2)),
        posted_at: None,
        created_at: at(1),
        updated_at: at(2),
        custom_properties: Default::default(),
    }
}

/// A corporate card expense at `merchant`.
pub fn card(id: &str, report: &str, amount: f64, merchant: &str) -> RawExpense {
    RawExpense {
        fund_source: FundSource::CorporateCard,
        merchant: Some(merchant.to_string()),
        corporate_card_id: Some("card-1".to_string()),
        state: "APPROVED".to_string(),
        ..raw(id, report, amount)
    }
}

/// Ingests and groups `records`, returning the created group ids.
pub async fn ingest_and_group(harness: &Harness, records: Vec<RawExpense>) -> Vec<String> {
    let eligible = harness
        .engine
        .ingest_expenses(ACCOUNT, records, false)
        .await
        .unwrap();
    harness
        .engine
        .group_expenses(ACCOUNT, &eligible)
        .await
        .unwrap()
        .groups
        .into_iter()
        .map(|group| group.id)
        .collect()
}
