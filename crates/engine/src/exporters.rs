//! Per-kind transaction builders.
//!
//! The four destination kinds share one export state machine and differ only
//! in how the booking entity is resolved and how the payload is shaped. Each
//! kind implements [`Exporter`]; [`exporter_for`] dispatches on the
//! [`TransactionKind`] tag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    EngineError, Money, ResultEngine,
    account_configs::{AccountConfig, ExportDateType, TransactionKind},
    expense_groups::ExpenseGroup,
    expenses::{Expense, FundSource},
    export_errors::MappingSourceType,
    ports::{Ledger, LedgerError, LedgerReceipt, MappingResolver},
    validation::{MappingCollector, ResolvedDimensions},
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerLine {
    pub expense_id: String,
    pub account_id: String,
    /// Amount net of tax.
    pub amount: Money,
    pub tax_code_id: Option<String>,
    pub tax_amount: Option<Money>,
    pub description: String,
    pub project: Option<String>,
    pub cost_center: Option<String>,
    pub billable: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerPayload {
    pub kind: TransactionKind,
    /// Card charge group with a negative total, booked as a refund with
    /// positive line amounts.
    pub refund: bool,
    pub expense_group_id: String,
    pub entity_id: String,
    pub card_account_id: Option<String>,
    pub transaction_date: DateTime<Utc>,
    pub currency: String,
    pub reference: Option<String>,
    pub memo: String,
    pub lines: Vec<LedgerLine>,
}

impl LedgerPayload {
    /// Gross total: line amounts plus their tax.
    pub fn total(&self) -> Money {
        self.lines
            .iter()
            .map(|line| line.amount + line.tax_amount.unwrap_or(Money::ZERO))
            .sum()
    }
}

/// Everything a builder needs to know about the group being exported.
pub struct ExportContext<'a> {
    pub config: &'a AccountConfig,
    pub group: &'a ExpenseGroup,
    pub expenses: &'a [Expense],
    pub now: DateTime<Utc>,
}

impl ExportContext<'_> {
    pub fn total(&self) -> Money {
        self.expenses.iter().map(|e| e.amount).sum()
    }

    fn employee_email(&self) -> ResultEngine<&str> {
        self.expenses
            .first()
            .map(|e| e.employee_email.as_str())
            .ok_or_else(|| EngineError::InvalidState(format!("group {} is empty", self.group.id)))
    }

    fn currency(&self) -> String {
        self.expenses
            .first()
            .map(|e| e.currency.clone())
            .unwrap_or_default()
    }

    fn reference(&self) -> Option<String> {
        self.expenses
            .iter()
            .find_map(|e| e.claim_number.clone().or_else(|| e.report_id.clone()))
    }

    /// Transaction date per the configured export date type.
    pub fn transaction_date(&self) -> DateTime<Utc> {
        let date_type = self.config.grouping(self.group.fund_source).date_type;
        let latest = |pick: fn(&Expense) -> Option<DateTime<Utc>>| {
            self.expenses.iter().filter_map(pick).max()
        };
        let date = match date_type {
            ExportDateType::CurrentDate => None,
            ExportDateType::SpentAt | ExportDateType::LastSpentAt => latest(|e| e.spent_at),
            ExportDateType::ApprovedAt => latest(|e| e.approved_at),
            ExportDateType::PostedAt => latest(|e| e.posted_at),
        };
        date.unwrap_or(self.now)
    }
}

#[async_trait]
pub trait Exporter: Send + Sync {
    fn kind(&self) -> TransactionKind;

    /// Resolves every dimension the payload needs.
    ///
    /// Fails with [`EngineError::Validation`] listing all missing mappings.
    async fn validate(
        &self,
        ctx: &ExportContext<'_>,
        resolver: &dyn MappingResolver,
    ) -> ResultEngine<ResolvedDimensions>;

    fn build_payload(&self, ctx: &ExportContext<'_>, dims: &ResolvedDimensions) -> LedgerPayload;

    async fn post(
        &self,
        ledger: &dyn Ledger,
        account_id: &str,
        payload: &LedgerPayload,
    ) -> Result<LedgerReceipt, LedgerError> {
        ledger.post_transaction(account_id, payload).await
    }
}

pub fn exporter_for(kind: TransactionKind) -> Box<dyn Exporter> {
    match kind {
        TransactionKind::Bill => Box::new(BillExporter),
        TransactionKind::ExpenseReport => Box::new(ExpenseReportExporter),
        TransactionKind::JournalEntry => Box::new(JournalEntryExporter),
        TransactionKind::CreditCardCharge => Box::new(CreditCardChargeExporter),
    }
}

pub struct BillExporter;
pub struct ExpenseReportExporter;
pub struct JournalEntryExporter;
pub struct CreditCardChargeExporter;

#[async_trait]
impl Exporter for BillExporter {
    fn kind(&self) -> TransactionKind {
        TransactionKind::Bill
    }

    async fn validate(
        &self,
        ctx: &ExportContext<'_>,
        resolver: &dyn MappingResolver,
    ) -> ResultEngine<ResolvedDimensions> {
        let mut collector = MappingCollector::new(resolver, &ctx.config.account_id);
        let entity_id = require_employee(ctx, &mut collector).await?;
        finish(ctx, collector, entity_id, None).await
    }

    fn build_payload(&self, ctx: &ExportContext<'_>, dims: &ResolvedDimensions) -> LedgerPayload {
        base_payload(
            self.kind(),
            ctx,
            dims,
            format!("Reimbursable expenses by {}", employee_label(ctx)),
        )
    }
}

#[async_trait]
impl Exporter for ExpenseReportExporter {
    fn kind(&self) -> TransactionKind {
        TransactionKind::ExpenseReport
    }

    async fn validate(
        &self,
        ctx: &ExportContext<'_>,
        resolver: &dyn MappingResolver,
    ) -> ResultEngine<ResolvedDimensions> {
        let mut collector = MappingCollector::new(resolver, &ctx.config.account_id);
        let entity_id = require_employee(ctx, &mut collector).await?;
        let card_account_id = if ctx.group.fund_source == FundSource::CorporateCard {
            require_card_account(ctx, &mut collector).await?
        } else {
            None
        };
        finish(ctx, collector, entity_id, card_account_id).await
    }

    fn build_payload(&self, ctx: &ExportContext<'_>, dims: &ResolvedDimensions) -> LedgerPayload {
        let title = ctx
            .expenses
            .iter()
            .find_map(|e| e.report_title.clone())
            .unwrap_or_else(|| format!("Expense report by {}", employee_label(ctx)));
        base_payload(self.kind(), ctx, dims, title)
    }
}

#[async_trait]
impl Exporter for JournalEntryExporter {
    fn kind(&self) -> TransactionKind {
        TransactionKind::JournalEntry
    }

    async fn validate(
        &self,
        ctx: &ExportContext<'_>,
        resolver: &dyn MappingResolver,
    ) -> ResultEngine<ResolvedDimensions> {
        let mut collector = MappingCollector::new(resolver, &ctx.config.account_id);
        let entity_id = require_employee(ctx, &mut collector).await?;
        let card_account_id = if ctx.group.fund_source == FundSource::CorporateCard {
            require_card_account(ctx, &mut collector).await?
        } else {
            None
        };
        finish(ctx, collector, entity_id, card_account_id).await
    }

    fn build_payload(&self, ctx: &ExportContext<'_>, dims: &ResolvedDimensions) -> LedgerPayload {
        let source = match ctx.group.fund_source {
            FundSource::Personal => "Reimbursable",
            FundSource::CorporateCard => "Corporate card",
        };
        base_payload(
            self.kind(),
            ctx,
            dims,
            format!("{source} expenses by {}", employee_label(ctx)),
        )
    }
}

#[async_trait]
impl Exporter for CreditCardChargeExporter {
    fn kind(&self) -> TransactionKind {
        TransactionKind::CreditCardCharge
    }

    async fn validate(
        &self,
        ctx: &ExportContext<'_>,
        resolver: &dyn MappingResolver,
    ) -> ResultEngine<ResolvedDimensions> {
        let mut collector = MappingCollector::new(resolver, &ctx.config.account_id);

        let merchant = ctx.expenses.iter().find_map(|e| e.merchant.clone());
        let mut entity_id = match merchant.as_deref() {
            Some(merchant) => collector
                .lookup(MappingSourceType::Merchant, merchant)
                .await?
                .map(|m| m.destination_id),
            None => None,
        };
        if entity_id.is_none() {
            entity_id = ctx.config.default_ccc_vendor_id.clone();
        }
        if entity_id.is_none() {
            collector.record_missing(
                MappingSourceType::Merchant,
                merchant.as_deref().unwrap_or("Credit Card Misc"),
            );
        }

        let card_account_id = require_card_account(ctx, &mut collector).await?;
        finish(
            ctx,
            collector,
            entity_id.unwrap_or_default(),
            card_account_id,
        )
        .await
    }

    fn build_payload(&self, ctx: &ExportContext<'_>, dims: &ResolvedDimensions) -> LedgerPayload {
        let mut payload = base_payload(
            self.kind(),
            ctx,
            dims,
            format!("Credit card expenses by {}", employee_label(ctx)),
        );
        if ctx.total().is_negative() {
            payload.refund = true;
            for line in &mut payload.lines {
                line.amount = -line.amount;
                line.tax_amount = line.tax_amount.map(|tax| -tax);
            }
        }
        payload
    }
}

async fn require_employee(
    ctx: &ExportContext<'_>,
    collector: &mut MappingCollector<'_>,
) -> ResultEngine<String> {
    let email = ctx.employee_email()?;
    Ok(collector
        .require(MappingSourceType::Employee, email)
        .await?
        .map(|m| m.destination_id)
        .unwrap_or_default())
}

/// Card account of the group's card, falling back to the account default.
async fn require_card_account(
    ctx: &ExportContext<'_>,
    collector: &mut MappingCollector<'_>,
) -> ResultEngine<Option<String>> {
    let card = ctx.expenses.iter().find_map(|e| e.corporate_card_id.clone());
    let mapped = match card.as_deref() {
        Some(card) => collector
            .lookup(MappingSourceType::CorporateCard, card)
            .await?
            .map(|m| m.destination_id),
        None => None,
    };
    let resolved = mapped.or_else(|| ctx.config.default_ccc_account_id.clone());
    if resolved.is_none() {
        collector.record_missing(
            MappingSourceType::CorporateCard,
            card.as_deref().unwrap_or("default"),
        );
    }
    Ok(resolved)
}

/// Resolves line accounts and tax codes, then fails if anything is missing.
async fn finish(
    ctx: &ExportContext<'_>,
    mut collector: MappingCollector<'_>,
    entity_id: String,
    card_account_id: Option<String>,
) -> ResultEngine<ResolvedDimensions> {
    let mut dims = ResolvedDimensions {
        entity_id,
        card_account_id,
        ..ResolvedDimensions::default()
    };

    for expense in ctx.expenses {
        match expense.category_key() {
            Some(category) => {
                if let Some(mapping) = collector
                    .require(MappingSourceType::Category, &category)
                    .await?
                {
                    dims.line_accounts
                        .insert(expense.expense_id.clone(), mapping.destination_id);
                }
            }
            None => collector.record_missing(MappingSourceType::Category, "Uncategorized"),
        }

        if let (Some(tax_group), Some(_)) = (expense.tax_group_id.as_deref(), expense.tax_amount)
            && let Some(mapping) = collector.require(MappingSourceType::TaxGroup, tax_group).await?
        {
            dims.tax_codes.insert(expense.expense_id.clone(), mapping);
        }
    }

    collector.finish()?;
    Ok(dims)
}

fn employee_label(ctx: &ExportContext<'_>) -> String {
    ctx.expenses
        .first()
        .map(|e| e.employee_name.clone().unwrap_or_else(|| e.employee_email.clone()))
        .unwrap_or_default()
}

fn base_payload(
    kind: TransactionKind,
    ctx: &ExportContext<'_>,
    dims: &ResolvedDimensions,
    memo: String,
) -> LedgerPayload {
    LedgerPayload {
        kind,
        refund: false,
        expense_group_id: ctx.group.id.clone(),
        entity_id: dims.entity_id.clone(),
        card_account_id: dims.card_account_id.clone(),
        transaction_date: ctx.transaction_date(),
        currency: ctx.currency(),
        reference: ctx.reference(),
        memo,
        lines: build_lines(ctx, dims),
    }
}

fn build_lines(ctx: &ExportContext<'_>, dims: &ResolvedDimensions) -> Vec<LedgerLine> {
    let mut lines = Vec::with_capacity(ctx.expenses.len());
    for expense in ctx.expenses {
        let account_id = dims
            .line_accounts
            .get(&expense.expense_id)
            .cloned()
            .unwrap_or_default();
        let tax_mapping = dims.tax_codes.get(&expense.expense_id);
        let splits = split_tax(
            expense.amount,
            tax_mapping.and(expense.tax_amount),
            tax_mapping.and_then(|m| m.tax_rate),
            ctx.config.tax_override_enabled,
        );
        let description = match expense.purpose.as_deref() {
            Some(purpose) => format!("{} - {purpose}", expense.employee_email),
            None => expense.employee_email.clone(),
        };
        for split in splits {
            lines.push(LedgerLine {
                expense_id: expense.expense_id.clone(),
                account_id: account_id.clone(),
                amount: split.net,
                tax_code_id: split
                    .tax
                    .and(tax_mapping.map(|m| m.destination_id.clone())),
                tax_amount: split.tax,
                description: description.clone(),
                project: expense.project.clone(),
                cost_center: expense.cost_center.clone(),
                billable: expense.billable,
            });
        }
    }
    lines
}

/// One ledger line produced from an expense amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSplit {
    pub net: Money,
    pub tax: Option<Money>,
}

/// Splits a gross `amount` carrying `tax` into ledger lines.
///
/// With the tax override on and a tax that differs from the proportional
/// `amount * rate / (1 + rate)`, the line becomes a taxed part (net
/// `tax / rate`) and an untaxed remainder. Otherwise the tax is netted off a
/// single line.
pub fn split_tax(
    amount: Money,
    tax: Option<Money>,
    rate: Option<f64>,
    override_enabled: bool,
) -> Vec<LineSplit> {
    let Some(tax) = tax else {
        return vec![LineSplit {
            net: amount,
            tax: None,
        }];
    };

    if override_enabled
        && let Some(rate) = rate
        && rate > 0.0
    {
        let expected = amount.scale(rate / (1.0 + rate));
        if expected != tax {
            let taxed_net = tax.scale(1.0 / rate);
            let untaxed = amount - taxed_net - tax;
            let mut splits = vec![LineSplit {
                net: taxed_net,
                tax: Some(tax),
            }];
            if !untaxed.is_zero() {
                splits.push(LineSplit {
                    net: untaxed,
                    tax: None,
                });
            }
            return splits;
        }
    }

    vec![LineSplit {
        net: amount - tax,
        tax: Some(tax),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_tax_keeps_gross_amount() {
        assert_eq!(
            split_tax(Money::new(1000), None, None, true),
            vec![LineSplit {
                net: Money::new(1000),
                tax: None
            }]
        );
    }

    #[test]
    fn proportional_tax_is_netted_off_one_line() {
        let splits = split_tax(Money::new(11000), Some(Money::new(1000)), Some(0.10), true);
        assert_eq!(
            splits,
            vec![LineSplit {
                net: Money::new(10000),
                tax: Some(Money::new(1000))
            }]
        );
    }

    #[test]
    fn overridden_tax_splits_into_taxed_and_untaxed_lines() {
        let splits = split_tax(Money::new(11000), Some(Money::new(500)), Some(0.10), true);
        assert_eq!(
            splits,
            vec![
                LineSplit {
                    net: Money::new(5000),
                    tax: Some(Money::new(500))
                },
                LineSplit {
                    net: Money::new(5500),
                    tax: None
                },
            ]
        );
        let gross: Money = splits
            .iter()
            .map(|s| s.net + s.tax.unwrap_or(Money::ZERO))
            .sum();
        assert_eq!(gross, Money::new(11000));
    }

    #[test]
    fn differing_tax_without_override_is_netted() {
        let splits = split_tax(Money::new(11000), Some(Money::new(500)), Some(0.10), false);
        assert_eq!(
            splits,
            vec![LineSplit {
                net: Money::new(10500),
                tax: Some(Money::new(500))
            }]
        );
    }
}
