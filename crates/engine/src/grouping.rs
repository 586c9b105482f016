//! Partitioning of eligible expenses into export groups.
//!
//! The partitioner is pure: it decides membership and descriptions, and the
//! caller persists the result inside one transaction (see
//! `Engine::group_expenses`).
//!
//! Grouping is deterministic: candidates are keyed by the ordered tuple of
//! grouping values and emitted in key order, members sorted by expense id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    Money,
    account_configs::{AccountConfig, ExportDateType, GroupingField, GroupingSettings},
    expense_groups::GroupDescription,
    expenses::{Expense, FundSource, SECONDS_FORMAT},
};

/// Grouping rules for one fund source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupingPolicy {
    pub fields: Vec<GroupingField>,
    pub date_type: ExportDateType,
    /// Drop negative members of groups whose total is negative.
    pub enforce_non_negative: bool,
    /// Card expenses carrying a bank transaction id are grouped per bank
    /// transaction.
    pub split_by_bank_transaction: bool,
}

impl GroupingPolicy {
    pub fn new(settings: &GroupingSettings) -> Self {
        Self {
            fields: settings.effective_fields(),
            date_type: settings.date_type,
            enforce_non_negative: false,
            split_by_bank_transaction: false,
        }
    }

    /// Policy for a fund source, or `None` when it is not exported.
    pub fn for_fund_source(config: &AccountConfig, fund_source: FundSource) -> Option<Self> {
        let kind = config.export_type(fund_source)?;
        let mut policy = Self::new(config.grouping(fund_source));
        policy.enforce_non_negative = config.requires_non_negative(kind);
        policy.split_by_bank_transaction = fund_source == FundSource::CorporateCard
            && kind == crate::account_configs::TransactionKind::CreditCardCharge
            && config.split_ccc_by_bank_transaction;
        Some(policy)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateGroup {
    pub fund_source: FundSource,
    pub description: GroupDescription,
    pub expense_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupingOutcome {
    pub groups: Vec<CandidateGroup>,
    /// Expenses dropped by the sign policy.
    pub skipped_expense_ids: Vec<String>,
}

type GroupKey = Vec<Option<String>>;

/// Partitions `expenses` into candidate groups.
///
/// Expenses of a fund source without a policy are left out. Expenses that
/// are skipped or already grouped must be filtered out by the caller.
pub fn partition(
    expenses: &[Expense],
    personal: Option<&GroupingPolicy>,
    corporate_card: Option<&GroupingPolicy>,
    now: DateTime<Utc>,
) -> GroupingOutcome {
    let mut outcome = GroupingOutcome::default();

    let (personal_expenses, ccc_expenses): (Vec<&Expense>, Vec<&Expense>) = expenses
        .iter()
        .partition(|e| e.fund_source == FundSource::Personal);

    if let Some(policy) = personal {
        partition_personal(&personal_expenses, policy, now, &mut outcome);
    }
    if let Some(policy) = corporate_card {
        partition_corporate_card(&ccc_expenses, policy, now, &mut outcome);
    }

    outcome.skipped_expense_ids.sort();
    outcome
}

fn partition_personal(
    expenses: &[&Expense],
    policy: &GroupingPolicy,
    now: DateTime<Utc>,
    outcome: &mut GroupingOutcome,
) {
    let by_date = policy.fields.contains(&GroupingField::SpentAt);
    for (_, members) in bucket(expenses, &policy.fields) {
        let kept = if policy.enforce_non_negative {
            apply_sign_policy(members, by_date, &mut outcome.skipped_expense_ids)
        } else {
            members
        };
        push_candidate(FundSource::Personal, &policy.fields, policy.date_type, kept, now, outcome);
    }
}

fn partition_corporate_card(
    expenses: &[&Expense],
    policy: &GroupingPolicy,
    now: DateTime<Utc>,
    outcome: &mut GroupingOutcome,
) {
    let mut sets: Vec<(Vec<GroupingField>, Vec<&Expense>)> = Vec::new();
    if policy.split_by_bank_transaction {
        let (with_bank, without_bank): (Vec<&Expense>, Vec<&Expense>) = expenses
            .iter()
            .copied()
            .partition(|e| e.bank_transaction_id.is_some());
        let mut bank_fields: Vec<GroupingField> = policy
            .fields
            .iter()
            .copied()
            .filter(|f| !matches!(f, GroupingField::ExpenseId | GroupingField::ExpenseNumber))
            .collect();
        if !bank_fields.contains(&GroupingField::BankTransactionId) {
            bank_fields.push(GroupingField::BankTransactionId);
        }
        sets.push((bank_fields, with_bank));
        sets.push((policy.fields.clone(), without_bank));
    } else {
        sets.push((policy.fields.clone(), expenses.to_vec()));
    }

    for (fields, members) in sets {
        for (_, bucket_members) in bucket(&members, &fields) {
            let kept = if policy.enforce_non_negative {
                apply_sign_policy(bucket_members, false, &mut outcome.skipped_expense_ids)
            } else {
                bucket_members
            };
            push_candidate(
                FundSource::CorporateCard,
                &fields,
                policy.date_type,
                kept,
                now,
                outcome,
            );
        }
    }
}

fn bucket<'a>(
    expenses: &[&'a Expense],
    fields: &[GroupingField],
) -> BTreeMap<GroupKey, Vec<&'a Expense>> {
    let mut buckets: BTreeMap<GroupKey, Vec<&'a Expense>> = BTreeMap::new();
    for expense in expenses {
        let key = fields.iter().map(|f| expense.grouping_value(*f)).collect();
        buckets.entry(key).or_default().push(*expense);
    }
    for members in buckets.values_mut() {
        members.sort_by(|a, b| a.expense_id.cmp(&b.expense_id));
    }
    buckets
}

/// Removes negative members of every bucket whose total is negative.
///
/// Buckets are per spent date when `by_date`, otherwise the whole group.
fn apply_sign_policy<'a>(
    members: Vec<&'a Expense>,
    by_date: bool,
    skipped: &mut Vec<String>,
) -> Vec<&'a Expense> {
    let mut buckets: BTreeMap<Option<String>, Vec<&'a Expense>> = BTreeMap::new();
    for expense in members {
        let key = if by_date {
            expense.grouping_value(GroupingField::SpentAt)
        } else {
            None
        };
        buckets.entry(key).or_default().push(expense);
    }

    let mut kept = Vec::new();
    for (_, bucket) in buckets {
        let total: Money = bucket.iter().map(|e| e.amount).sum();
        if total.is_negative() {
            for expense in bucket {
                if expense.amount.is_negative() {
                    skipped.push(expense.expense_id.clone());
                } else {
                    kept.push(expense);
                }
            }
        } else {
            kept.extend(bucket);
        }
    }
    kept.sort_by(|a, b| a.expense_id.cmp(&b.expense_id));
    kept
}

fn push_candidate(
    fund_source: FundSource,
    fields: &[GroupingField],
    date_type: ExportDateType,
    members: Vec<&Expense>,
    now: DateTime<Utc>,
    outcome: &mut GroupingOutcome,
) {
    if members.is_empty() {
        return;
    }
    outcome.groups.push(CandidateGroup {
        fund_source,
        description: describe(fields, date_type, &members, now),
        expense_ids: members.iter().map(|e| e.expense_id.clone()).collect(),
    });
}

fn describe(
    fields: &[GroupingField],
    date_type: ExportDateType,
    members: &[&Expense],
    now: DateTime<Utc>,
) -> GroupDescription {
    let mut description = GroupDescription::new();
    let first = members[0];
    let configured_date = date_type.grouping_field();

    for field in fields {
        match first.grouping_value(*field) {
            Some(value) => {
                description.insert(field.as_str().to_string(), value);
            }
            None if field.is_date() && configured_date == Some(*field) => {
                description.insert(
                    field.as_str().to_string(),
                    now.format(SECONDS_FORMAT).to_string(),
                );
            }
            None => {}
        }
    }

    if date_type == ExportDateType::LastSpentAt {
        let last = members
            .iter()
            .filter_map(|e| e.spent_at)
            .max()
            .unwrap_or(now);
        description.insert(
            "last_spent_at".to_string(),
            last.format(SECONDS_FORMAT).to_string(),
        );
    }

    description
        .entry(GroupingField::FundSource.as_str().to_string())
        .or_insert_with(|| first.fund_source.as_str().to_string());

    description
}
