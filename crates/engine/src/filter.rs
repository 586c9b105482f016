//! Skip-rule predicates.
//!
//! Stored [`ExpenseFilter`] rows are compiled into an [`Expr`] tree of
//! [`Predicate`] leaves and evaluated against expenses. Custom-property
//! predicates are built through [`PredicateBuilder`], one method per operator,
//! parametrized by the property key.

use chrono::{DateTime, Utc};

use crate::{
    EngineError, ResultEngine,
    expense_filters::{CustomFieldType, ExpenseFilter, FilterOperator, JoinBy},
    expenses::{CustomPropertyValue, Expense},
    util::parse_date_literal,
};

/// Standard expense attributes a filter can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpenseField {
    EmployeeEmail,
    ExpenseNumber,
    ReportId,
    ReportTitle,
    ClaimNumber,
    Category,
    SubCategory,
    Project,
    CostCenter,
    Merchant,
    Purpose,
    FundSource,
    State,
    Amount,
    SpentAt,
    ApprovedAt,
    PostedAt,
}

impl TryFrom<&str> for ExpenseField {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value {
            "employee_email" => Self::EmployeeEmail,
            "expense_number" => Self::ExpenseNumber,
            "report_id" => Self::ReportId,
            "report_title" => Self::ReportTitle,
            "claim_number" => Self::ClaimNumber,
            "category" => Self::Category,
            "sub_category" => Self::SubCategory,
            "project" => Self::Project,
            "cost_center" => Self::CostCenter,
            "merchant" | "vendor" => Self::Merchant,
            "purpose" => Self::Purpose,
            "fund_source" => Self::FundSource,
            "state" => Self::State,
            "amount" => Self::Amount,
            "spent_at" => Self::SpentAt,
            "approved_at" => Self::ApprovedAt,
            "posted_at" => Self::PostedAt,
            other => {
                return Err(EngineError::InvalidFilter(format!(
                    "unknown expense field: {other}"
                )));
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Scalar {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
}

impl ExpenseField {
    fn value(self, expense: &Expense) -> Option<Scalar> {
        let text = |value: &Option<String>| value.clone().map(Scalar::Text);
        match self {
            Self::EmployeeEmail => Some(Scalar::Text(expense.employee_email.clone())),
            Self::ExpenseNumber => text(&expense.expense_number),
            Self::ReportId => text(&expense.report_id),
            Self::ReportTitle => text(&expense.report_title),
            Self::ClaimNumber => text(&expense.claim_number),
            Self::Category => text(&expense.category),
            Self::SubCategory => text(&expense.sub_category),
            Self::Project => text(&expense.project),
            Self::CostCenter => text(&expense.cost_center),
            Self::Merchant => text(&expense.merchant),
            Self::Purpose => text(&expense.purpose),
            Self::FundSource => Some(Scalar::Text(expense.fund_source.as_str().to_string())),
            Self::State => Some(Scalar::Text(expense.state.clone())),
            Self::Amount => Some(Scalar::Number(expense.amount.to_major())),
            Self::SpentAt => expense.spent_at.map(Scalar::Date),
            Self::ApprovedAt => expense.approved_at.map(Scalar::Date),
            Self::PostedAt => expense.posted_at.map(Scalar::Date),
        }
    }
}

/// The key a predicate reads.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKey {
    Expense(ExpenseField),
    Custom {
        key: String,
        field_type: CustomFieldType,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    In { key: FieldKey, values: Vec<String> },
    /// Present, non-null and not among `values`.
    NotIn { key: FieldKey, values: Vec<String> },
    Iexact { key: FieldKey, value: String },
    Icontains { key: FieldKey, value: String },
    Lt { key: FieldKey, value: String },
    Lte { key: FieldKey, value: String },
    IsNull { key: FieldKey, is_null: bool },
    Not(Box<Predicate>),
}

/// One constructor per filter operator.
pub trait PredicateBuilder {
    fn in_values(&self, values: &[String]) -> Predicate;
    fn not_in(&self, values: &[String]) -> Predicate;
    fn iexact(&self, value: &str) -> Predicate;
    fn icontains(&self, value: &str) -> Predicate;
    fn lt(&self, value: &str) -> Predicate;
    fn lte(&self, value: &str) -> Predicate;
    fn is_null(&self, is_null: bool) -> Predicate;
}

impl PredicateBuilder for FieldKey {
    fn in_values(&self, values: &[String]) -> Predicate {
        Predicate::In {
            key: self.clone(),
            values: self.coerce(values),
        }
    }

    fn not_in(&self, values: &[String]) -> Predicate {
        match self {
            // A select property may be absent; "not in" is the plain
            // negation of "in" so absent keys match too.
            FieldKey::Custom {
                field_type: CustomFieldType::Select,
                ..
            } => Predicate::Not(Box::new(self.in_values(values))),
            _ => Predicate::NotIn {
                key: self.clone(),
                values: self.coerce(values),
            },
        }
    }

    fn iexact(&self, value: &str) -> Predicate {
        Predicate::Iexact {
            key: self.clone(),
            value: value.to_string(),
        }
    }

    fn icontains(&self, value: &str) -> Predicate {
        Predicate::Icontains {
            key: self.clone(),
            value: value.to_string(),
        }
    }

    fn lt(&self, value: &str) -> Predicate {
        Predicate::Lt {
            key: self.clone(),
            value: value.to_string(),
        }
    }

    fn lte(&self, value: &str) -> Predicate {
        Predicate::Lte {
            key: self.clone(),
            value: value.to_string(),
        }
    }

    fn is_null(&self, is_null: bool) -> Predicate {
        Predicate::IsNull {
            key: self.clone(),
            is_null,
        }
    }
}

impl FieldKey {
    /// `NUMBER` custom values compare as integers.
    fn coerce(&self, values: &[String]) -> Vec<String> {
        match self {
            FieldKey::Custom {
                field_type: CustomFieldType::Number,
                ..
            } => values.iter().map(|v| integer_form(v)).collect(),
            _ => values.to_vec(),
        }
    }

    /// `None` = absent, `Some(None)` = explicit null.
    fn lookup(&self, expense: &Expense) -> Option<Option<Vec<Scalar>>> {
        match self {
            FieldKey::Expense(field) => Some(field.value(expense).map(|v| vec![v])),
            FieldKey::Custom { key, field_type } => {
                let value = expense.custom_properties.get(key)?;
                Some(value.as_ref().map(|v| custom_scalars(v, *field_type)))
            }
        }
    }

    fn is_number(&self) -> bool {
        matches!(
            self,
            FieldKey::Expense(ExpenseField::Amount)
                | FieldKey::Custom {
                    field_type: CustomFieldType::Number,
                    ..
                }
        )
    }
}

fn integer_form(value: &str) -> String {
    match value.trim().parse::<f64>() {
        Ok(number) => (number.trunc() as i64).to_string(),
        Err(_) => value.trim().to_string(),
    }
}

fn custom_scalars(value: &CustomPropertyValue, field_type: CustomFieldType) -> Vec<Scalar> {
    match (field_type, value) {
        (CustomFieldType::Number, value) => match value.as_number() {
            Some(number) => vec![Scalar::Number(number.trunc())],
            None => value.texts().into_iter().map(Scalar::Text).collect(),
        },
        (_, value) => value.texts().into_iter().map(Scalar::Text).collect(),
    }
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Scalar::Text(text) => text.clone(),
            Scalar::Number(number) if number.fract() == 0.0 => (*number as i64).to_string(),
            Scalar::Number(number) => number.to_string(),
            Scalar::Date(date) => date.to_rfc3339(),
        }
    }

    fn equals(&self, literal: &str) -> bool {
        match self {
            Scalar::Number(number) => literal
                .trim()
                .parse::<f64>()
                .is_ok_and(|other| (number - other).abs() < f64::EPSILON),
            Scalar::Date(date) => parse_date_literal(literal).is_some_and(|other| *date == other),
            Scalar::Text(text) => text == literal,
        }
    }

    /// Orders the value against a literal; `None` when not comparable.
    fn compare(&self, literal: &str) -> Option<std::cmp::Ordering> {
        match self {
            Scalar::Number(number) => literal
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|other| number.partial_cmp(&other)),
            Scalar::Date(date) => parse_date_literal(literal).map(|other| date.cmp(&other)),
            Scalar::Text(text) => match (text.trim().parse::<f64>(), literal.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(text.as_str().cmp(literal)),
            },
        }
    }
}

impl Predicate {
    pub fn matches(&self, expense: &Expense) -> bool {
        match self {
            Predicate::Not(inner) => !inner.matches(expense),
            Predicate::IsNull { key, is_null } => {
                let present = matches!(key.lookup(expense), Some(Some(ref values)) if !values.is_empty());
                present != *is_null
            }
            Predicate::In { key, values } => present_values(key, expense)
                .iter()
                .any(|scalar| values.iter().any(|v| scalar_in(key, scalar, v))),
            Predicate::NotIn { key, values } => {
                let scalars = present_values(key, expense);
                !scalars.is_empty()
                    && !scalars
                        .iter()
                        .any(|scalar| values.iter().any(|v| scalar_in(key, scalar, v)))
            }
            Predicate::Iexact { key, value } => present_values(key, expense)
                .iter()
                .any(|scalar| scalar.text().to_lowercase() == value.to_lowercase()),
            Predicate::Icontains { key, value } => present_values(key, expense)
                .iter()
                .any(|scalar| scalar.text().to_lowercase().contains(&value.to_lowercase())),
            Predicate::Lt { key, value } => present_values(key, expense)
                .iter()
                .any(|scalar| scalar.compare(value) == Some(std::cmp::Ordering::Less)),
            Predicate::Lte { key, value } => present_values(key, expense).iter().any(|scalar| {
                matches!(
                    scalar.compare(value),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                )
            }),
        }
    }
}

fn present_values(key: &FieldKey, expense: &Expense) -> Vec<Scalar> {
    key.lookup(expense).flatten().unwrap_or_default()
}

fn scalar_in(key: &FieldKey, scalar: &Scalar, literal: &str) -> bool {
    if key.is_number() {
        scalar.equals(literal)
    } else {
        scalar.text() == literal || scalar.equals(literal)
    }
}

/// Boolean composition of predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Leaf(Predicate),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn matches(&self, expense: &Expense) -> bool {
        match self {
            Expr::Leaf(predicate) => predicate.matches(expense),
            Expr::And(left, right) => left.matches(expense) && right.matches(expense),
            Expr::Or(left, right) => left.matches(expense) || right.matches(expense),
        }
    }
}

/// Compiles one stored filter into a predicate.
pub fn build_predicate(filter: &ExpenseFilter) -> ResultEngine<Predicate> {
    let key = if filter.is_custom {
        FieldKey::Custom {
            key: filter.condition.clone(),
            field_type: filter.custom_field_type.ok_or_else(|| {
                EngineError::InvalidFilter(format!(
                    "custom filter on '{}' has no field type",
                    filter.condition
                ))
            })?,
        }
    } else {
        FieldKey::Expense(ExpenseField::try_from(filter.condition.as_str())?)
    };

    let first = || {
        filter.values.first().map(String::as_str).ok_or_else(|| {
            EngineError::InvalidFilter(format!("filter on '{}' has no values", filter.condition))
        })
    };

    Ok(match filter.operator {
        FilterOperator::In => key.in_values(&filter.values),
        FilterOperator::NotIn => key.not_in(&filter.values),
        FilterOperator::Iexact => key.iexact(first()?),
        FilterOperator::Icontains => key.icontains(first()?),
        FilterOperator::Lt => key.lt(first()?),
        FilterOperator::Lte => key.lte(first()?),
        FilterOperator::IsNull => key.is_null(parse_flag(first()?)?),
    })
}

fn parse_flag(value: &str) -> ResultEngine<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(EngineError::InvalidFilter(format!(
            "isnull expects True or False, got {other}"
        ))),
    }
}

/// Compiles ranked filters into one expression.
///
/// Filters are folded left by rank; each filter's `join_by` says how it joins
/// the next one (a missing join means AND). `None` when there are no filters.
pub fn build_filter_query(filters: &[ExpenseFilter]) -> ResultEngine<Option<Expr>> {
    let mut ordered: Vec<&ExpenseFilter> = filters.iter().collect();
    ordered.sort_by_key(|f| f.rank);

    let mut expr: Option<Expr> = None;
    let mut pending_join = JoinBy::And;
    for filter in ordered {
        let leaf = Expr::Leaf(build_predicate(filter)?);
        expr = Some(match expr {
            None => leaf,
            Some(left) => match pending_join {
                JoinBy::And => Expr::And(Box::new(left), Box::new(leaf)),
                JoinBy::Or => Expr::Or(Box::new(left), Box::new(leaf)),
            },
        });
        pending_join = filter.join_by.unwrap_or(JoinBy::And);
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::{
        Money,
        expenses::{CustomProperties, FundSource},
    };

    fn expense(properties: CustomProperties) -> Expense {
        let at = Utc.with_ymd_and_hms(2024, 5, 10, 9, 30, 0).unwrap();
        Expense {
            expense_id: "tx1".to_string(),
            account_id: "acc".to_string(),
            expense_number: Some("E/2024/05/T/1".to_string()),
            employee_email: "ada@example.test".to_string(),
            employee_name: None,
            category: Some("Meals".to_string()),
            sub_category: None,
            project: None,
            cost_center: None,
            merchant: Some("Cafe".to_string()),
            purpose: None,
            report_id: Some("rp1".to_string()),
            report_title: None,
            claim_number: Some("C/2024/05/R/1".to_string()),
            settlement_id: None,
            corporate_card_id: None,
            bank_transaction_id: None,
            amount: Money::new(2550),
            tax_amount: None,
            tax_group_id: None,
            currency: "USD".to_string(),
            foreign_amount: None,
            foreign_currency: None,
            fund_source: FundSource::Personal,
            state: "PAYMENT_PROCESSING".to_string(),
            billable: false,
            spent_at: Some(at),
            approved_at: None,
            posted_at: None,
            expense_created_at: at,
            expense_updated_at: at,
            custom_properties: properties,
            is_skipped: false,
            export_summary: None,
            previous_export_state: None,
            paid_on_ledger: false,
            paid_on_source: false,
            expense_group_id: None,
        }
    }

    fn filter(
        condition: &str,
        operator: FilterOperator,
        values: &[&str],
        rank: i32,
        join_by: Option<JoinBy>,
        custom: Option<CustomFieldType>,
    ) -> ExpenseFilter {
        let now = Utc::now();
        ExpenseFilter {
            id: Uuid::new_v4(),
            account_id: "acc".to_string(),
            condition: condition.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
            rank,
            join_by,
            is_custom: custom.is_some(),
            custom_field_type: custom,
            created_at: now,
            updated_at: now,
        }
    }

    fn custom(pairs: &[(&str, Option<CustomPropertyValue>)]) -> CustomProperties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn custom_isnull_true_matches_absent_or_null() {
        let predicate = build_predicate(&filter(
            "Team",
            FilterOperator::IsNull,
            &["True"],
            1,
            None,
            Some(CustomFieldType::Text),
        ))
        .unwrap();

        assert!(predicate.matches(&expense(custom(&[]))));
        assert!(predicate.matches(&expense(custom(&[("Team", None)]))));
        assert!(!predicate.matches(&expense(custom(&[(
            "Team",
            Some(CustomPropertyValue::Text("Ops".to_string()))
        )]))));
    }

    #[test]
    fn custom_isnull_false_matches_present_non_null() {
        let predicate = build_predicate(&filter(
            "Team",
            FilterOperator::IsNull,
            &["False"],
            1,
            None,
            Some(CustomFieldType::Text),
        ))
        .unwrap();

        assert!(!predicate.matches(&expense(custom(&[]))));
        assert!(!predicate.matches(&expense(custom(&[("Team", None)]))));
        assert!(predicate.matches(&expense(custom(&[(
            "Team",
            Some(CustomPropertyValue::Text("Ops".to_string()))
        )]))));
    }

    #[test]
    fn select_not_in_matches_absent_keys() {
        let predicate = build_predicate(&filter(
            "Region",
            FilterOperator::NotIn,
            &["EU"],
            1,
            None,
            Some(CustomFieldType::Select),
        ))
        .unwrap();

        assert!(predicate.matches(&expense(custom(&[]))));
        assert!(!predicate.matches(&expense(custom(&[(
            "Region",
            Some(CustomPropertyValue::Select(vec!["EU".to_string()]))
        )]))));
        assert!(predicate.matches(&expense(custom(&[(
            "Region",
            Some(CustomPropertyValue::Text("US".to_string()))
        )]))));
    }

    #[test]
    fn number_custom_values_compare_as_integers() {
        let predicate = build_predicate(&filter(
            "Trip",
            FilterOperator::In,
            &["42.0"],
            1,
            None,
            Some(CustomFieldType::Number),
        ))
        .unwrap();

        assert!(predicate.matches(&expense(custom(&[(
            "Trip",
            Some(CustomPropertyValue::Number(42.0))
        )]))));
        assert!(predicate.matches(&expense(custom(&[(
            "Trip",
            Some(CustomPropertyValue::Text("42".to_string()))
        )]))));
        assert!(!predicate.matches(&expense(custom(&[(
            "Trip",
            Some(CustomPropertyValue::Number(43.0))
        )]))));
    }

    #[test]
    fn in_uses_every_value() {
        let predicate = build_predicate(&filter(
            "employee_email",
            FilterOperator::In,
            &["bob@example.test", "ada@example.test"],
            1,
            None,
            None,
        ))
        .unwrap();
        assert!(predicate.matches(&expense(custom(&[]))));
    }

    #[test]
    fn standard_field_operators() {
        let e = expense(custom(&[]));
        let check = |condition: &str, operator, values: &[&str]| {
            build_predicate(&filter(condition, operator, values, 1, None, None))
                .unwrap()
                .matches(&e)
        };

        assert!(check("claim_number", FilterOperator::Iexact, &["c/2024/05/r/1"]));
        assert!(check("merchant", FilterOperator::Icontains, &["caf"]));
        assert!(check("spent_at", FilterOperator::Lt, &["2024-05-11"]));
        assert!(!check("spent_at", FilterOperator::Lt, &["2024-05-10"]));
        assert!(check("amount", FilterOperator::Lte, &["25.50"]));
        assert!(check("report_title", FilterOperator::IsNull, &["True"]));
        assert!(!check("category", FilterOperator::NotIn, &["Meals"]));
    }

    #[test]
    fn rank_one_join_combines_with_rank_two() {
        let e = expense(custom(&[]));
        let miss = filter("category", FilterOperator::In, &["Travel"], 2, None, None);

        let or = build_filter_query(&[
            miss.clone(),
            filter(
                "report_id",
                FilterOperator::In,
                &["rp1"],
                1,
                Some(JoinBy::Or),
                None,
            ),
        ])
        .unwrap()
        .unwrap();
        assert!(or.matches(&e));

        let and = build_filter_query(&[
            filter(
                "report_id",
                FilterOperator::In,
                &["rp1"],
                1,
                Some(JoinBy::And),
                None,
            ),
            miss,
        ])
        .unwrap()
        .unwrap();
        assert!(!and.matches(&e));
    }

    #[test]
    fn no_filters_compile_to_nothing() {
        assert_eq!(build_filter_query(&[]).unwrap(), None);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(matches!(
            build_predicate(&filter("color", FilterOperator::In, &["red"], 1, None, None)),
            Err(EngineError::InvalidFilter(_))
        ));
    }
}
