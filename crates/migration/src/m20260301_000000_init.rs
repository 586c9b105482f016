//! Initial schema.
//!
//! - `account_configs`: per-account export and grouping settings
//! - `expenses`: normalized expenses pulled from the source platform
//! - `expense_groups`: expenses bundled into one ledger transaction
//! - `expense_filters`: skip rules evaluated at ingestion
//! - `task_logs`: one export state machine per group
//! - `export_errors`: deduplicated mapping and ledger errors
//! - `ledger_transactions`: transactions created on the ledger
//! - `last_export_details`: per-account export counters

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ─────────────────────────────────────────────────────────────────────────────
// Table identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Iden)]
enum AccountConfigs {
    Table,
    AccountId,
    ReimbursableExportType,
    CccExportType,
    ReimbursableGrouping,
    CccGrouping,
    SplitCccByBankTransaction,
    EmployeeFieldMapping,
    TaxOverrideEnabled,
    AutoCorrectAccountingPeriod,
    SyncLedgerPaymentsToSource,
    SyncSourcePaymentsToLedger,
    DefaultCccAccountId,
    DefaultCccVendorId,
    ReimbursableExpenseStates,
    CccExpenseStates,
    UpdatedAt,
}

#[derive(Iden)]
enum ExpenseGroups {
    Table,
    Id,
    AccountId,
    FundSource,
    Description,
    ExportedAt,
    Response,
    ExportUrl,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Expenses {
    Table,
    ExpenseId,
    AccountId,
    ExpenseNumber,
    EmployeeEmail,
    EmployeeName,
    Category,
    SubCategory,
    Project,
    CostCenter,
    Merchant,
    Purpose,
    ReportId,
    ReportTitle,
    ClaimNumber,
    SettlementId,
    CorporateCardId,
    BankTransactionId,
    AmountMinor,
    TaxAmountMinor,
    TaxGroupId,
    Currency,
    ForeignAmountMinor,
    ForeignCurrency,
    FundSource,
    State,
    Billable,
    SpentAt,
    ApprovedAt,
    PostedAt,
    ExpenseCreatedAt,
    ExpenseUpdatedAt,
    CustomProperties,
    IsSkipped,
    ExportSummary,
    PreviousExportState,
    PaidOnLedger,
    PaidOnSource,
    ExpenseGroupId,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ExpenseFilters {
    Table,
    Id,
    AccountId,
    Condition,
    Operator,
    Values,
    Rank,
    JoinBy,
    IsCustom,
    CustomFieldType,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum TaskLogs {
    Table,
    Id,
    AccountId,
    ExpenseGroupId,
    TaskType,
    Status,
    Detail,
    LedgerTransactionId,
    TriggeredBy,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ExportErrors {
    Table,
    Id,
    AccountId,
    Kind,
    SourceType,
    SourceValue,
    ExpenseGroupId,
    AffectedGroupIds,
    RepetitionCount,
    IsResolved,
    Title,
    Detail,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum LedgerTransactions {
    Table,
    Id,
    AccountId,
    ExpenseGroupId,
    Kind,
    ExternalId,
    EntityId,
    AmountMinor,
    Currency,
    TransactionDate,
    PaidOnLedger,
    PaidOnSource,
    PaymentSynced,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum LastExportDetails {
    Table,
    AccountId,
    LastExportedAt,
    NextExportAt,
    ExportMode,
    FailedExpenseGroupsCount,
    SuccessfulExpenseGroupsCount,
    TotalExpenseGroupsCount,
    UpdatedAt,
}

fn flag<T: IntoIden>(column: T) -> ColumnDef {
    ColumnDef::new(column)
        .boolean()
        .not_null()
        .default(false)
        .to_owned()
}

fn stamp<T: IntoIden>(column: T) -> ColumnDef {
    ColumnDef::new(column).timestamp().not_null().to_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ───────────────────────────────────────────────────────────────────
        // 1. Account configs
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(AccountConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccountConfigs::AccountId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AccountConfigs::ReimbursableExportType).string())
                    .col(ColumnDef::new(AccountConfigs::CccExportType).string())
                    .col(
                        ColumnDef::new(AccountConfigs::ReimbursableGrouping)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AccountConfigs::CccGrouping).text().not_null())
                    .col(flag(AccountConfigs::SplitCccByBankTransaction))
                    .col(
                        ColumnDef::new(AccountConfigs::EmployeeFieldMapping)
                            .string()
                            .not_null(),
                    )
                    .col(flag(AccountConfigs::TaxOverrideEnabled))
                    .col(flag(AccountConfigs::AutoCorrectAccountingPeriod))
                    .col(flag(AccountConfigs::SyncLedgerPaymentsToSource))
                    .col(flag(AccountConfigs::SyncSourcePaymentsToLedger))
                    .col(ColumnDef::new(AccountConfigs::DefaultCccAccountId).string())
                    .col(ColumnDef::new(AccountConfigs::DefaultCccVendorId).string())
                    .col(
                        ColumnDef::new(AccountConfigs::ReimbursableExpenseStates)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AccountConfigs::CccExpenseStates)
                            .text()
                            .not_null(),
                    )
                    .col(stamp(AccountConfigs::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 2. Expense groups
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(ExpenseGroups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExpenseGroups::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExpenseGroups::AccountId).string().not_null())
                    .col(ColumnDef::new(ExpenseGroups::FundSource).string().not_null())
                    .col(ColumnDef::new(ExpenseGroups::Description).text().not_null())
                    .col(ColumnDef::new(ExpenseGroups::ExportedAt).timestamp())
                    .col(ColumnDef::new(ExpenseGroups::Response).text())
                    .col(ColumnDef::new(ExpenseGroups::ExportUrl).string())
                    .col(stamp(ExpenseGroups::CreatedAt))
                    .col(stamp(ExpenseGroups::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-expense_groups-account_id-exported_at")
                    .table(ExpenseGroups::Table)
                    .col(ExpenseGroups::AccountId)
                    .col(ExpenseGroups::ExportedAt)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 3. Expenses
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Expenses::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Expenses::ExpenseId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Expenses::AccountId).string().not_null())
                    .col(ColumnDef::new(Expenses::ExpenseNumber).string())
                    .col(ColumnDef::new(Expenses::EmployeeEmail).string().not_null())
                    .col(ColumnDef::new(Expenses::EmployeeName).string())
                    .col(ColumnDef::new(Expenses::Category).string())
                    .col(ColumnDef::new(Expenses::SubCategory).string())
                    .col(ColumnDef::new(Expenses::Project).string())
                    .col(ColumnDef::new(Expenses::CostCenter).string())
                    .col(ColumnDef::new(Expenses::Merchant).string())
                    .col(ColumnDef::new(Expenses::Purpose).text())
                    .col(ColumnDef::new(Expenses::ReportId).string())
                    .col(ColumnDef::new(Expenses::ReportTitle).string())
                    .col(ColumnDef::new(Expenses::ClaimNumber).string())
                    .col(ColumnDef::new(Expenses::SettlementId).string())
                    .col(ColumnDef::new(Expenses::CorporateCardId).string())
                    .col(ColumnDef::new(Expenses::BankTransactionId).string())
                    .col(
                        ColumnDef::new(Expenses::AmountMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Expenses::TaxAmountMinor).big_integer())
                    .col(ColumnDef::new(Expenses::TaxGroupId).string())
                    .col(ColumnDef::new(Expenses::Currency).string().not_null())
                    .col(ColumnDef::new(Expenses::ForeignAmountMinor).big_integer())
                    .col(ColumnDef::new(Expenses::ForeignCurrency).string())
                    .col(ColumnDef::new(Expenses::FundSource).string().not_null())
                    .col(ColumnDef::new(Expenses::State).string().not_null())
                    .col(flag(Expenses::Billable))
                    .col(ColumnDef::new(Expenses::SpentAt).timestamp())
                    .col(ColumnDef::new(Expenses::ApprovedAt).timestamp())
                    .col(ColumnDef::new(Expenses::PostedAt).timestamp())
                    .col(stamp(Expenses::ExpenseCreatedAt))
                    .col(stamp(Expenses::ExpenseUpdatedAt))
                    .col(
                        ColumnDef::new(Expenses::CustomProperties)
                            .text()
                            .not_null(),
                    )
                    .col(flag(Expenses::IsSkipped))
                    .col(ColumnDef::new(Expenses::ExportSummary).text())
                    .col(ColumnDef::new(Expenses::PreviousExportState).string())
                    .col(flag(Expenses::PaidOnLedger))
                    .col(flag(Expenses::PaidOnSource))
                    .col(ColumnDef::new(Expenses::ExpenseGroupId).string())
                    .col(stamp(Expenses::CreatedAt))
                    .col(stamp(Expenses::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-expenses-expense_group_id")
                            .from(Expenses::Table, Expenses::ExpenseGroupId)
                            .to(ExpenseGroups::Table, ExpenseGroups::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-expenses-account_id-fund_source")
                    .table(Expenses::Table)
                    .col(Expenses::AccountId)
                    .col(Expenses::FundSource)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-expenses-expense_group_id")
                    .table(Expenses::Table)
                    .col(Expenses::ExpenseGroupId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-expenses-report_id")
                    .table(Expenses::Table)
                    .col(Expenses::ReportId)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 4. Expense filters
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(ExpenseFilters::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExpenseFilters::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExpenseFilters::AccountId).string().not_null())
                    .col(ColumnDef::new(ExpenseFilters::Condition).string().not_null())
                    .col(ColumnDef::new(ExpenseFilters::Operator).string().not_null())
                    .col(ColumnDef::new(ExpenseFilters::Values).text().not_null())
                    .col(ColumnDef::new(ExpenseFilters::Rank).integer().not_null())
                    .col(ColumnDef::new(ExpenseFilters::JoinBy).string())
                    .col(flag(ExpenseFilters::IsCustom))
                    .col(ColumnDef::new(ExpenseFilters::CustomFieldType).string())
                    .col(stamp(ExpenseFilters::CreatedAt))
                    .col(stamp(ExpenseFilters::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-expense_filters-account_id-rank-unique")
                    .table(ExpenseFilters::Table)
                    .col(ExpenseFilters::AccountId)
                    .col(ExpenseFilters::Rank)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 5. Task logs
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(TaskLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TaskLogs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TaskLogs::AccountId).string().not_null())
                    .col(ColumnDef::new(TaskLogs::ExpenseGroupId).string())
                    .col(ColumnDef::new(TaskLogs::TaskType).string().not_null())
                    .col(ColumnDef::new(TaskLogs::Status).string().not_null())
                    .col(ColumnDef::new(TaskLogs::Detail).text())
                    .col(ColumnDef::new(TaskLogs::LedgerTransactionId).string())
                    .col(ColumnDef::new(TaskLogs::TriggeredBy).string())
                    .col(stamp(TaskLogs::CreatedAt))
                    .col(stamp(TaskLogs::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-task_logs-expense_group_id")
                            .from(TaskLogs::Table, TaskLogs::ExpenseGroupId)
                            .to(ExpenseGroups::Table, ExpenseGroups::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-task_logs-expense_group_id-unique")
                    .table(TaskLogs::Table)
                    .col(TaskLogs::ExpenseGroupId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-task_logs-account_id-status")
                    .table(TaskLogs::Table)
                    .col(TaskLogs::AccountId)
                    .col(TaskLogs::Status)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 6. Export errors
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(ExportErrors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExportErrors::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExportErrors::AccountId).string().not_null())
                    .col(ColumnDef::new(ExportErrors::Kind).string().not_null())
                    .col(ColumnDef::new(ExportErrors::SourceType).string())
                    .col(ColumnDef::new(ExportErrors::SourceValue).string())
                    .col(ColumnDef::new(ExportErrors::ExpenseGroupId).string())
                    .col(
                        ColumnDef::new(ExportErrors::AffectedGroupIds)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExportErrors::RepetitionCount)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(flag(ExportErrors::IsResolved))
                    .col(ColumnDef::new(ExportErrors::Title).string().not_null())
                    .col(ColumnDef::new(ExportErrors::Detail).text())
                    .col(stamp(ExportErrors::CreatedAt))
                    .col(stamp(ExportErrors::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-export_errors-account_id-kind")
                    .table(ExportErrors::Table)
                    .col(ExportErrors::AccountId)
                    .col(ExportErrors::Kind)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 7. Ledger transactions
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(LedgerTransactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LedgerTransactions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LedgerTransactions::AccountId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LedgerTransactions::ExpenseGroupId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(LedgerTransactions::Kind).string().not_null())
                    .col(
                        ColumnDef::new(LedgerTransactions::ExternalId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LedgerTransactions::EntityId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LedgerTransactions::AmountMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LedgerTransactions::Currency)
                            .string()
                            .not_null(),
                    )
                    .col(stamp(LedgerTransactions::TransactionDate))
                    .col(flag(LedgerTransactions::PaidOnLedger))
                    .col(flag(LedgerTransactions::PaidOnSource))
                    .col(flag(LedgerTransactions::PaymentSynced))
                    .col(stamp(LedgerTransactions::CreatedAt))
                    .col(stamp(LedgerTransactions::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-ledger_transactions-expense_group_id")
                            .from(LedgerTransactions::Table, LedgerTransactions::ExpenseGroupId)
                            .to(ExpenseGroups::Table, ExpenseGroups::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 8. Last export details
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(LastExportDetails::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LastExportDetails::AccountId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LastExportDetails::LastExportedAt).timestamp())
                    .col(ColumnDef::new(LastExportDetails::NextExportAt).timestamp())
                    .col(ColumnDef::new(LastExportDetails::ExportMode).string())
                    .col(
                        ColumnDef::new(LastExportDetails::FailedExpenseGroupsCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LastExportDetails::SuccessfulExpenseGroupsCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LastExportDetails::TotalExpenseGroupsCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(stamp(LastExportDetails::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LastExportDetails::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LedgerTransactions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ExportErrors::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TaskLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ExpenseFilters::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Expenses::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ExpenseGroups::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AccountConfigs::Table).to_owned())
            .await?;
        Ok(())
    }
}
