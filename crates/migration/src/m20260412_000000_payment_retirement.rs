use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(Iden)]
enum TaskLogs {
    Table,
    PaymentKey,
    IsRetired,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // SQLite accepts a single column per ALTER statement.
        manager
            .alter_table(
                Table::alter()
                    .table(TaskLogs::Table)
                    .add_column(ColumnDef::new(TaskLogs::PaymentKey).string())
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(TaskLogs::Table)
                    .add_column(
                        ColumnDef::new(TaskLogs::IsRetired)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uidx-task_logs-payment_key")
                    .table(TaskLogs::Table)
                    .col(TaskLogs::PaymentKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("uidx-task_logs-payment_key")
                    .table(TaskLogs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(TaskLogs::Table)
                    .drop_column(TaskLogs::IsRetired)
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(TaskLogs::Table)
                    .drop_column(TaskLogs::PaymentKey)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}
