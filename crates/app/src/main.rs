use clap::Parser;
use engine::{Engine, export_errors::MappingSourceType};
use migration::{Migrator, MigratorTrait};
use settings::{Args, Command, Settings};

mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let settings = Settings::load(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "ledgerbridge={level},engine={level},migration={level}",
            level = settings.app.level
        ))
        .init();

    let database = connect(&settings.database_url(&args)).await?;
    let engine = Engine::builder()
        .database(database)
        .settings(settings.engine.clone())
        .build()
        .await?;

    match args.command.unwrap_or(Command::Migrate) {
        Command::Migrate => tracing::info!("schema up to date"),
        Command::RecomputeSummary { account } => {
            let detail = engine.recompute_last_export_detail(&account).await?;
            tracing::info!(
                account_id = %detail.account_id,
                failed = detail.failed_expense_groups_count,
                successful = detail.successful_expense_groups_count,
                total = detail.total_expense_groups_count,
                "last export detail recomputed"
            );
        }
        Command::ResolveMapping {
            account,
            source_type,
            value,
        } => {
            let source_type = MappingSourceType::try_from(source_type.as_str())?;
            let unblocked = engine
                .resolve_mapping_errors(&account, source_type, &value)
                .await?;
            for expense_group_id in unblocked {
                println!("{expense_group_id}");
            }
        }
        Command::Errors { account } => {
            for error in engine.export_errors(&account, false).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    error.kind,
                    error.repetition_count,
                    error.title,
                    error.affected_group_ids.join(",")
                );
            }
        }
    }

    Ok(())
}

async fn connect(
    url: &str,
) -> Result<sea_orm::DatabaseConnection, Box<dyn std::error::Error + Send + Sync>> {
    tracing::debug!(url, "connecting to database");
    let database = sea_orm::Database::connect(url).await?;
    Migrator::up(&database, None).await?;
    Ok(database)
}
