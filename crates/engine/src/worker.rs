//! Bounded pool executing export jobs.

use std::{collections::BTreeSet, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    Engine, EngineError, ExportJob,
    ports::Collaborators,
    task_logs::TaskStatus,
};

/// Result of one export job.
#[derive(Debug)]
pub struct JobReport {
    pub task_log_id: Uuid,
    pub expense_group_id: String,
    pub result: Result<TaskStatus, EngineError>,
}

/// Runs `jobs` with at most `worker_concurrency` exports in flight.
///
/// Every job runs to completion even when others fail. Once the pool drains,
/// the last export detail of each touched account is recomputed.
pub async fn run_jobs(
    engine: Engine,
    jobs: Vec<ExportJob>,
    collaborators: Collaborators,
) -> Vec<JobReport> {
    let concurrency = engine.settings().worker_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let accounts: BTreeSet<String> = jobs.iter().map(|job| job.account_id.clone()).collect();
    let mut tasks = JoinSet::new();

    for job in jobs {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                error!(error = %err, "worker pool closed");
                break;
            }
        };
        let engine = engine.clone();
        let collaborators = collaborators.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let result = engine.run_export(&job, &collaborators).await;
            if let Err(err) = &result {
                error!(
                    task_log_id = %job.task_log_id,
                    expense_group_id = %job.expense_group_id,
                    error = %err,
                    "export job failed"
                );
            }
            JobReport {
                task_log_id: job.task_log_id,
                expense_group_id: job.expense_group_id,
                result,
            }
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(err) => error!(error = %err, "export job panicked"),
        }
    }

    for account_id in &accounts {
        if let Err(err) = engine.recompute_last_export_detail(account_id).await {
            warn!(account_id, error = %err, "last export detail not recomputed");
        }
    }
    info!(jobs = reports.len(), concurrency, "export jobs finished");
    reports
}
