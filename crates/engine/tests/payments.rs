mod support;

use chrono::{Duration, Utc};
use serde_json::json;

use engine::{
    AccountConfig, ScheduleRequest, TaskStatus, TriggerSource,
    ports::{LedgerError, MarkPaidFailureReason},
    task_logs::TaskType,
};

use support::{ACCOUNT, Harness, harness, harness_with, ingest_and_group, raw};

fn payment_config(to_source: bool, to_ledger: bool) -> AccountConfig {
    let mut config = AccountConfig::new(ACCOUNT);
    config.sync_ledger_payments_to_source = to_source;
    config.sync_source_payments_to_ledger = to_ledger;
    config
}

/// Exports one bill per report and returns the group ids in report order.
async fn export_reports(h: &Harness) -> Vec<String> {
    h.map_defaults();
    ingest_and_group(
        h,
        vec![
            raw("tx1", "rp1", 10.0),
            raw("tx2", "rp1", 2.0),
            raw("tx3", "rp2", 3.0),
        ],
    )
    .await;
    let scheduled = h
        .engine
        .schedule_exports(
            &ScheduleRequest::new(ACCOUNT, TriggerSource::Manual),
            h.source.as_ref(),
        )
        .await
        .unwrap();
    for job in &scheduled.jobs {
        let status = h.engine.run_export(job, &h.collaborators()).await.unwrap();
        assert_eq!(status, TaskStatus::Complete);
    }

    let mut groups = h.engine.expense_groups(ACCOUNT).await.unwrap();
    groups.sort_by(|a, b| a.description["report_id"].cmp(&b.description["report_id"]));
    groups.into_iter().map(|g| g.id).collect()
}

async fn external_id(h: &Harness, group_id: &str) -> String {
    let group = h.engine.expense_group(ACCOUNT, group_id).await.unwrap();
    group.response.unwrap()["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn paid_bills_mark_their_reports_paid() {
    let h = harness_with(payment_config(true, false)).await;
    let groups = export_reports(&h).await;
    h.ledger.mark_paid(&external_id(&h, &groups[0]).await);

    let outcome = h
        .engine
        .sync_ledger_payments_to_source(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(outcome.newly_paid, 1);
    assert_eq!(outcome.reports_marked, 1);
    assert_eq!(outcome.reports_rejected, 0);
    assert_eq!(
        *h.source.mark_paid_calls.lock().unwrap(),
        vec![vec!["rp1".to_string()]]
    );

    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx1".to_string(), "tx3".to_string()])
        .await
        .unwrap();
    let tx1 = stored.iter().find(|e| e.expense_id == "tx1").unwrap();
    let tx3 = stored.iter().find(|e| e.expense_id == "tx3").unwrap();
    assert!(tx1.paid_on_ledger && tx1.paid_on_source);
    assert!(!tx3.paid_on_ledger && !tx3.paid_on_source);

    // Nothing new on a second run.
    let again = h
        .engine
        .sync_ledger_payments_to_source(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(again.newly_paid, 0);
    assert_eq!(again.reports_marked, 0);
    assert_eq!(h.source.mark_paid_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn refused_reports_are_dropped_and_the_rest_retried() {
    let h = harness_with(payment_config(true, false)).await;
    let groups = export_reports(&h).await;
    for group_id in &groups {
        h.ledger.mark_paid(&external_id(&h, group_id).await);
    }
    h.source
        .refused_reports
        .lock()
        .unwrap()
        .insert("rp2".to_string(), MarkPaidFailureReason::PermissionDenied);

    let outcome = h
        .engine
        .sync_ledger_payments_to_source(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(outcome.newly_paid, 2);
    assert_eq!(outcome.reports_marked, 1);
    assert_eq!(outcome.reports_rejected, 1);
    assert_eq!(
        *h.source.mark_paid_calls.lock().unwrap(),
        vec![
            vec!["rp1".to_string(), "rp2".to_string()],
            vec!["rp1".to_string()],
        ]
    );

    // Refused reports are settled locally so they are not retried forever.
    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx3".to_string()])
        .await
        .unwrap();
    assert!(stored[0].paid_on_source);
}

#[tokio::test]
async fn reports_refused_for_other_reasons_stay_unpaid() {
    let h = harness_with(payment_config(true, false)).await;
    let groups = export_reports(&h).await;
    for group_id in &groups {
        h.ledger.mark_paid(&external_id(&h, group_id).await);
    }
    h.source
        .refused_reports
        .lock()
        .unwrap()
        .insert("rp2".to_string(), MarkPaidFailureReason::Other);

    let outcome = h
        .engine
        .sync_ledger_payments_to_source(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(outcome.reports_marked, 1);
    assert_eq!(outcome.reports_rejected, 0);
    assert_eq!(outcome.reports_pending, 1);
    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx3".to_string()])
        .await
        .unwrap();
    assert!(stored[0].paid_on_ledger);
    assert!(!stored[0].paid_on_source);

    h.source.refused_reports.lock().unwrap().clear();
    let again = h
        .engine
        .sync_ledger_payments_to_source(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(again.newly_paid, 0);
    assert_eq!(again.reports_marked, 1);
    assert_eq!(
        h.source.mark_paid_calls.lock().unwrap().last().unwrap(),
        &vec!["rp2".to_string()]
    );
    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx3".to_string()])
        .await
        .unwrap();
    assert!(stored[0].paid_on_source);
}

#[tokio::test]
async fn disabled_payment_sync_does_nothing() {
    let h = harness().await;
    let groups = export_reports(&h).await;
    h.ledger.mark_paid(&external_id(&h, &groups[0]).await);
    h.source.set_report_state("rp1", "PAID");

    let to_source = h
        .engine
        .sync_ledger_payments_to_source(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    let to_ledger = h
        .engine
        .sync_source_payments_to_ledger(ACCOUNT, &h.collaborators())
        .await
        .unwrap();

    assert_eq!(to_source, Default::default());
    assert_eq!(to_ledger, Default::default());
    assert!(h.source.mark_paid_calls.lock().unwrap().is_empty());
    assert!(h.ledger.payments.lock().unwrap().is_empty());
}

#[tokio::test]
async fn paid_reports_are_settled_with_one_payment_per_vendor() {
    let h = harness_with(payment_config(false, true)).await;
    let groups = export_reports(&h).await;
    h.source.set_report_state("rp1", "PAID");
    h.source.set_report_state("rp2", "PAID");

    let outcome = h
        .engine
        .sync_source_payments_to_ledger(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(outcome.payments_posted, 1);
    assert_eq!(outcome.documents_paid, 2);

    {
        let payments = h.ledger.payments.lock().unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].entity_id, "V-ALICE");
        assert_eq!(payments[0].amount.cents(), 1500);
        assert_eq!(payments[0].documents.len(), 2);
    }

    let log = h
        .engine
        .payment_task_log(&groups[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.task_type, TaskType::CreatingVendorPayment);
    assert_eq!(log.status, TaskStatus::Complete);
    assert_eq!(log.expense_group_id, None);
    assert!(!log.is_retired);

    let again = h
        .engine
        .sync_source_payments_to_ledger(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(again.payments_posted, 0);
    assert_eq!(h.ledger.payments.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unpaid_reports_are_deferred() {
    let h = harness_with(payment_config(false, true)).await;
    let groups = export_reports(&h).await;
    h.source.set_report_state("rp1", "PAID");
    h.source.set_report_state("rp2", "APPROVED");

    let outcome = h
        .engine
        .sync_source_payments_to_ledger(ACCOUNT, &h.collaborators())
        .await
        .unwrap();
    assert_eq!(outcome.documents_paid, 1);
    assert_eq!(outcome.deferred, 1);
    assert!(h.engine.payment_task_log(&groups[1]).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_payments_back_off_then_retry() {
    let h = harness_with(payment_config(false, true)).await;
    let groups = export_reports(&h).await;
    h.source.set_report_state("rp1", "PAID");
    h.source.set_report_state("rp2", "PAID");
    h.ledger.fail_next_payment(LedgerError::Rejected {
        message: "Payment account missing".to_string(),
        detail: json!({ "field": "account" }),
    });
    let start = Utc::now();

    let failed = h
        .engine
        .sync_source_payments_to_ledger_at(ACCOUNT, &h.collaborators(), start)
        .await
        .unwrap();
    assert_eq!(failed.payments_posted, 0);
    let log = h
        .engine
        .payment_task_log(&groups[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status, TaskStatus::Failed);

    let waiting = h
        .engine
        .sync_source_payments_to_ledger_at(
            ACCOUNT,
            &h.collaborators(),
            start + Duration::days(3),
        )
        .await
        .unwrap();
    assert_eq!(waiting.deferred, 2);
    assert!(h.ledger.payments.lock().unwrap().is_empty());

    let retried = h
        .engine
        .sync_source_payments_to_ledger_at(
            ACCOUNT,
            &h.collaborators(),
            start + Duration::days(8),
        )
        .await
        .unwrap();
    assert_eq!(retried.payments_posted, 1);
    assert_eq!(retried.documents_paid, 2);
    let log = h
        .engine
        .payment_task_log(&groups[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status, TaskStatus::Complete);
}

#[tokio::test]
async fn stale_payment_attempts_are_retired() {
    let h = harness_with(payment_config(false, true)).await;
    let groups = export_reports(&h).await;
    h.source.set_report_state("rp1", "PAID");
    h.source.set_report_state("rp2", "PAID");
    h.ledger
        .fail_next_payment(LedgerError::Unexpected("socket closed".to_string()));
    let start = Utc::now();

    h.engine
        .sync_source_payments_to_ledger_at(ACCOUNT, &h.collaborators(), start)
        .await
        .unwrap();
    let log = h
        .engine
        .payment_task_log(&groups[1])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status, TaskStatus::Fatal);

    let outcome = h
        .engine
        .sync_source_payments_to_ledger_at(
            ACCOUNT,
            &h.collaborators(),
            start + Duration::days(61),
        )
        .await
        .unwrap();
    assert_eq!(outcome.retired, 2);
    assert_eq!(outcome.payments_posted, 0);
    assert!(
        h.engine
            .payment_task_log(&groups[1])
            .await
            .unwrap()
            .unwrap()
            .is_retired
    );

    let later = h
        .engine
        .sync_source_payments_to_ledger_at(
            ACCOUNT,
            &h.collaborators(),
            start + Duration::days(62),
        )
        .await
        .unwrap();
    assert_eq!(later, Default::default());
    assert!(h.ledger.payments.lock().unwrap().is_empty());
}
