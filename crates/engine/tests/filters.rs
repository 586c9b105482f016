mod support;

use sea_orm::ConnectionTrait;

use engine::{
    EngineError, NewExpenseFilter, ScheduleRequest, SyncCursor, TaskStatus, TriggerSource,
    expense_filters::{FilterOperator, JoinBy},
    expenses::ExportState,
};

use support::{ACCOUNT, Harness, harness, ingest_and_group, raw};

/// Groups alice's and two of bob's reports, then fails every export on the
/// missing mappings.
async fn fail_three_groups(h: &Harness) {
    ingest_and_group(
        h,
        vec![
            raw("tx1", "rp1", 10.0),
            bob("tx2", "rp2", 20.0),
            bob("tx3", "rp3", 5.0),
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
    assert_eq!(scheduled.jobs.len(), 3);
    for job in &scheduled.jobs {
        let status = h.engine.run_export(job, &h.collaborators()).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }
    let detail = h.engine.recompute_last_export_detail(ACCOUNT).await.unwrap();
    assert_eq!(detail.failed_expense_groups_count, 3);
    assert_eq!(detail.total_expense_groups_count, 3);
}

fn employee_filter(email: &str, rank: i32, join_by: Option<JoinBy>) -> NewExpenseFilter {
    NewExpenseFilter {
        condition: "employee_email".to_string(),
        operator: FilterOperator::In,
        values: vec![email.to_string()],
        rank,
        join_by,
        is_custom: false,
        custom_field_type: None,
    }
}

fn bob(id: &str, report: &str, amount: f64) -> engine::RawExpense {
    let mut record = raw(id, report, amount);
    record.employee_email = "bob@example.test".to_string();
    record
}

#[tokio::test]
async fn import_skips_matching_expenses() {
    let h = harness().await;
    h.engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 1, None))
        .await
        .unwrap();
    h.source
        .serve(vec![raw("tx1", "rp1", 10.0), bob("tx2", "rp2", 20.0)]);

    let outcome = h
        .engine
        .import_expenses(ACCOUNT, SyncCursor::default(), h.source.as_ref())
        .await
        .unwrap();

    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.skipped_expense_ids, vec!["tx2".to_string()]);
    assert_eq!(
        h.source.pushed_state("tx2").map(|s| s.state),
        Some(ExportState::Skipped)
    );
}

#[tokio::test]
async fn saving_the_last_filter_pulls_expenses_out_of_unexported_groups() {
    let h = harness().await;
    let groups = ingest_and_group(
        &h,
        vec![
            raw("tx1", "rp1", 10.0),
            bob("tx2", "rp2", 20.0),
            bob("tx3", "rp2", 5.0),
            raw("tx4", "rp3", 1.0),
        ],
    )
    .await;
    assert_eq!(groups.len(), 3);

    let update = h
        .engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 1, None))
        .await
        .unwrap();

    assert_eq!(
        update.skipped_expense_ids,
        vec!["tx2".to_string(), "tx3".to_string()]
    );
    // The emptied group is gone, the others are untouched.
    assert_eq!(h.engine.expense_groups(ACCOUNT).await.unwrap().len(), 2);

    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx2".to_string(), "tx3".to_string()])
        .await
        .unwrap();
    assert!(stored.iter().all(|e| e.is_skipped && e.expense_group_id.is_none()));
}

#[tokio::test]
async fn dissolved_failed_groups_leave_the_export_counters() {
    let h = harness().await;
    fail_three_groups(&h).await;

    h.engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 1, None))
        .await
        .unwrap();

    let detail = h.engine.last_export_detail(ACCOUNT).await.unwrap().unwrap();
    assert_eq!(detail.failed_expense_groups_count, 1);
    assert_eq!(detail.total_expense_groups_count, 1);
    assert_eq!(h.engine.expense_groups(ACCOUNT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn export_counters_never_go_negative() {
    let h = harness().await;
    fail_three_groups(&h).await;
    h.db
        .execute_unprepared(
            "UPDATE last_export_details \
             SET failed_expense_groups_count = 1, total_expense_groups_count = 1",
        )
        .await
        .unwrap();

    h.engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 1, None))
        .await
        .unwrap();

    let detail = h.engine.last_export_detail(ACCOUNT).await.unwrap().unwrap();
    assert_eq!(detail.failed_expense_groups_count, 0);
    assert_eq!(detail.total_expense_groups_count, 0);
}

#[tokio::test]
async fn chained_filter_waits_for_the_last_link() {
    let h = harness().await;
    ingest_and_group(&h, vec![bob("tx1", "rp1", 10.0)]).await;

    let first = h
        .engine
        .upsert_expense_filter(
            ACCOUNT,
            employee_filter("bob@example.test", 1, Some(JoinBy::And)),
        )
        .await
        .unwrap();
    assert!(first.skipped_expense_ids.is_empty());

    let second = h
        .engine
        .upsert_expense_filter(
            ACCOUNT,
            NewExpenseFilter {
                condition: "report_id".to_string(),
                operator: FilterOperator::Iexact,
                values: vec!["RP1".to_string()],
                rank: 2,
                join_by: None,
                is_custom: false,
                custom_field_type: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(second.skipped_expense_ids, vec!["tx1".to_string()]);

    let filters = h.engine.expense_filters(ACCOUNT).await.unwrap();
    assert_eq!(filters.iter().map(|f| f.rank).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn same_rank_replaces_the_filter() {
    let h = harness().await;
    let created = h
        .engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 1, None))
        .await
        .unwrap();
    let replaced = h
        .engine
        .upsert_expense_filter(ACCOUNT, employee_filter("carol@example.test", 1, None))
        .await
        .unwrap();

    assert_eq!(created.filter.id, replaced.filter.id);
    let filters = h.engine.expense_filters(ACCOUNT).await.unwrap();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].values, vec!["carol@example.test".to_string()]);

    assert_eq!(h.engine.delete_expense_filters(ACCOUNT).await.unwrap(), 1);
    assert!(h.engine.expense_filters(ACCOUNT).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_filters_are_rejected() {
    let h = harness().await;

    let err = h
        .engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 3, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidFilter(_)));

    let mut empty = employee_filter("bob@example.test", 1, None);
    empty.values.clear();
    let err = h
        .engine
        .upsert_expense_filter(ACCOUNT, empty)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidFilter(_)));
    assert!(h.engine.expense_filters(ACCOUNT).await.unwrap().is_empty());
}

#[tokio::test]
async fn exported_groups_are_frozen() {
    let h = harness().await;
    h.map_defaults();
    ingest_and_group(&h, vec![bob("tx1", "rp1", 10.0)]).await;

    let scheduled = h
        .engine
        .schedule_exports(
            &ScheduleRequest::new(ACCOUNT, TriggerSource::Direct),
            h.source.as_ref(),
        )
        .await
        .unwrap();
    let status = h
        .engine
        .run_export(&scheduled.jobs[0], &h.collaborators())
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Complete);

    let update = h
        .engine
        .upsert_expense_filter(ACCOUNT, employee_filter("bob@example.test", 1, None))
        .await
        .unwrap();
    assert!(update.skipped_expense_ids.is_empty());

    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx1".to_string()])
        .await
        .unwrap();
    assert!(!stored[0].is_skipped);
    assert!(stored[0].expense_group_id.is_some());
}
