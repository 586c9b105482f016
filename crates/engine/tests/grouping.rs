mod support;

use engine::{AccountConfig, TransactionKind, expenses::FundSource};

use support::{ACCOUNT, card, harness, harness_with, ingest_and_group, raw};

fn card_config() -> AccountConfig {
    let mut config = AccountConfig::new(ACCOUNT);
    config.ccc_export_type = Some(TransactionKind::CreditCardCharge);
    config.default_ccc_account_id = Some("CARD-ACC".to_string());
    config
}

#[tokio::test]
async fn expenses_of_one_report_share_a_group() {
    let h = harness().await;
    let groups = ingest_and_group(
        &h,
        vec![
            raw("tx1", "rp1", 10.0),
            raw("tx2", "rp1", 15.0),
            raw("tx3", "rp2", 7.5),
        ],
    )
    .await;
    assert_eq!(groups.len(), 2);

    let mut sizes = Vec::new();
    for group_id in &groups {
        let group = h.engine.expense_group(ACCOUNT, group_id).await.unwrap();
        assert_eq!(group.fund_source, FundSource::Personal);
        assert_eq!(
            group.description.get("employee_email").map(String::as_str),
            Some("alice@example.test")
        );
        let members = h
            .engine
            .expenses_for_group(ACCOUNT, group_id)
            .await
            .unwrap();
        assert!(members.iter().all(|e| e.expense_group_id.as_deref() == Some(group_id.as_str())));
        sizes.push((group.description["report_id"].clone(), members.len()));
    }
    sizes.sort();
    assert_eq!(sizes, vec![("rp1".to_string(), 2), ("rp2".to_string(), 1)]);
}

#[tokio::test]
async fn fund_sources_are_never_mixed() {
    let h = harness_with(card_config()).await;
    let groups = ingest_and_group(
        &h,
        vec![
            raw("tx1", "rp1", 10.0),
            card("tx2", "rp1", 20.0, "Uber"),
            card("tx3", "rp1", 30.0, "Lyft"),
        ],
    )
    .await;

    // Card expenses are grouped per expense by default.
    assert_eq!(groups.len(), 3);
    let all = h.engine.expense_groups(ACCOUNT).await.unwrap();
    let card_groups = all
        .iter()
        .filter(|g| g.fund_source == FundSource::CorporateCard)
        .count();
    assert_eq!(card_groups, 2);
}

#[tokio::test]
async fn unexported_fund_source_stays_ungrouped() {
    let h = harness().await;
    let groups = ingest_and_group(&h, vec![card("tx1", "rp1", 20.0, "Uber")]).await;
    assert!(groups.is_empty());

    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx1".to_string()])
        .await
        .unwrap();
    assert_eq!(stored[0].expense_group_id, None);
    assert!(!stored[0].is_skipped);
}

#[tokio::test]
async fn card_expenses_split_by_bank_transaction() {
    let mut config = card_config();
    config.split_ccc_by_bank_transaction = true;
    let h = harness_with(config).await;

    let mut first = card("tx1", "rp1", 20.0, "Uber");
    first.bank_transaction_id = Some("bt-1".to_string());
    let mut second = card("tx2", "rp1", 5.0, "Uber");
    second.bank_transaction_id = Some("bt-1".to_string());
    let third = card("tx3", "rp1", 9.0, "Lyft");

    let groups = ingest_and_group(&h, vec![first, second, third]).await;
    assert_eq!(groups.len(), 2);

    let mut sizes = Vec::new();
    for group_id in &groups {
        sizes.push(
            h.engine
                .expenses_for_group(ACCOUNT, group_id)
                .await
                .unwrap()
                .len(),
        );
    }
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);
}

#[tokio::test]
async fn already_grouped_expenses_are_ignored() {
    let h = harness().await;
    ingest_and_group(&h, vec![raw("tx1", "rp1", 10.0)]).await;

    let stored = h
        .engine
        .expenses(ACCOUNT, &["tx1".to_string()])
        .await
        .unwrap();
    let result = h.engine.group_expenses(ACCOUNT, &stored).await.unwrap();
    assert!(result.groups.is_empty());
    assert_eq!(h.engine.expense_groups(ACCOUNT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn all_negative_bill_group_is_not_created() {
    let h = harness().await;
    let eligible = h
        .engine
        .ingest_expenses(
            ACCOUNT,
            vec![raw("tx1", "rp1", -10.0), raw("tx2", "rp1", -2.0)],
            false,
        )
        .await
        .unwrap();
    let result = h.engine.group_expenses(ACCOUNT, &eligible).await.unwrap();

    assert!(result.groups.is_empty());
    assert_eq!(
        result.skipped_expense_ids,
        vec!["tx1".to_string(), "tx2".to_string()]
    );
}
