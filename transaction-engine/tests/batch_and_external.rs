//! Batch submission, interbank transfers and enquiries

mod common;

use common::{signed, Harness, CLEARING_ACCOUNT, FEE_ACCOUNT};
use ledger_core::{LedgerStore, PaymentStep, TransactionStatus};
use security::AuditEventType;
use std::collections::HashSet;
use transaction_engine::cache::keys;
use transaction_engine::{
    verify_record, AccountEnquiry, EngineConfig, ExternalTransferRequest, SettlementTicket, TransactionError,
};

const A: &str = "2000000001";
const B: &str = "2000000002";
const C: &str = "2000000003";

fn external(reference: Option<&str>, from: &str, amount: i64) -> ExternalTransferRequest {
    ExternalTransferRequest {
        reference: reference.map(str::to_string),
        from_account: from.to_string(),
        to_account: "0123456789".to_string(),
        to_bank_code: "058".to_string(),
        amount,
        currency: "NGN".to_string(),
        narration: Some("rent".to_string()),
    }
}

async fn payment_steps(h: &Harness, id: &str) -> Vec<PaymentStep> {
    h.store
        .payment_states(id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.step)
        .collect()
}

#[tokio::test]
async fn test_batch_partitions_items() {
    let mut h = Harness::new().await;
    h.open(A, "user-a", "Account A", 10_000).await;
    h.open(B, "user-b", "Account B", 0).await;
    h.open(C, "user-c", "Account C", 100).await;

    let mut tampered = signed("b-3", A, B, 100, 3);
    tampered.amount = 5_000;

    let batch = vec![
        signed("b-1", A, B, 100, 1),
        signed("b-2", A, C, 200, 2),
        tampered,
        signed("b-4", C, B, 500, 1),
        signed("b-5", A, B, 300, 4),
    ];
    let result = h.engine.submit_batch(&batch).await.unwrap();

    assert_eq!(result.summary.total, 5);
    assert_eq!(result.summary.succeeded, 3);
    assert_eq!(result.summary.failed, 2);
    let failed: HashSet<&str> = result.failed.iter().map(|f| f.transaction_id.as_str()).collect();
    assert_eq!(failed, HashSet::from(["b-3", "b-4"]));
    assert!(result.failed.iter().all(|f| !f.reason.is_empty()));

    assert_eq!(h.balance(A).await, 9_400);
    assert_eq!(h.balance(B).await, 400);
    assert_eq!(h.balance(C).await, 300);

    h.worker.drain().await;
    let tickets: Vec<SettlementTicket> = h
        .cache
        .queue(keys::SETTLEMENT_QUEUE)
        .iter()
        .map(|s| serde_json::from_str(s).unwrap())
        .collect();
    assert_eq!(tickets.len(), 3);
    let batch_ids: HashSet<_> = tickets.iter().map(|t| t.batch_id).collect();
    assert_eq!(batch_ids.len(), 1);
    assert!(tickets[0].batch_id.is_some());
    assert_eq!(h.audit.count(AuditEventType::BatchCompleted), 1);
}

#[tokio::test]
async fn test_batch_size_limits() {
    let mut config = EngineConfig::default();
    config.limits.max_batch_size = 2;
    let h = Harness::with_config(config).await;
    h.open(A, "user-a", "Account A", 10_000).await;
    h.open(B, "user-b", "Account B", 0).await;

    assert!(matches!(
        h.engine.submit_batch(&[]).await,
        Err(TransactionError::BatchRejected(_))
    ));

    let batch = vec![
        signed("b-1", A, B, 100, 1),
        signed("b-2", A, B, 100, 2),
        signed("b-3", A, B, 100, 3),
    ];
    assert!(matches!(
        h.engine.submit_batch(&batch).await,
        Err(TransactionError::BatchRejected(_))
    ));
    assert_eq!(h.balance(A).await, 10_000);

    let result = h.engine.submit_batch(&batch[..2]).await.unwrap();
    assert_eq!(result.summary.succeeded, 2);
}

#[tokio::test]
async fn test_batch_replays_are_processed_not_resettled() {
    let mut h = Harness::new().await;
    h.open(A, "user-a", "Account A", 10_000).await;
    h.open(B, "user-b", "Account B", 0).await;

    let item = signed("b-1", A, B, 100, 1);
    h.engine.submit(&item).await.unwrap();
    h.worker.drain().await;

    let result = h.engine.submit_batch(&[item.clone(), item]).await.unwrap();
    assert_eq!(result.summary.succeeded, 2);
    assert_eq!(h.balance(A).await, 9_900);

    h.worker.drain().await;
    assert_eq!(h.cache.queue(keys::SETTLEMENT_QUEUE).len(), 1);
}

#[tokio::test]
async fn test_external_transfer_posts_fee_and_clearing() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;

    let outcome = h.engine.external_transfer("user-a", &external(Some("EXT-ref-1"), A, 10_000)).await.unwrap();
    let record = outcome.record;
    assert_eq!(record.status, TransactionStatus::PendingSettlement);
    assert_eq!(record.fee, 100);
    assert_eq!(record.total, 10_100);
    assert_eq!(record.counter, None);
    assert_eq!(record.destination_bank.as_deref(), Some("058"));

    assert_eq!(h.balance(A).await, 9_900);
    assert_eq!(h.balance(FEE_ACCOUNT).await, 100);
    assert_eq!(h.balance(CLEARING_ACCOUNT).await, 10_000);

    let entries = h.entries("EXT-ref-1").await;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 0);

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].transaction_id, "EXT-ref-1");
    assert_eq!(sent[0].fee, 100);
    let stored = h.store.get_transaction("EXT-ref-1").await.unwrap().unwrap();
    assert!(verify_record(h.hsm.as_ref(), &stored, &sent[0].attestation).unwrap());
    assert_eq!(stored.signature, sent[0].attestation.signature);

    assert_eq!(payment_steps(&h, "EXT-ref-1").await, vec![PaymentStep::Pending]);
}

#[tokio::test]
async fn test_external_reference_is_idempotent() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;

    let request = external(Some("EXT-ref-2"), A, 1_000);
    assert!(!h.engine.external_transfer("user-a", &request).await.unwrap().replayed);
    assert!(h.engine.external_transfer("user-a", &request).await.unwrap().replayed);

    assert_eq!(h.balance(A).await, 20_000 - 1_055);
    assert_eq!(h.gateway.sent().len(), 1);

    // Without a reference each call is new
    let anonymous = external(None, A, 1_000);
    let first = h.engine.external_transfer("user-a", &anonymous).await.unwrap();
    let second = h.engine.external_transfer("user-a", &anonymous).await.unwrap();
    assert_ne!(first.record.id, second.record.id);
    assert!(first.record.id.starts_with("EXT-"));
}

#[tokio::test]
async fn test_external_transfer_requires_ownership() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;

    let err = h
        .engine
        .external_transfer("user-b", &external(Some("EXT-x"), A, 1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Forbidden(_)));
    assert_eq!(h.balance(A).await, 20_000);
    assert!(h.store.get_transaction("EXT-x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_external_reference_replays_only_to_its_owner() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;
    h.open(B, "user-b", "Account B", 20_000).await;

    let original = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-victim"), A, 5_000))
        .await
        .unwrap();
    assert!(!original.replayed);

    // Reused from another account, existing or not
    for from in [B, "9999999999"] {
        let err = h
            .engine
            .external_transfer("user-b", &external(Some("EXT-victim"), from, 5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::ReferenceConflict(_)), "{:?}", err);
        assert!(!err.to_string().contains(A));
    }

    let err = h
        .engine
        .external_transfer("user-b", &external(Some("EXT-victim"), A, 5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Forbidden(_)));

    let replay = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-victim"), A, 5_000))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.record.id, original.record.id);

    assert_eq!(h.balance(B).await, 20_000);
    assert_eq!(h.gateway.sent().len(), 1);
    assert_eq!(h.audit.count(AuditEventType::IdempotentReplay), 1);
}

#[tokio::test]
async fn test_external_input_validation() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;

    let mut bad_bank = external(None, A, 1_000);
    bad_bank.to_bank_code = "05 8".to_string();
    assert!(matches!(
        h.engine.external_transfer("user-a", &bad_bank).await,
        Err(TransactionError::Validation(_))
    ));

    let mut bad_currency = external(None, A, 1_000);
    bad_currency.currency = "naira".to_string();
    assert!(h.engine.external_transfer("user-a", &bad_currency).await.is_err());

    assert!(h.engine.external_transfer("user-a", &external(None, A, 0)).await.is_err());
}

#[tokio::test]
async fn test_external_terminal_failures_are_recorded() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 5_000).await;

    // 5_000 + 75 fee
    let outcome = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-short"), A, 5_000))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TransactionStatus::FailedInsufficientBalance);
    assert_eq!(outcome.record.fee, 75);
    assert_eq!(outcome.record.total, 5_075);

    let outcome = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-none"), "2999999999", 100))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TransactionStatus::FailedAccountNotFound);

    for id in ["EXT-short", "EXT-none"] {
        let stored = h.store.get_transaction(id).await.unwrap().unwrap();
        assert!(stored.is_failure());
        assert_eq!(payment_steps(&h, id).await, vec![PaymentStep::Pending, PaymentStep::Failed]);
    }
    assert_eq!(h.balance(A).await, 5_000);
}

#[tokio::test]
async fn test_message_construction_failure_rolls_back() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;
    h.gateway.fail_build(true);

    let outcome = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-iso"), A, 1_000))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TransactionStatus::FailedIsoConversion);

    assert_eq!(h.balance(A).await, 20_000);
    assert_eq!(h.balance(FEE_ACCOUNT).await, 0);
    assert!(h.entries("EXT-iso").await.is_empty());
    assert!(h.gateway.sent().is_empty());
    assert_eq!(
        h.store.get_transaction("EXT-iso").await.unwrap().unwrap().status,
        TransactionStatus::FailedIsoConversion
    );
}

#[tokio::test]
async fn test_send_failure_reverses_posting() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;
    h.gateway.fail_send(true);

    let outcome = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-send"), A, 10_000))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TransactionStatus::FailedSettlementError);

    assert_eq!(h.balance(A).await, 20_000);
    assert_eq!(h.balance(FEE_ACCOUNT).await, 0);
    assert_eq!(h.balance(CLEARING_ACCOUNT).await, 0);
    assert_eq!(h.entries("EXT-send").await.len(), 3);
    let reversal = h.entries("EXT-send:reversal").await;
    assert_eq!(reversal.len(), 3);
    assert_eq!(reversal.iter().map(|e| e.amount).sum::<i64>(), 0);

    let stored = h.store.get_transaction("EXT-send").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::FailedSettlementError);
    assert!(stored.failure_reason.is_some());
    assert_eq!(
        payment_steps(&h, "EXT-send").await,
        vec![PaymentStep::Pending, PaymentStep::Reversed]
    );
    assert_eq!(h.audit.count(AuditEventType::SettlementFailed), 1);
}

#[tokio::test]
async fn test_failed_reversal_is_parked_and_retried() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;
    h.gateway.fail_send(true);
    h.faults.fail_reversals(true);

    let outcome = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-stuck"), A, 10_000))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TransactionStatus::ReversalPending);
    assert!(!outcome.succeeded());
    let total = outcome.record.total;
    assert_eq!(h.balance(A).await, 20_000 - total);
    assert!(h.entries("EXT-stuck:reversal").await.is_empty());

    let stored = h.store.get_transaction("EXT-stuck").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::ReversalPending);
    assert!(stored.failure_reason.is_some());
    assert_eq!(
        payment_steps(&h, "EXT-stuck").await,
        vec![PaymentStep::Pending, PaymentStep::Failed]
    );

    // Still failing: the record stays parked
    assert!(h.engine.retry_reversal("EXT-stuck").await.is_err());
    assert_eq!(
        h.store.get_transaction("EXT-stuck").await.unwrap().unwrap().status,
        TransactionStatus::ReversalPending
    );

    h.faults.fail_reversals(false);
    let record = h.engine.retry_reversal("EXT-stuck").await.unwrap();
    assert_eq!(record.status, TransactionStatus::FailedSettlementError);
    assert_eq!(h.balance(A).await, 20_000);
    assert_eq!(h.balance(FEE_ACCOUNT).await, 0);
    assert_eq!(h.balance(CLEARING_ACCOUNT).await, 0);
    let reversal = h.entries("EXT-stuck:reversal").await;
    assert_eq!(reversal.len(), 3);
    assert_eq!(reversal.iter().map(|e| e.amount).sum::<i64>(), 0);
    assert_eq!(
        payment_steps(&h, "EXT-stuck").await,
        vec![PaymentStep::Pending, PaymentStep::Failed, PaymentStep::Reversed]
    );

    // Reversed once only
    assert!(matches!(
        h.engine.retry_reversal("EXT-stuck").await,
        Err(TransactionError::Validation(_))
    ));
    let replay = h
        .engine
        .external_transfer("user-a", &external(Some("EXT-stuck"), A, 10_000))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.record.status, TransactionStatus::FailedSettlementError);
}

#[tokio::test]
async fn test_confirm_settlement() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 20_000).await;
    h.engine
        .external_transfer("user-a", &external(Some("EXT-ok"), A, 1_000))
        .await
        .unwrap();

    let settled = h.engine.confirm_settlement("EXT-ok").await.unwrap();
    assert_eq!(settled.status, TransactionStatus::Settled);
    assert!(settled.settled_at.is_some());

    let stored = h.store.get_transaction("EXT-ok").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Settled);
    assert_eq!(
        payment_steps(&h, "EXT-ok").await,
        vec![PaymentStep::Pending, PaymentStep::Success]
    );

    assert!(matches!(
        h.engine.confirm_settlement("EXT-ok").await,
        Err(TransactionError::Validation(_))
    ));
    assert!(matches!(
        h.engine.confirm_settlement("EXT-missing").await,
        Err(TransactionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_enquiries_against_ledger() {
    let h = Harness::new().await;
    h.open(A, "user-a", "Account A", 7_500).await;

    let enquiry = AccountEnquiry::new(h.store.clone(), security::AuditLog::new(h.audit.clone())).unwrap();
    assert_eq!(enquiry.name_enquiry(A).await.unwrap().account_name, "Account A");

    let own = enquiry.balance_enquiry("user-a", A).await.unwrap();
    assert_eq!(own.available_balance, Some(7_500));
    let other = enquiry.balance_enquiry("user-b", A).await.unwrap();
    assert_eq!(other.available_balance, None);
}
