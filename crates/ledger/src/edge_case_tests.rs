// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Fee Ledger
//!
//! End-to-end behaviour over the in-memory store:
//! - Reconciliation outcomes (LEDGER-R01 to LEDGER-R08)
//! - Idempotency and duplicate delivery (LEDGER-I01 to LEDGER-I07)
//! - Money conservation and allocation order (LEDGER-M01 to LEDGER-M03)
//! - Fee structure propagation (LEDGER-P01 to LEDGER-P04)

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::alerts::{LogNotifier, PendingAlert, PendingNotifier};
    use crate::channels::ChannelRegistry;
    use crate::error::LedgerResult;
    use crate::models::{FeeCategory, FeeFrequency};
    use crate::notification::PaymentNotification;
    use crate::repository::Stores;
    use crate::store::memory::MemoryStore;
    use crate::{LedgerConfig, LedgerService};

    pub const TUITION_CHANNEL: &str = "522511";
    pub const TRANSPORT_CHANNEL: &str = "522533";
    pub const GENERAL_CHANNEL: &str = "522522";

    const CHANNELS: &str = r#"[
        {"channel": "522511", "policy": {"dedicated": {"category": "TUITION"}}},
        {"channel": "522533", "policy": {"dedicated": {"category": "TRANSPORT"}}},
        {"channel": "522522", "policy": {"general": {"exclude": "TRANSPORT"}}}
    ]"#;

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub ledger: LedgerService,
        pub tuition: FeeCategory,
        pub transport: FeeCategory,
    }

    pub async fn harness() -> Harness {
        harness_with(Arc::new(LogNotifier)).await
    }

    pub async fn harness_with(notifier: Arc<dyn PendingNotifier>) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let tuition = store.add_category("TUITION", FeeFrequency::Termly).await;
        let transport = store.add_category("TRANSPORT", FeeFrequency::Termly).await;

        let config = LedgerConfig {
            channels: ChannelRegistry::from_json(CHANNELS).unwrap(),
            propagation_concurrency: 4,
            ..Default::default()
        };
        let ledger = LedgerService::new(Stores::memory(store.clone()), config, notifier);

        Harness {
            store,
            ledger,
            tuition,
            transport,
        }
    }

    pub fn notification(
        trans_id: &str,
        amount_minor: i64,
        phone: &str,
        channel_id: &str,
    ) -> PaymentNotification {
        PaymentNotification {
            transaction_id: trans_id.to_string(),
            amount_minor,
            phone: phone.to_string(),
            channel_id: channel_id.to_string(),
            bill_reference: String::new(),
            payer_name: Some("JANE DOE".to_string()),
            raw_payload: None,
        }
    }

    /// Forwards every alert into a channel the test can wait on
    pub struct ChannelNotifier(pub mpsc::UnboundedSender<PendingAlert>);

    #[async_trait]
    impl PendingNotifier for ChannelNotifier {
        async fn notify(&self, alert: &PendingAlert) -> LedgerResult<()> {
            let _ = self.0.send(alert.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use super::support::*;
    use crate::fee_line::{outstanding_balance, FeeStatus, Term};
    use crate::models::{Actor, PendingReason, TransactionStatus};
    use crate::repository::{AliasRepository, FeeLineRepository, PaymentRepository};
    use crate::ReconciliationOutcome;

    // =========================================================================
    // LEDGER-R01: single guardian learner, dedicated channel, exact amount
    // =========================================================================
    #[tokio::test]
    async fn test_guardian_payment_settles_tuition_and_learns_alias() {
        let h = harness().await;
        let learner = h.store.add_learner(None).await;
        h.store.add_guardian("0712345678", &[learner]).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;

        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKTQDM7W6S", 10_000, "0712345678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        match &outcome {
            ReconciliationOutcome::Success {
                learner_id,
                fee_line_id,
                matched_via_alias,
                already_applied,
                ..
            } => {
                assert_eq!(*learner_id, learner);
                assert_eq!(*fee_line_id, line.id);
                assert!(!matched_via_alias);
                assert!(!already_applied);
            }
            other => panic!("expected success, got {:?}", other),
        }

        let settled = h.store.get(line.id).await.unwrap().unwrap();
        assert_eq!(settled.status, FeeStatus::Paid);
        assert_eq!(settled.amount_paid_minor, 10_000);

        let aliases = h.store.aliases().await;
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].learner_id, learner);
        assert_eq!(aliases[0].phone, "254712345678");

        let record = h.ledger.recorder().find("RKTQDM7W6S").await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Success);
        assert_eq!(record.fee_line_id, Some(line.id));
        assert_eq!(record.normalized_phone.as_deref(), Some("254712345678"));
        assert!(record.payment_id.is_some());
    }

    // =========================================================================
    // LEDGER-R02: guardian with two learners and no alias
    // =========================================================================
    #[tokio::test]
    async fn test_shared_guardian_phone_is_held_for_review() {
        let h = harness().await;
        let first = h.store.add_learner(None).await;
        let second = h.store.add_learner(None).await;
        h.store.add_guardian("0712345678", &[first, second]).await;
        for learner in [first, second] {
            h.store
                .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
                .await;
        }

        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKT2", 10_000, "0712345678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.pending_reason(), Some(PendingReason::MultipleStudents));
        assert_eq!(h.store.payment_count().await, 0);
        assert!(h.store.aliases().await.is_empty());

        let record = h.ledger.recorder().find("RKT2").await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert_eq!(record.pending_reason, Some(PendingReason::MultipleStudents));
        assert_eq!(record.learner_id, None);
        assert_eq!(record.payment_id, None);
    }

    // =========================================================================
    // LEDGER-R03: known learner, nothing outstanding in the channel's category
    // =========================================================================
    #[tokio::test]
    async fn test_no_outstanding_line_in_category() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        h.store
            .add_fee_line(learner, h.transport.id, Some(Term::Term1), 2025, 5_000)
            .await;

        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKT3", 10_000, "+254 712 345 678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconciliationOutcome::Pending {
                trans_id: "RKT3".to_string(),
                reason: PendingReason::NoFees,
                learner_id: Some(learner),
            }
        );
        assert_eq!(h.store.payment_count().await, 0);
    }

    // =========================================================================
    // LEDGER-R04: general channel never touches the excluded category
    // =========================================================================
    #[tokio::test]
    async fn test_general_channel_skips_excluded_category() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let bus = h
            .store
            .add_fee_line(learner, h.transport.id, Some(Term::Term1), 2024, 5_000)
            .await;

        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKT4", 5_000, "0712345678", GENERAL_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.pending_reason(), Some(PendingReason::NoFees));
        let untouched = h.store.get(bus.id).await.unwrap().unwrap();
        assert_eq!(untouched.amount_paid_minor, 0);
    }

    // =========================================================================
    // LEDGER-R05: unknown phone and unconfigured channel
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_phone_and_unknown_channel() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        h.store
            .add_fee_line(learner, h.tuition.id, None, 2025, 10_000)
            .await;

        let nobody = h
            .ledger
            .reconciler
            .process(
                &notification("RKT5", 1_000, "0799999999", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();
        assert_eq!(nobody.pending_reason(), Some(PendingReason::NoStudent));

        let stray = h
            .ledger
            .reconciler
            .process(
                &notification("RKT6", 1_000, "0712345678", "000001"),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();
        assert_eq!(stray.pending_reason(), Some(PendingReason::Other));

        let queue = h
            .ledger
            .recorder()
            .list_pending(None, None, None)
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].trans_id, "RKT6");

        let filtered = h
            .ledger
            .recorder()
            .list_pending(Some(PendingReason::NoStudent), None, None)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].trans_id, "RKT5");
    }

    // =========================================================================
    // LEDGER-R06: alias-only resolution does not create a second alias
    // =========================================================================
    #[tokio::test]
    async fn test_alias_resolution_reuses_alias() {
        let h = harness().await;
        let learner = h.store.add_learner(None).await;
        h.store.remember(learner, "254722000111").await.unwrap();
        h.store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term2), 2025, 4_000)
            .await;

        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKT7", 4_000, "0722000111", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReconciliationOutcome::Success {
                matched_via_alias: true,
                ..
            }
        ));
        assert_eq!(h.store.aliases().await.len(), 1);
    }

    // =========================================================================
    // LEDGER-R07: pending outcomes raise a staff alert
    // =========================================================================
    #[tokio::test]
    async fn test_pending_outcome_sends_alert() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let h = harness_with(std::sync::Arc::new(ChannelNotifier(tx))).await;

        h.ledger
            .reconciler
            .process(
                &notification("RKT8", 2_500, "0700000001", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        let alert = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.trans_id, "RKT8");
        assert_eq!(alert.reason, PendingReason::NoStudent);
    }

    // =========================================================================
    // LEDGER-R08: overpayment stays on the one line, no change splitting
    // =========================================================================
    #[tokio::test]
    async fn test_overpayment_is_kept_on_single_line() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let term1 = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        let term2 = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term2), 2025, 10_000)
            .await;

        h.ledger
            .reconciler
            .process(
                &notification("RKT9", 15_000, "0712345678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        let first = h.store.get(term1.id).await.unwrap().unwrap();
        let second = h.store.get(term2.id).await.unwrap().unwrap();
        assert_eq!(first.amount_paid_minor, 15_000);
        assert_eq!(first.outstanding_minor(), -5_000);
        assert_eq!(second.amount_paid_minor, 0);
        assert_eq!(h.store.list_for_fee_line(term1.id).await.unwrap().len(), 1);

        let lines = h.store.list_for_learner(learner).await.unwrap();
        assert_eq!(outstanding_balance(&lines), 5_000);
    }
}

#[cfg(test)]
mod idempotency_tests {
    use super::support::*;
    use crate::fee_line::Term;
    use crate::models::{Actor, PaymentMethod, PendingReason, RecordInsert, TransactionStatus};
    use crate::repository::{FeeLineRepository, TransactionRecordRepository};
    use crate::{LedgerApplier, ReconciliationOutcome};

    // =========================================================================
    // LEDGER-I01: same notification twice
    // =========================================================================
    #[tokio::test]
    async fn test_reprocessing_is_a_no_op() {
        let h = harness().await;
        let learner = h.store.add_learner(None).await;
        h.store.add_guardian("0712345678", &[learner]).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        let n = notification("RKTQDM7W6S", 10_000, "0712345678", TUITION_CHANNEL);
        let actor = Actor::provider("mpesa");

        let first = h.ledger.reconciler.process(&n, &actor).await.unwrap();
        let second = h.ledger.reconciler.process(&n, &actor).await.unwrap();

        assert!(matches!(first, ReconciliationOutcome::Success { .. }));
        assert_eq!(
            second,
            ReconciliationOutcome::Duplicate {
                trans_id: "RKTQDM7W6S".to_string()
            }
        );
        assert_eq!(h.store.payment_count().await, 1);
        assert_eq!(h.store.transaction_count().await, 1);
        let line = h.store.get(line.id).await.unwrap().unwrap();
        assert_eq!(line.amount_paid_minor, 10_000);
    }

    // =========================================================================
    // LEDGER-I02: duplicate pending notification
    // =========================================================================
    #[tokio::test]
    async fn test_pending_duplicate_records_once() {
        let h = harness().await;
        let n = notification("RKTP", 500, "0799999999", TUITION_CHANNEL);
        let actor = Actor::provider("mpesa");

        h.ledger.reconciler.process(&n, &actor).await.unwrap();
        let again = h.ledger.reconciler.process(&n, &actor).await.unwrap();

        assert!(matches!(again, ReconciliationOutcome::Duplicate { .. }));
        assert_eq!(h.store.transaction_count().await, 1);
    }

    // =========================================================================
    // LEDGER-I03: concurrent deliveries of one transaction id
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_apply_once() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        let n = notification("RKTRACE", 6_000, "0712345678", TUITION_CHANNEL);

        let mut handles = vec![];
        for _ in 0..10 {
            let reconciler = h.ledger.reconciler.clone();
            let n = n.clone();
            handles.push(tokio::spawn(async move {
                reconciler.process(&n, &Actor::provider("mpesa")).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ReconciliationOutcome::Success { .. } => successes += 1,
                ReconciliationOutcome::Duplicate { .. } => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(h.store.payment_count().await, 1);
        assert_eq!(h.store.transaction_count().await, 1);
        let line = h.store.get(line.id).await.unwrap().unwrap();
        assert_eq!(line.amount_paid_minor, 6_000);
    }

    // =========================================================================
    // LEDGER-I04: crash after the ledger write, before the record write
    // =========================================================================
    #[tokio::test]
    async fn test_replay_after_unrecorded_apply_does_not_double_credit() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;

        // First attempt got as far as the atomic apply step
        LedgerApplier::new(h.store.clone())
            .apply(line.id, 4_000, PaymentMethod::Mpesa, "RKTCRASH")
            .await
            .unwrap();
        assert_eq!(h.store.transaction_count().await, 0);

        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKTCRASH", 4_000, "0712345678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReconciliationOutcome::Success {
                already_applied: true,
                ..
            }
        ));
        assert_eq!(h.store.payment_count().await, 1);
        assert_eq!(h.store.transaction_count().await, 1);
        let line = h.store.get(line.id).await.unwrap().unwrap();
        assert_eq!(line.amount_paid_minor, 4_000);
    }

    // =========================================================================
    // LEDGER-I05: storage failure during apply records nothing and is retryable
    // =========================================================================
    #[tokio::test]
    async fn test_storage_failure_leaves_no_partial_state() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        let n = notification("RKTFAIL", 10_000, "0712345678", TUITION_CHANNEL);

        h.store.fail_next_payment().await;
        let err = h
            .ledger
            .reconciler
            .process(&n, &Actor::provider("mpesa"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.store.payment_count().await, 0);
        assert_eq!(h.store.transaction_count().await, 0);
        assert!(h.store.aliases().await.is_empty());
        assert_eq!(h.store.get(line.id).await.unwrap().unwrap().amount_paid_minor, 0);

        // Provider redelivery goes through
        let retried = h
            .ledger
            .reconciler
            .process(&n, &Actor::provider("mpesa"))
            .await
            .unwrap();
        assert!(matches!(retried, ReconciliationOutcome::Success { .. }));
        assert_eq!(h.store.get(line.id).await.unwrap().unwrap().amount_paid_minor, 10_000);
    }

    // =========================================================================
    // LEDGER-I06: replay after an unrecorded apply that settled the line
    // =========================================================================
    #[tokio::test]
    async fn test_replay_after_unrecorded_apply_that_settled_the_line() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let h = harness_with(std::sync::Arc::new(ChannelNotifier(tx))).await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;

        let applied = LedgerApplier::new(h.store.clone())
            .apply(line.id, 10_000, PaymentMethod::Mpesa, "RKTCRASH")
            .await
            .unwrap();

        // Nothing outstanding is left, so a fresh selection would find no fees
        let outcome = h
            .ledger
            .reconciler
            .process(
                &notification("RKTCRASH", 10_000, "0712345678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconciliationOutcome::Success {
                trans_id: "RKTCRASH".to_string(),
                learner_id: learner,
                fee_line_id: line.id,
                payment_id: applied.payment.id,
                matched_via_alias: false,
                already_applied: true,
            }
        );
        let record = h.store.find("RKTCRASH").await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Success);
        assert_eq!(record.pending_reason, None);
        assert_eq!(record.payment_id, Some(applied.payment.id));
        assert_eq!(record.normalized_phone.as_deref(), Some("254712345678"));
        assert_eq!(h.store.payment_count().await, 1);
        assert_eq!(h.store.transaction_count().await, 1);
        assert_eq!(h.store.get(line.id).await.unwrap().unwrap().amount_paid_minor, 10_000);

        let alert = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(alert.is_err(), "no review alert for money already credited");
    }

    // =========================================================================
    // LEDGER-I07: a racing delivery's pending record is settled by the success
    // =========================================================================
    #[tokio::test]
    async fn test_success_settles_pending_record_from_racing_delivery() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        let n = notification("RKTRACE2", 10_000, "0712345678", TUITION_CHANNEL);
        let recorder = h.ledger.reconciler.recorder();

        // One delivery applied the payment, the other saw a settled line and held it
        let applied = LedgerApplier::new(h.store.clone())
            .apply(line.id, 10_000, PaymentMethod::Mpesa, "RKTRACE2")
            .await
            .unwrap();
        let held = recorder
            .record_pending(&n, Some("254712345678"), Some(learner), PendingReason::NoFees)
            .await
            .unwrap();
        assert!(matches!(held, RecordInsert::Inserted(_)));

        let settled = recorder
            .record_success(&n, Some("254712345678"), learner, &applied)
            .await
            .unwrap();

        let RecordInsert::Inserted(record) = settled else {
            panic!("pending record was not settled");
        };
        assert_eq!(record.status, TransactionStatus::Success);
        assert_eq!(record.pending_reason, None);
        assert_eq!(record.fee_line_id, Some(line.id));
        assert_eq!(record.payment_id, Some(applied.payment.id));
        assert_eq!(h.store.transaction_count().await, 1);
        assert!(h
            .store
            .list_pending(None, 50, 0)
            .await
            .unwrap()
            .is_empty());

        // A settled record is never settled twice
        let again = recorder
            .record_success(&n, Some("254712345678"), learner, &applied)
            .await
            .unwrap();
        assert!(matches!(again, RecordInsert::Duplicate));
    }
}

#[cfg(test)]
mod money_tests {
    use super::support::*;
    use crate::fee_line::{outstanding_balance, FeeStatus, Term};
    use crate::models::Actor;
    use crate::repository::FeeLineRepository;

    // =========================================================================
    // LEDGER-M01: oldest academic year is settled first
    // =========================================================================
    #[tokio::test]
    async fn test_older_year_is_paid_first() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let current = h
            .store
            .add_fee_line(learner, h.transport.id, Some(Term::Term1), 2025, 5_000)
            .await;
        let arrears = h
            .store
            .add_fee_line(learner, h.transport.id, Some(Term::Term3), 2024, 5_000)
            .await;

        h.ledger
            .reconciler
            .process(
                &notification("RKTOLD", 5_000, "0712345678", TRANSPORT_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        assert_eq!(
            h.store.get(arrears.id).await.unwrap().unwrap().status,
            FeeStatus::Paid
        );
        assert_eq!(
            h.store.get(current.id).await.unwrap().unwrap().amount_paid_minor,
            0
        );
    }

    // =========================================================================
    // LEDGER-M02: outstanding balance drops by exactly the applied amount
    // =========================================================================
    #[tokio::test]
    async fn test_balance_decreases_by_applied_amount() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        h.store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        h.store
            .add_fee_line(learner, h.tuition.id, Some(Term::Term2), 2025, 10_000)
            .await;
        h.store
            .add_fee_line(learner, h.transport.id, Some(Term::Term1), 2025, 3_000)
            .await;

        let mut expected = outstanding_balance(&h.store.list_for_learner(learner).await.unwrap());
        for (i, amount) in [2_500_i64, 7_500, 9_000, 1_000].into_iter().enumerate() {
            h.ledger
                .reconciler
                .process(
                    &notification(&format!("RKTM{i}"), amount, "0712345678", GENERAL_CHANNEL),
                    &Actor::provider("mpesa"),
                )
                .await
                .unwrap();
            expected -= amount;
            let lines = h.store.list_for_learner(learner).await.unwrap();
            assert_eq!(outstanding_balance(&lines), expected, "after payment {}", i);
        }
    }

    // =========================================================================
    // LEDGER-M03: concurrent payments on one line never lose an update
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_payments_all_land() {
        let h = harness().await;
        let learner = h.store.add_learner(Some("0712345678")).await;
        let line = h
            .store
            .add_fee_line(learner, h.tuition.id, None, 2025, 100_000)
            .await;

        let mut handles = vec![];
        for i in 0..20 {
            let reconciler = h.ledger.reconciler.clone();
            handles.push(tokio::spawn(async move {
                reconciler
                    .process(
                        &notification(&format!("RKTC{i}"), 1_000, "0712345678", TUITION_CHANNEL),
                        &Actor::provider("mpesa"),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let line = h.store.get(line.id).await.unwrap().unwrap();
        assert_eq!(line.amount_paid_minor, 20_000);
        assert_eq!(line.status, FeeStatus::PartiallyPaid);
        assert_eq!(h.store.payment_count().await, 20);
    }
}

#[cfg(test)]
mod propagation_tests {
    use uuid::Uuid;

    use super::support::*;
    use crate::fee_line::{FeeStatus, Term};
    use crate::models::Actor;
    use crate::repository::FeeLineRepository;

    // =========================================================================
    // LEDGER-P01: lowering the schedule below payments locks the line
    // =========================================================================
    #[tokio::test]
    async fn test_locked_line_never_drops_below_lock() {
        let h = harness().await;
        let class_id = Uuid::new_v4();
        let learner = h.store.add_learner(Some("0712345678")).await;
        h.store.enroll(learner, class_id, 2025).await;
        let actor = Actor::staff(Some("bursar".to_string()));

        h.store
            .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        h.ledger.propagator.apply(class_id, 2025, &actor).await.unwrap();

        h.ledger
            .reconciler
            .process(
                &notification("RKTL1", 9_000, "0712345678", TUITION_CHANNEL),
                &Actor::provider("mpesa"),
            )
            .await
            .unwrap();

        h.store
            .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, 8_000)
            .await;
        let report = h.ledger.propagator.apply(class_id, 2025, &actor).await.unwrap();
        assert_eq!(report.locked, 1);

        let line = &h.store.list_for_learner(learner).await.unwrap()[0];
        assert!(line.locked);
        assert_eq!(line.amount_due_minor, 8_000);
        assert_eq!(line.status, FeeStatus::Paid);

        for amount in [5_000, 12_000] {
            h.store
                .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, amount)
                .await;
            h.ledger.propagator.apply(class_id, 2025, &actor).await.unwrap();

            let line = &h.store.list_for_learner(learner).await.unwrap()[0];
            assert_eq!(line.amount_due_minor, 8_000);
            assert_eq!(line.base_amount_minor, 8_000);
            assert_eq!(line.status, FeeStatus::Paid);
        }
    }

    // =========================================================================
    // LEDGER-P02: one learner failing does not stop the class
    // =========================================================================
    #[tokio::test]
    async fn test_partial_failure_is_reported_not_fatal() {
        let h = harness().await;
        let class_id = Uuid::new_v4();
        let mut learners = vec![];
        for _ in 0..5 {
            let learner = h.store.add_learner(None).await;
            h.store.enroll(learner, class_id, 2025).await;
            learners.push(learner);
        }
        h.store
            .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        h.store
            .set_schedule(class_id, h.transport.id, Some(Term::Term1), 2025, 3_000)
            .await;
        h.store.fail_writes_for(learners[2]).await;

        let report = h
            .ledger
            .propagator
            .apply(class_id, 2025, &Actor::system("test"))
            .await
            .unwrap();

        assert_eq!(report.learners, 5);
        assert_eq!(report.created, 8);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.learner_id == learners[2]));
        assert!(!report.is_complete());

        for (i, learner) in learners.iter().enumerate() {
            let lines = h.store.list_for_learner(*learner).await.unwrap();
            assert_eq!(lines.len(), if i == 2 { 0 } else { 2 });
        }

        // Rerun touches nothing that already succeeded
        let rerun = h
            .ledger
            .propagator
            .apply(class_id, 2025, &Actor::system("test"))
            .await
            .unwrap();
        assert_eq!(rerun.unchanged, 8);
        assert_eq!(rerun.affected, 0);
    }

    // =========================================================================
    // LEDGER-P03: schedule change racing a payment on the same line
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_schedule_change_and_payment_race() {
        let h = harness().await;
        let class_id = Uuid::new_v4();
        let learner = h.store.add_learner(Some("0712345678")).await;
        h.store.enroll(learner, class_id, 2025).await;
        h.store
            .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        h.ledger
            .propagator
            .apply(class_id, 2025, &Actor::system("test"))
            .await
            .unwrap();
        h.store
            .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, 8_000)
            .await;

        let reconciler = h.ledger.reconciler.clone();
        let payment = tokio::spawn(async move {
            reconciler
                .process(
                    &notification("RKTRACE2", 9_000, "0712345678", TUITION_CHANNEL),
                    &Actor::provider("mpesa"),
                )
                .await
        });
        let propagator = h.ledger.propagator.clone();
        let schedule = tokio::spawn(async move {
            propagator
                .apply(class_id, 2025, &Actor::system("test"))
                .await
        });
        payment.await.unwrap().unwrap();
        schedule.await.unwrap().unwrap();

        // Either order ends with the payment kept and the new amount due
        let line = &h.store.list_for_learner(learner).await.unwrap()[0];
        assert_eq!(line.amount_paid_minor, 9_000);
        assert_eq!(line.amount_due_minor, 8_000);
        assert_eq!(line.status, FeeStatus::Paid);
    }

    // =========================================================================
    // LEDGER-P04: enrollment hook builds lines for the new learner only
    // =========================================================================
    #[tokio::test]
    async fn test_enrollment_hook_targets_one_learner() {
        let h = harness().await;
        let class_id = Uuid::new_v4();
        let existing = h.store.add_learner(None).await;
        h.store.enroll(existing, class_id, 2025).await;
        h.store
            .set_schedule(class_id, h.tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;

        let newcomer = h.store.add_learner(None).await;
        h.store.enroll(newcomer, class_id, 2025).await;
        let report = h
            .ledger
            .propagator
            .on_learner_enrolled(newcomer, class_id, 2025, &Actor::staff(None))
            .await
            .unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(h.store.list_for_learner(newcomer).await.unwrap().len(), 1);
        assert!(h.store.list_for_learner(existing).await.unwrap().is_empty());
    }
}
