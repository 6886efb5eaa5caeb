//! Reconciliation orchestrator
//!
//! Entry point for inbound payment notifications:
//!
//! ```text
//! RECEIVED -> DUPLICATE
//!          -> RESOLVING -> PENDING[NO_STUDENT | MULTIPLE_STUDENTS]
//!                       -> SELECTING -> PENDING[NO_FEES | OTHER]
//!                                    -> APPLYING -> SUCCESS
//! ```
//!
//! Every terminal state except DUPLICATE writes exactly one transaction
//! record, and it is written after the ledger mutation. A crash between the
//! two is safe to replay: the payment reference is unique, so the second
//! delivery finds the existing payment and records SUCCESS against its fee
//! line without resolving the payer or selecting a target again.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::alerts::{PendingAlert, PendingNotifier};
use crate::applier::LedgerApplier;
use crate::channels::ChannelRegistry;
use crate::error::{LedgerError, LedgerResult};
use crate::guard::IdempotencyGuard;
use crate::models::{Actor, AppliedPayment, PaymentMethod, PendingReason, RecordInsert};
use crate::notification::PaymentNotification;
use crate::recorder::TransactionRecorder;
use crate::repository::{AliasRepository, FeeLineRepository, PaymentRepository, Stores};
use crate::resolver::PayerResolver;
use crate::selector::{FeeTargetSelector, TargetSelection};

/// Terminal state of one notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationOutcome {
    /// Seen before; nothing was done
    Duplicate { trans_id: String },
    /// Applied to a fee line
    Success {
        trans_id: String,
        learner_id: Uuid,
        fee_line_id: Uuid,
        payment_id: Uuid,
        matched_via_alias: bool,
        /// The payment existed from an earlier, unrecorded attempt
        already_applied: bool,
    },
    /// Recorded for staff review
    Pending {
        trans_id: String,
        reason: PendingReason,
        learner_id: Option<Uuid>,
    },
}

impl ReconciliationOutcome {
    pub fn trans_id(&self) -> &str {
        match self {
            ReconciliationOutcome::Duplicate { trans_id }
            | ReconciliationOutcome::Success { trans_id, .. }
            | ReconciliationOutcome::Pending { trans_id, .. } => trans_id,
        }
    }

    pub fn pending_reason(&self) -> Option<PendingReason> {
        match self {
            ReconciliationOutcome::Pending { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Composes guard, resolver, selector, applier and recorder
#[derive(Clone)]
pub struct Reconciler {
    guard: IdempotencyGuard,
    resolver: PayerResolver,
    selector: FeeTargetSelector,
    applier: LedgerApplier,
    recorder: TransactionRecorder,
    aliases: Arc<dyn AliasRepository>,
    payments: Arc<dyn PaymentRepository>,
    fee_lines: Arc<dyn FeeLineRepository>,
    notifier: Arc<dyn PendingNotifier>,
}

impl Reconciler {
    pub fn new(
        stores: &Stores,
        channels: Arc<ChannelRegistry>,
        phone_country_code: &str,
        notifier: Arc<dyn PendingNotifier>,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(stores.transactions.clone()),
            resolver: PayerResolver::new(
                stores.directory.clone(),
                stores.aliases.clone(),
                phone_country_code,
            ),
            selector: FeeTargetSelector::new(
                channels,
                stores.categories.clone(),
                stores.fee_lines.clone(),
            ),
            applier: LedgerApplier::new(stores.fee_lines.clone()),
            recorder: TransactionRecorder::new(stores.transactions.clone()),
            aliases: stores.aliases.clone(),
            payments: stores.payments.clone(),
            fee_lines: stores.fee_lines.clone(),
            notifier,
        }
    }

    pub fn recorder(&self) -> &TransactionRecorder {
        &self.recorder
    }

    /// Process one notification to a terminal state.
    ///
    /// Errors are storage failures (retryable, nothing recorded) or invalid
    /// input. Pending outcomes are not errors.
    pub async fn process(
        &self,
        notification: &PaymentNotification,
        actor: &Actor,
    ) -> LedgerResult<ReconciliationOutcome> {
        let trans_id = notification.transaction_id.as_str();
        if notification.amount_minor <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "Transaction {} has non-positive amount {}",
                trans_id, notification.amount_minor
            )));
        }

        tracing::info!(
            trans_id = %trans_id,
            amount_minor = notification.amount_minor,
            channel = %notification.channel_id,
            actor = %actor,
            "Payment notification received"
        );

        if self.guard.has_been_processed(trans_id).await? {
            tracing::info!(trans_id = %trans_id, "Duplicate notification, already processed");
            return Ok(ReconciliationOutcome::Duplicate {
                trans_id: trans_id.to_string(),
            });
        }

        if let Some(applied) = self.existing_payment(trans_id).await? {
            tracing::warn!(
                trans_id = %trans_id,
                payment_id = %applied.payment.id,
                "Payment already applied without a transaction record"
            );
            let normalized = self.resolver.normalize(&notification.phone);
            let learner_id = applied.fee_line.learner_id;
            return self
                .complete(notification, normalized.as_deref(), learner_id, &applied, false)
                .await;
        }

        let resolution = self.resolver.resolve(&notification.phone).await?;
        let normalized = resolution.normalized_phone.as_deref();

        let Some(learner_id) = resolution.single() else {
            let reason = resolution
                .pending_reason()
                .unwrap_or(PendingReason::NoStudent);
            return self.hold(notification, normalized, None, reason).await;
        };

        let fee_line = match self
            .selector
            .select_target(learner_id, &notification.channel_id, &notification.bill_reference)
            .await?
        {
            TargetSelection::FeeLine(line) => line,
            TargetSelection::Pending(reason) => {
                return self
                    .hold(notification, normalized, Some(learner_id), reason)
                    .await;
            }
        };

        let applied = self
            .applier
            .apply(
                fee_line.id,
                notification.amount_minor,
                PaymentMethod::Mpesa,
                trans_id,
            )
            .await?;

        if !resolution.matched_via_alias {
            if let Some(phone) = normalized {
                self.learn_alias(learner_id, phone).await;
            }
        }

        self.complete(
            notification,
            normalized,
            learner_id,
            &applied,
            resolution.matched_via_alias,
        )
        .await
    }

    /// The M-Pesa payment already credited for this transaction, if any
    async fn existing_payment(&self, trans_id: &str) -> LedgerResult<Option<AppliedPayment>> {
        let Some(payment) = self
            .payments
            .find_by_reference(PaymentMethod::Mpesa, trans_id)
            .await?
        else {
            return Ok(None);
        };

        let fee_line = self.fee_lines.get(payment.fee_line_id).await?.ok_or_else(|| {
            LedgerError::NotFound(format!(
                "Fee line {} for payment {}",
                payment.fee_line_id, payment.id
            ))
        })?;

        Ok(Some(AppliedPayment {
            payment,
            fee_line,
            already_applied: true,
        }))
    }

    async fn complete(
        &self,
        notification: &PaymentNotification,
        normalized_phone: Option<&str>,
        learner_id: Uuid,
        applied: &AppliedPayment,
        matched_via_alias: bool,
    ) -> LedgerResult<ReconciliationOutcome> {
        let trans_id = notification.transaction_id.clone();

        match self
            .recorder
            .record_success(notification, normalized_phone, learner_id, applied)
            .await?
        {
            RecordInsert::Inserted(_) => {
                tracing::info!(
                    trans_id = %trans_id,
                    learner_id = %learner_id,
                    fee_line_id = %applied.fee_line.id,
                    payment_id = %applied.payment.id,
                    "Payment reconciled"
                );
                Ok(ReconciliationOutcome::Success {
                    trans_id,
                    learner_id,
                    fee_line_id: applied.fee_line.id,
                    payment_id: applied.payment.id,
                    matched_via_alias,
                    already_applied: applied.already_applied,
                })
            }
            RecordInsert::Duplicate => {
                tracing::info!(
                    trans_id = %trans_id,
                    "Concurrent delivery recorded this transaction first"
                );
                Ok(ReconciliationOutcome::Duplicate { trans_id })
            }
        }
    }

    async fn hold(
        &self,
        notification: &PaymentNotification,
        normalized_phone: Option<&str>,
        learner_id: Option<Uuid>,
        reason: PendingReason,
    ) -> LedgerResult<ReconciliationOutcome> {
        let trans_id = notification.transaction_id.clone();

        // A concurrent delivery may have applied the money since the check above
        if let Some(applied) = self.existing_payment(&trans_id).await? {
            let learner_id = applied.fee_line.learner_id;
            return self
                .complete(notification, normalized_phone, learner_id, &applied, false)
                .await;
        }

        match self
            .recorder
            .record_pending(notification, normalized_phone, learner_id, reason)
            .await?
        {
            RecordInsert::Inserted(_) => {
                // Settle our own record if the payment landed after the insert
                if let Some(applied) = self.existing_payment(&trans_id).await? {
                    let learner_id = applied.fee_line.learner_id;
                    return self
                        .complete(notification, normalized_phone, learner_id, &applied, false)
                        .await;
                }

                tracing::info!(
                    trans_id = %trans_id,
                    reason = %reason,
                    learner_id = ?learner_id,
                    "Payment held for review"
                );
                self.alert(PendingAlert {
                    trans_id: trans_id.clone(),
                    amount_minor: notification.amount_minor,
                    phone: notification.phone.clone(),
                    channel_id: notification.channel_id.clone(),
                    bill_reference: notification.bill_reference.clone(),
                    reason,
                    learner_id,
                });
                Ok(ReconciliationOutcome::Pending {
                    trans_id,
                    reason,
                    learner_id,
                })
            }
            RecordInsert::Duplicate => {
                tracing::info!(
                    trans_id = %trans_id,
                    "Concurrent delivery recorded this transaction first"
                );
                Ok(ReconciliationOutcome::Duplicate { trans_id })
            }
        }
    }

    /// Create or confirm the phone alias; failures never fail the payment
    async fn learn_alias(&self, learner_id: Uuid, phone: &str) {
        match self.aliases.remember(learner_id, phone).await {
            Ok(alias) => tracing::debug!(
                learner_id = %learner_id,
                alias_id = %alias.id,
                "Phone alias recorded"
            ),
            Err(e) => tracing::warn!(
                learner_id = %learner_id,
                error = %e,
                "Failed to record phone alias"
            ),
        }
    }

    fn alert(&self, alert: PendingAlert) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&alert).await {
                tracing::warn!(
                    trans_id = %alert.trans_id,
                    error = %e,
                    "Failed to send pending-review alert"
                );
            }
        });
    }
}
