//! Ledger application: one payment against one fee line, atomically

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{AppliedPayment, NewPayment, PaymentMethod};
use crate::repository::FeeLineRepository;

#[derive(Clone)]
pub struct LedgerApplier {
    fee_lines: Arc<dyn FeeLineRepository>,
}

impl LedgerApplier {
    pub fn new(fee_lines: Arc<dyn FeeLineRepository>) -> Self {
        Self { fee_lines }
    }

    /// Record a payment and credit the line in one unit.
    ///
    /// Either both the payment row and the fee line update are stored or
    /// neither is; a storage failure comes back as a retryable error.
    pub async fn apply(
        &self,
        fee_line_id: Uuid,
        amount_minor: i64,
        method: PaymentMethod,
        reference: &str,
    ) -> LedgerResult<AppliedPayment> {
        if amount_minor <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "Payment amount must be positive, got {}",
                amount_minor
            )));
        }
        let reference = reference.trim();
        if method.is_automated() && reference.is_empty() {
            return Err(LedgerError::InvalidInput(
                "Automated payments need a provider reference".to_string(),
            ));
        }

        let applied = self
            .fee_lines
            .apply_payment(NewPayment {
                fee_line_id,
                amount_minor,
                method,
                reference: reference.to_string(),
            })
            .await?;

        if applied.already_applied {
            tracing::info!(
                fee_line_id = %fee_line_id,
                reference = %reference,
                payment_id = %applied.payment.id,
                "Payment reference already applied; ledger left untouched"
            );
        } else {
            tracing::info!(
                fee_line_id = %fee_line_id,
                payment_id = %applied.payment.id,
                amount_minor,
                amount_paid_minor = applied.fee_line.amount_paid_minor,
                status = %applied.fee_line.status,
                "Payment applied to fee line"
            );
        }

        Ok(applied)
    }
}
