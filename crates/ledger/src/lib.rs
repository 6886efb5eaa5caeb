// Ledger crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SchoolPay Fee Ledger
//!
//! Reconciles mobile-money payment notifications against learners' fee lines
//! and keeps fee lines in step with class fee schedules.
//!
//! ## Features
//!
//! - **Reconciliation**: idempotent processing of C2B confirmations, from
//!   payer resolution through fee target selection to an atomic ledger write
//! - **Pending Review**: every payment that cannot be applied automatically
//!   is recorded with a reason code and surfaced to staff
//! - **Phone Aliases**: successful unambiguous matches teach the resolver
//! - **Fee Propagation**: class schedules pushed to enrolled learners with
//!   the locked-line rule, bounded concurrency and per-learner failures
//! - **Invariants**: SQL consistency checks over the ledger tables

pub mod alerts;
pub mod applier;
pub mod channels;
pub mod error;
pub mod fee_line;
pub mod guard;
pub mod invariants;
pub mod models;
pub mod notification;
pub mod orchestrator;
pub mod phone;
pub mod propagator;
pub mod recorder;
pub mod repository;
pub mod resolver;
pub mod selector;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Alerts
pub use alerts::{LogNotifier, PendingAlert, PendingNotifier, WebhookNotifier};

// Engines
pub use applier::LedgerApplier;
pub use guard::IdempotencyGuard;
pub use orchestrator::{Reconciler, ReconciliationOutcome};
pub use propagator::{FeeStructurePropagator, PropagationFailure, PropagationReport};
pub use recorder::TransactionRecorder;
pub use resolver::{PayerResolver, Resolution};
pub use selector::{FeeTargetSelector, TargetSelection};

// Channels
pub use channels::{AllocationPolicy, ChannelRegistry, ChannelRule};

// Error
pub use error::{LedgerError, LedgerResult};

// Data model
pub use fee_line::{outstanding_balance, FeeLine, FeeStatus, ScheduleChange, Term};
pub use models::{
    Actor, ActorType, AppliedPayment, ClassFeeSchedule, FeeCategory, FeeFrequency, NewPayment,
    Payment, PaymentMethod, PendingReason, PhoneAlias, RecordInsert, TransactionRecord,
    TransactionStatus,
};
pub use notification::{C2bConfirmation, PaymentNotification};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Storage
pub use repository::Stores;
pub use store::{MemoryStore, PgLedgerStore};

use std::sync::Arc;

/// Settings shared by the ledger services
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub phone_country_code: String,
    pub channels: ChannelRegistry,
    pub propagation_concurrency: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            phone_country_code: phone::DEFAULT_COUNTRY_CODE.to_string(),
            channels: ChannelRegistry::default(),
            propagation_concurrency: propagator::DEFAULT_CONCURRENCY,
        }
    }
}

/// Main ledger service that combines the reconciliation and propagation engines
#[derive(Clone)]
pub struct LedgerService {
    pub stores: Stores,
    pub reconciler: Reconciler,
    pub propagator: FeeStructurePropagator,
}

impl LedgerService {
    pub fn new(stores: Stores, config: LedgerConfig, notifier: Arc<dyn PendingNotifier>) -> Self {
        let reconciler = Reconciler::new(
            &stores,
            Arc::new(config.channels),
            &config.phone_country_code,
            notifier,
        );
        let propagator = FeeStructurePropagator::new(&stores, config.propagation_concurrency);

        Self {
            stores,
            reconciler,
            propagator,
        }
    }

    pub fn recorder(&self) -> &TransactionRecorder {
        self.reconciler.recorder()
    }
}
