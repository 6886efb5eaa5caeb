//! Application state

use schoolpay_ledger::{
    InvariantChecker, LedgerService, LogNotifier, MemoryStore, PendingNotifier, Stores,
    WebhookNotifier,
};
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub ledger: LedgerService,
    /// Only present when backed by Postgres
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let stores = Stores::postgres(pool.clone(), &config.phone_country_code);
        tracing::info!("Postgres ledger store initialized");

        let invariants = Some(Arc::new(InvariantChecker::new(pool)));
        Self::build(stores, config, invariants)
    }

    /// State over an in-process store, with no database behind it
    pub fn in_memory(store: Arc<MemoryStore>, config: Config) -> Self {
        tracing::warn!("Using in-memory ledger store - data is lost on restart");
        Self::build(Stores::memory(store), config, None)
    }

    fn build(stores: Stores, config: Config, invariants: Option<Arc<InvariantChecker>>) -> Self {
        let notifier: Arc<dyn PendingNotifier> = match &config.pending_alert_webhook_url {
            Some(url) => {
                tracing::info!("Pending-review alerts will be posted to webhook");
                Arc::new(WebhookNotifier::new(url.clone()))
            }
            None => {
                tracing::warn!(
                    "Pending-review alerts only logged (missing PENDING_ALERT_WEBHOOK_URL)"
                );
                Arc::new(LogNotifier)
            }
        };

        if config.payment_channels.is_empty() {
            tracing::warn!("No payment channels configured");
        } else {
            tracing::info!(
                channels = config.payment_channels.rules().len(),
                "Payment channel table loaded"
            );
        }

        if config.staff_api_token.is_empty() {
            tracing::warn!("Staff endpoints disabled (missing STAFF_API_TOKEN)");
        }

        let ledger = LedgerService::new(stores, config.ledger_config(), notifier);
        tracing::info!(
            concurrency = config.propagation_concurrency,
            "Ledger service initialized"
        );

        Self {
            config,
            ledger,
            invariants,
        }
    }
}
