//! Pending-review alerting
//!
//! Fire-and-forget side channel: staff hear about payments that need manual
//! matching. Delivery failures are logged and never affect reconciliation.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::PendingReason;

/// What staff are told about a pending payment
#[derive(Debug, Clone, Serialize)]
pub struct PendingAlert {
    pub trans_id: String,
    pub amount_minor: i64,
    pub phone: String,
    pub channel_id: String,
    pub bill_reference: String,
    pub reason: PendingReason,
    pub learner_id: Option<Uuid>,
}

impl PendingAlert {
    /// One-line human summary
    pub fn summary(&self) -> String {
        format!(
            "Payment {} of {}.{:02} from {} on {} needs review: {} ({})",
            self.trans_id,
            self.amount_minor / 100,
            self.amount_minor % 100,
            self.phone,
            self.channel_id,
            self.reason.description(),
            self.reason,
        )
    }
}

#[async_trait]
pub trait PendingNotifier: Send + Sync {
    async fn notify(&self, alert: &PendingAlert) -> LedgerResult<()>;
}

/// Writes alerts to the log only
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl PendingNotifier for LogNotifier {
    async fn notify(&self, alert: &PendingAlert) -> LedgerResult<()> {
        tracing::info!(
            trans_id = %alert.trans_id,
            reason = %alert.reason,
            amount_minor = alert.amount_minor,
            "Payment awaiting manual review"
        );
        Ok(())
    }
}

/// Posts alerts to a Slack-compatible incoming webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PendingNotifier for WebhookNotifier {
    async fn notify(&self, alert: &PendingAlert) -> LedgerResult<()> {
        let payload = serde_json::json!({ "text": alert.summary() });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LedgerError::Alert(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Alert(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
