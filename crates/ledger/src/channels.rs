//! Payment channel policy table
//!
//! Maps a (channel, bill reference) pair to the rule that decides which fee
//! line a payment may settle. Loaded from JSON configuration:
//!
//! ```json
//! [
//!   {"channel": "522533", "policy": {"dedicated": {"category": "TRANSPORT"}}},
//!   {"channel": "522522", "reference": "FEES", "policy": {"general": {"exclude": "TRANSPORT"}}}
//! ]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// How a channel's payments are allocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Channel always pays one fee category
    Dedicated { category: String },
    /// Any category, except the one reserved for a dedicated channel
    General {
        #[serde(default)]
        exclude: Option<String>,
    },
}

/// One row of the policy table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRule {
    pub channel: String,
    /// Bill reference this rule is restricted to; `None` matches any reference
    #[serde(default)]
    pub reference: Option<String>,
    pub policy: AllocationPolicy,
}

/// Channel policy lookup
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    rules: Vec<ChannelRule>,
}

impl ChannelRegistry {
    pub fn new(rules: Vec<ChannelRule>) -> LedgerResult<Self> {
        for rule in &rules {
            if rule.channel.trim().is_empty() {
                return Err(LedgerError::Configuration(
                    "Channel rule has an empty channel".to_string(),
                ));
            }
            let category = match &rule.policy {
                AllocationPolicy::Dedicated { category } => Some(category),
                AllocationPolicy::General { exclude } => exclude.as_ref(),
            };
            if category.is_some_and(|c| c.trim().is_empty()) {
                return Err(LedgerError::Configuration(format!(
                    "Channel rule for '{}' names an empty category",
                    rule.channel
                )));
            }
        }
        Ok(Self { rules })
    }

    /// Parse the JSON policy table
    pub fn from_json(json: &str) -> LedgerResult<Self> {
        let rules: Vec<ChannelRule> = serde_json::from_str(json)
            .map_err(|e| LedgerError::Configuration(format!("Invalid channel table: {}", e)))?;
        Self::new(rules)
    }

    /// Rule for a payment, or `None` when the combination is not configured.
    ///
    /// A rule bound to the exact bill reference (case-insensitive) beats the
    /// channel's catch-all rule.
    pub fn policy_for(&self, channel_id: &str, bill_reference: &str) -> Option<&AllocationPolicy> {
        let channel_id = channel_id.trim();
        let reference = bill_reference.trim().to_ascii_uppercase();

        let mut fallback = None;
        for rule in self.rules.iter().filter(|r| r.channel.trim() == channel_id) {
            match &rule.reference {
                Some(r) if r.trim().to_ascii_uppercase() == reference => return Some(&rule.policy),
                Some(_) => {}
                None => {
                    if fallback.is_none() {
                        fallback = Some(&rule.policy);
                    }
                }
            }
        }
        fallback
    }

    pub fn rules(&self) -> &[ChannelRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
