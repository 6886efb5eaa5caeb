//! Inbound payment notifications
//!
//! The provider's C2B confirmation body is parsed into a provider-neutral
//! [`PaymentNotification`] before it reaches the orchestrator.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// A payment notification in the shape the orchestrator consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    /// Provider-assigned transaction id (unique key)
    pub transaction_id: String,
    pub amount_minor: i64,
    /// Paying phone number, as sent
    pub phone: String,
    /// Collection account / short code the payment arrived on
    pub channel_id: String,
    pub bill_reference: String,
    /// Audit only; never used for matching
    pub payer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,
}

/// Amount as the provider sends it: `"100.00"` or `100.0`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Text(String),
    Number(f64),
}

impl RawAmount {
    pub fn to_minor(&self) -> LedgerResult<i64> {
        match self {
            RawAmount::Text(s) => amount_to_minor(s),
            RawAmount::Number(n) => float_to_minor(*n),
        }
    }
}

/// C2B confirmation callback body
#[derive(Debug, Clone, Deserialize)]
pub struct C2bConfirmation {
    #[serde(rename = "TransactionType", default)]
    pub transaction_type: Option<String>,
    #[serde(rename = "TransID")]
    pub trans_id: String,
    #[serde(rename = "TransTime", default)]
    pub trans_time: Option<String>,
    #[serde(rename = "TransAmount")]
    pub trans_amount: RawAmount,
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "BillRefNumber", default)]
    pub bill_ref_number: Option<String>,
    #[serde(rename = "MSISDN")]
    pub msisdn: String,
    #[serde(rename = "FirstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "MiddleName", default)]
    pub middle_name: Option<String>,
    #[serde(rename = "LastName", default)]
    pub last_name: Option<String>,
}

impl C2bConfirmation {
    /// Parse a raw callback body, keeping the JSON for the audit record
    pub fn parse(body: &[u8]) -> LedgerResult<PaymentNotification> {
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| LedgerError::InvalidPayload(format!("Body is not JSON: {}", e)))?;
        let confirmation: C2bConfirmation = serde_json::from_value(raw.clone())
            .map_err(|e| LedgerError::InvalidPayload(e.to_string()))?;
        confirmation.into_notification(Some(raw))
    }

    pub fn into_notification(self, raw_payload: Option<serde_json::Value>) -> LedgerResult<PaymentNotification> {
        let transaction_id = self.trans_id.trim().to_string();
        if transaction_id.is_empty() {
            return Err(LedgerError::InvalidPayload("TransID is empty".to_string()));
        }

        let amount_minor = self.trans_amount.to_minor()?;

        let payer_name = [&self.first_name, &self.middle_name, &self.last_name]
            .iter()
            .filter_map(|part| part.as_deref())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(PaymentNotification {
            transaction_id,
            amount_minor,
            phone: self.msisdn.trim().to_string(),
            channel_id: self.business_short_code.trim().to_string(),
            bill_reference: self.bill_ref_number.unwrap_or_default().trim().to_string(),
            payer_name: if payer_name.is_empty() { None } else { Some(payer_name) },
            raw_payload,
        })
    }
}

/// Convert a decimal amount string to minor units, rounding to the nearest unit
///
/// Parsed as a decimal string so `"10.005"` rounds to 1001, not 1000.
pub fn amount_to_minor(raw: &str) -> LedgerResult<i64> {
    let invalid = || LedgerError::InvalidPayload(format!("Invalid amount '{}'", raw));

    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    let (whole, fraction) = cleaned.split_once('.').unwrap_or((cleaned.as_str(), ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };

    let mut fraction_digits = fraction.bytes().map(|b| i64::from(b - b'0'));
    let tenths = fraction_digits.next().unwrap_or(0);
    let hundredths = fraction_digits.next().unwrap_or(0);
    let round_up = fraction_digits.next().map(|d| d >= 5).unwrap_or(false);

    let minor = whole
        .checked_mul(100)
        .and_then(|m| m.checked_add(tenths * 10 + hundredths + i64::from(round_up)))
        .ok_or_else(invalid)?;

    if minor <= 0 {
        return Err(LedgerError::InvalidPayload(format!(
            "Amount must be positive, got '{}'",
            raw
        )));
    }
    Ok(minor)
}

/// JSON numbers take the same decimal path as strings
///
/// `f64` display is the shortest string that reads back as the same value,
/// so `10.005` becomes `"10.005"` rather than the binary `10.00499...`.
fn float_to_minor(value: f64) -> LedgerResult<i64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LedgerError::InvalidPayload(format!(
            "Amount must be a positive number, got {}",
            value
        )));
    }
    amount_to_minor(&value.to_string())
}
