//! Stripe integration: hosted checkout for the pro plan and the signed
//! webhook that is the only path by which a plan ever changes.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const STRIPE_BASE_URL: &str = "https://api.stripe.com";

/// Reject webhook timestamps further than this from now.
pub const WEBHOOK_TOLERANCE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("stripe request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stripe error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct Customer {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct StripeClient {
    secret_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self {
            secret_key,
            base_url: STRIPE_BASE_URL.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("build stripe http client"),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, BillingError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Api { status, body });
        }
        Ok(response.json().await?)
    }

    pub async fn create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> Result<Customer, BillingError> {
        self.post(
            "/v1/customers",
            &[("email", email), ("metadata[user_id]", user_id)],
        )
        .await
    }

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        user_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, BillingError> {
        self.post(
            "/v1/checkout/sessions",
            &[
                ("customer", customer_id),
                ("mode", "subscription"),
                ("line_items[0][price]", price_id),
                ("line_items[0][quantity]", "1"),
                ("success_url", success_url),
                ("cancel_url", cancel_url),
                ("subscription_data[metadata][user_id]", user_id),
            ],
        )
        .await
    }
}

// ---- webhook events ----

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// `checkout.session.completed` payload, ids only.
#[derive(Debug, Deserialize)]
pub struct CheckoutCompleted {
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// `customer.subscription.*` payloads.
#[derive(Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub current_period_start: i64,
    #[serde(default)]
    pub current_period_end: i64,
}

impl SubscriptionObject {
    pub fn period_start(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.current_period_start, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn period_end(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.current_period_end, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("timestamp outside tolerance")]
    Expired,
    #[error("no matching signature")]
    Mismatch,
}

/// Verify a `Stripe-Signature` header (`t=...,v1=...`) against the raw
/// payload. The HMAC is over `{t}.{payload}`; any of the `v1` entries may
/// match. Must run before the payload is parsed at all.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => {
                if let Some(bytes) = decode_hex(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let age = (now.timestamp() - timestamp).unsigned_abs();
    if age > WEBHOOK_TOLERANCE.as_secs() {
        return Err(SignatureError::Expired);
    }

    for signature in &signatures {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&value[index..index + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let digest = mac.finalize().into_bytes();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("t={timestamp},v1={hex}")
    }

    #[test]
    fn accepts_a_correctly_signed_payload() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let now = Utc::now();
        let header = sign(payload, "whsec_test", now.timestamp());
        assert_eq!(
            verify_webhook_signature(payload, &header, "whsec_test", now),
            Ok(())
        );
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let now = Utc::now();
        let header = sign(payload, "whsec_test", now.timestamp());
        assert_eq!(
            verify_webhook_signature(b"{}", &header, "whsec_test", now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_the_wrong_secret() {
        let payload = b"payload";
        let now = Utc::now();
        let header = sign(payload, "whsec_a", now.timestamp());
        assert_eq!(
            verify_webhook_signature(payload, &header, "whsec_b", now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamps() {
        let payload = b"payload";
        let now = Utc::now();
        let stale = now.timestamp() - 600;
        let header = sign(payload, "whsec_test", stale);
        assert_eq!(
            verify_webhook_signature(payload, &header, "whsec_test", now),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn rejects_headers_without_signatures() {
        let now = Utc::now();
        assert_eq!(
            verify_webhook_signature(b"x", "t=123", "whsec_test", now),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_webhook_signature(b"x", "garbage", "whsec_test", now),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn any_matching_v1_entry_passes() {
        let payload = b"payload";
        let now = Utc::now();
        let good = sign(payload, "whsec_test", now.timestamp());
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={}", now.timestamp(), "00".repeat(32), good_sig);
        assert_eq!(
            verify_webhook_signature(payload, &header, "whsec_test", now),
            Ok(())
        );
    }

    #[test]
    fn subscription_period_timestamps_convert() {
        let object: SubscriptionObject = serde_json::from_value(serde_json::json!({
            "id": "sub_123",
            "customer": "cus_123",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
        }))
        .unwrap();
        assert_eq!(object.period_start().timestamp(), 1_700_000_000);
        assert_eq!(object.period_end().timestamp(), 1_702_592_000);
    }
}
