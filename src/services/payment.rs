//! Payment-provider collaborator: charge/refund calls and webhook
//! signature verification
//!
//! The HTTP surface is a Stripe-shaped form-encoded API authenticated with a
//! bearer key. Webhook signatures are the `t=...,v1=...` HMAC-SHA256 scheme;
//! verification compares in constant time and rejects stale timestamps.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use crate::config::PaymentConfig;
use crate::services::sign::uri_encode;

type HmacSha256 = Hmac<Sha256>;

/// How far a webhook timestamp may lag before it is rejected as a replay
const SIGNATURE_TOLERANCE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment API returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unparseable payment API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}

impl From<hyper_util::client::legacy::Error> for PaymentError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PaymentError::Transport(err.to_string())
    }
}

impl From<hyper::http::Error> for PaymentError {
    fn from(err: hyper::http::Error) -> Self {
        PaymentError::Transport(err.to_string())
    }
}

/// Why a webhook signature was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,

    #[error("webhook timestamp outside tolerance")]
    Stale,

    #[error("signature does not match payload")]
    Mismatch,
}

/// Payment intent as returned by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: u64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundResult {
    pub id: String,
    pub amount: u64,
    pub status: String,
}

/// Parsed, signature-verified webhook delivery
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// Verifies `t=...,v1=...` webhook signature headers
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance: SIGNATURE_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verify `signature_header` over `payload` and decode the event
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent, SignatureError> {
        self.verify_at(payload, signature_header, Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now_unix: i64,
    ) -> Result<WebhookEvent, SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(value.parse().map_err(|_| SignatureError::Malformed)?);
                }
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed);
        }

        if (now_unix - timestamp).unsigned_abs() > self.tolerance.as_secs() {
            return Err(SignatureError::Stale);
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        // Mac::verify_slice is constant time. Any one matching v1 entry
        // passes, since providers send multiple during secret rotation.
        let verified = signatures.iter().any(|sig| {
            hex::decode(sig)
                .ok()
                .map(|raw| mac.clone().verify_slice(&raw).is_ok())
                .unwrap_or(false)
        });
        if !verified {
            return Err(SignatureError::Mismatch);
        }

        serde_json::from_slice(payload).map_err(|_| SignatureError::Malformed)
    }
}

/// Payment operations the rest of the system depends on
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a payment intent for `amount` in the smallest currency unit
    async fn create_intent(
        &self,
        amount: u64,
        currency: Option<&str>,
        metadata: &[(&str, &str)],
    ) -> Result<PaymentIntent, PaymentError>;

    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError>;

    /// Refund an intent, fully when `amount` is `None`
    async fn refund(&self, intent_id: &str, amount: Option<u64>)
        -> Result<RefundResult, PaymentError>;
}

/// [`PaymentProvider`] over the provider's HTTPS API
#[derive(Clone)]
pub struct HttpPaymentProvider {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    api_base: String,
    api_key: String,
    currency: String,
    refund_reason: String,
    timeout: Duration,
}

impl HttpPaymentProvider {
    pub fn new(config: &PaymentConfig) -> Result<Self, PaymentError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));

        let tls = native_tls::TlsConnector::new()?;
        let https = HttpsConnector::from((http, tls.into()));
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            currency: config.currency.clone(),
            refund_reason: config.refund_reason.clone(),
            timeout: Duration::from_secs(30),
        })
    }

    async fn post_form<T>(&self, path: &str, form: &[(String, String)]) -> Result<T, PaymentError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
            .collect::<Vec<_>>()
            .join("&");

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.api_base, path))
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body)))?;

        self.dispatch(request).await
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, PaymentError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}{}", self.api_base, path))
            .header("authorization", format!("Bearer {}", self.api_key))
            .body(Full::new(Bytes::new()))?;

        self.dispatch(request).await
    }

    async fn dispatch<T>(&self, request: Request<Full<Bytes>>) -> Result<T, PaymentError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| PaymentError::Transport("request timed out".to_string()))??;

        let status = response.status();
        let bytes = response
            .collect()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(PaymentError::Api {
                status,
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_intent(
        &self,
        amount: u64,
        currency: Option<&str>,
        metadata: &[(&str, &str)],
    ) -> Result<PaymentIntent, PaymentError> {
        let mut form = vec![
            ("amount".to_string(), amount.to_string()),
            (
                "currency".to_string(),
                currency.unwrap_or(&self.currency).to_string(),
            ),
        ];
        for (key, value) in metadata {
            form.push((format!("metadata[{}]", key), value.to_string()));
        }

        let intent: PaymentIntent = self.post_form("/v1/payment_intents", &form).await?;
        tracing::info!(intent = %intent.id, amount, "payment intent created");
        Ok(intent)
    }

    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError> {
        self.get_json(&format!("/v1/payment_intents/{}", uri_encode(id, true)))
            .await
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount: Option<u64>,
    ) -> Result<RefundResult, PaymentError> {
        let mut form = vec![
            ("payment_intent".to_string(), intent_id.to_string()),
            ("reason".to_string(), self.refund_reason.clone()),
        ];
        if let Some(amount) = amount {
            form.push(("amount".to_string(), amount.to_string()));
        }

        let refund: RefundResult = self.post_form("/v1/refunds", &form).await?;
        tracing::info!(refund = %refund.id, intent = intent_id, "refund issued");
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_decodes_event() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = sign(PAYLOAD, 1_700_000_000);
        let event = verifier.verify_at(PAYLOAD, &header, 1_700_000_010).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.kind, "payment_intent.succeeded");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = sign(PAYLOAD, 1_700_000_000);
        let tampered = br#"{"id":"evt_2","type":"x","data":{}}"#;
        assert_eq!(
            verifier.verify_at(tampered, &header, 1_700_000_010),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = sign(PAYLOAD, 1_700_000_000);
        assert_eq!(
            verifier.verify_at(PAYLOAD, &header, 1_700_001_000),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn missing_parts_are_malformed() {
        let verifier = WebhookVerifier::new(SECRET);
        assert_eq!(
            verifier.verify_at(PAYLOAD, "v1=deadbeef", 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verifier.verify_at(PAYLOAD, "t=100", 100),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verifier.verify_at(PAYLOAD, "garbage", 0),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn any_rotated_signature_passes() {
        let verifier = WebhookVerifier::new(SECRET);
        let good = sign(PAYLOAD, 1_700_000_000);
        let v1 = good.split("v1=").nth(1).unwrap();
        let header = format!("t=1700000000,v1={},v1={}", "ab".repeat(32), v1);
        assert!(verifier.verify_at(PAYLOAD, &header, 1_700_000_010).is_ok());
    }
}
