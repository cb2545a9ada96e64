use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{CheckoutRequest, CheckoutSession, PaymentGateway, to_minor_units};
use crate::error::{AppError, Result};
use crate::models::Coupon;

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_URL: &str = "https://api.stripe.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum age of a signed webhook before it is rejected as a replay.
pub const STRIPE_SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Settlement currency for checkout sessions and coupons
    pub currency: String,
}

#[derive(Debug, Deserialize)]
struct CreateCheckoutResponse {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeCouponResponse {
    id: String,
    percent_off: Option<f64>,
    max_redemptions: Option<i64>,
    #[serde(default)]
    times_redeemed: i64,
    #[serde(default)]
    valid: bool,
}

impl From<StripeCouponResponse> for Coupon {
    fn from(c: StripeCouponResponse) -> Self {
        Coupon {
            code: c.id,
            percent_off: c.percent_off.map(|p| p.round() as u32).unwrap_or(0),
            max_redemptions: c.max_redemptions,
            times_redeemed: c.times_redeemed,
            valid: c.valid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
    currency: String,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build Stripe client: {}", e)))?;

        Ok(Self {
            client,
            secret_key: config.secret_key.clone(),
            currency: config.currency.clone(),
        })
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<reqwest::Response> {
        self.client
            .post(format!("{}{}", STRIPE_API_URL, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::Provider(format!("Stripe API error: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let unit_amount = to_minor_units(request.unit_amount)?;

        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("customer_email".into(), request.customer_email.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "line_items[0][price_data][currency]".into(),
                request.currency.clone(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                unit_amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                request.product_title.clone(),
            ),
            ("metadata[product_id]".into(), request.product_id.clone()),
            (
                "metadata[newsletter]".into(),
                request.newsletter_opt_in.to_string(),
            ),
        ];

        if let Some(ref coupon) = request.coupon_code {
            form.push(("discounts[0][coupon]".into(), coupon.clone()));
            form.push(("metadata[coupon_code]".into(), coupon.clone()));
        }

        let response = self.post_form("/checkout/sessions", &form).await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!("Stripe API error: {}", error_text)));
        }

        let session: CreateCheckoutResponse = response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to parse Stripe response: {}", e)))?;

        let url = session
            .url
            .ok_or_else(|| AppError::Provider("Stripe returned a session without a URL".into()))?;

        Ok(CheckoutSession { id: session.id, url })
    }

    async fn create_coupon(&self, code: &str, percent_off: u32) -> Result<Coupon> {
        let form: Vec<(String, String)> = vec![
            ("id".into(), code.to_string()),
            ("percent_off".into(), percent_off.to_string()),
            ("duration".into(), "once".into()),
            ("max_redemptions".into(), "1".into()),
            ("currency".into(), self.currency.clone()),
        ];

        let response = self.post_form("/coupons", &form).await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!(
                "Stripe coupon creation failed ({}): {}",
                status, error_text
            )));
        }

        let coupon: StripeCouponResponse = response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to parse Stripe coupon: {}", e)))?;

        Ok(coupon.into())
    }

    async fn retrieve_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        let response = self
            .client
            .get(format!(
                "{}/coupons/{}",
                STRIPE_API_URL,
                urlencoding::encode(code)
            ))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| AppError::Provider(format!("Stripe API error: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!(
                "Stripe coupon lookup failed ({}): {}",
                status, error_text
            )));
        }

        let coupon: StripeCouponResponse = response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to parse Stripe coupon: {}", e)))?;

        Ok(Some(coupon.into()))
    }
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>]`) against
/// the raw request body.
///
/// Returns `Ok(false)` for a wrong signature or a timestamp outside the
/// tolerance window, `Err` only for an unusable secret.
pub fn verify_stripe_signature(
    webhook_secret: &str,
    payload: &[u8],
    header: &str,
    now: i64,
) -> Result<bool> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return Ok(false);
    };
    if signatures.is_empty() {
        return Ok(false);
    }

    let Ok(ts) = timestamp.parse::<i64>() else {
        return Ok(false);
    };
    if (now - ts).abs() > STRIPE_SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = ts, "Stripe webhook timestamp outside tolerance");
        return Ok(false);
    }

    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| AppError::Internal("Invalid webhook secret".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    Ok(signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes()))))
}

/// Verify a plain hex HMAC-SHA256 of the body (generic provider callbacks).
pub fn verify_hmac_signature(secret: &str, payload: &[u8], signature: &str) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal("Invalid webhook secret".into()))?;
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    Ok(bool::from(
        expected.as_bytes().ct_eq(signature.trim().to_lowercase().as_bytes()),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StripeWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_status: String,
    pub amount_total: Option<i64>,
    pub payment_intent: Option<String>,
    pub customer_email: Option<String>,
    pub customer_details: Option<StripeCustomerDetails>,
    #[serde(default)]
    pub metadata: StripeSessionMetadata,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StripeCustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
    pub address: Option<StripeAddress>,
}

#[derive(Debug, Deserialize)]
pub struct StripeAddress {
    pub city: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StripeSessionMetadata {
    pub product_id: Option<String>,
    pub coupon_code: Option<String>,
    pub newsletter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StripeCharge {
    pub id: String,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub refunded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_stripe_valid_signature() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(payload, 1_700_000_000);
        assert!(verify_stripe_signature(SECRET, payload, &header, 1_700_000_010).unwrap());
    }

    #[test]
    fn test_stripe_modified_payload() {
        let header = sign(b"{\"amount_total\":1475}", 1_700_000_000);
        assert!(
            !verify_stripe_signature(SECRET, b"{\"amount_total\":1}", &header, 1_700_000_000)
                .unwrap()
        );
    }

    #[test]
    fn test_stripe_old_timestamp_fails_verification() {
        let payload = b"{}";
        let header = sign(payload, 1_700_000_000);
        assert!(!verify_stripe_signature(SECRET, payload, &header, 1_700_000_000 + 600).unwrap());
    }

    #[test]
    fn test_stripe_malformed_header() {
        assert!(!verify_stripe_signature(SECRET, b"{}", "garbage", 1_700_000_000).unwrap());
        assert!(!verify_stripe_signature(SECRET, b"{}", "t=1700000000", 1_700_000_000).unwrap());
        assert!(!verify_stripe_signature(SECRET, b"{}", "v1=abcd", 1_700_000_000).unwrap());
    }

    #[test]
    fn test_hmac_signature() {
        let payload = br#"{"session_id":"cs_1"}"#;
        let mut mac = HmacSha256::new_from_slice(b"callback-secret").unwrap();
        mac.update(payload);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_hmac_signature("callback-secret", payload, &signature).unwrap());
        assert!(!verify_hmac_signature("other-secret", payload, &signature).unwrap());
    }

    #[test]
    fn test_coupon_response_conversion() {
        let raw = serde_json::json!({
            "id": "GRACIAS20",
            "percent_off": 20.0,
            "max_redemptions": 1,
            "times_redeemed": 0,
            "valid": true,
            "duration": "once"
        });
        let parsed: StripeCouponResponse = serde_json::from_value(raw).unwrap();
        let coupon: Coupon = parsed.into();
        assert_eq!(coupon.code, "GRACIAS20");
        assert_eq!(coupon.percent_off, 20);
        assert!(coupon.is_redeemable());
    }
}
