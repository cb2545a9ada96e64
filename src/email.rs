//! Purchase confirmation email.
//!
//! Two mailers:
//! 1. `EmailService` sends via the Resend API
//! 2. `LogMailer` logs the message and sends nothing (dev mode, no API key)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Upper bound on one Resend call. Must stay below the outbox stale-claim
/// window or a hung send gets dispatched twice.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the receipt email shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub redemption_code: String,
    pub product_title: String,
    /// Discount for the next purchase, if one was issued
    pub coupon_code: Option<String>,
    pub subscribe_newsletter: bool,
    pub download_url: String,
    pub max_downloads: i32,
}

/// Sends exactly one email per call and reports the provider's message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_purchase_email(&self, email: &PurchaseEmail) -> Result<String>;
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn greeting(email: &PurchaseEmail) -> String {
    match email.to_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => format!("Hola {},", name),
        _ => "Hola,".to_string(),
    }
}

pub fn render_subject(email: &PurchaseEmail) -> String {
    format!("Tu compra: {}", email.product_title)
}

pub fn render_text(email: &PurchaseEmail) -> String {
    let mut text = format!(
        "{}\n\nGracias por comprar {}.\n\nCódigo de canje: {}\n\nDescarga: {}\nPuedes descargarlo hasta {} veces.\n",
        greeting(email),
        email.product_title,
        email.redemption_code,
        email.download_url,
        email.max_downloads
    );

    if let Some(ref coupon) = email.coupon_code {
        text.push_str(&format!(
            "\nTu cupón para la próxima compra: {} (un solo uso).\n",
            coupon
        ));
    }

    if email.subscribe_newsletter {
        text.push_str("\nTe has suscrito a nuestra newsletter. Puedes darte de baja en cualquier momento desde cualquier envío.\n");
    }

    text.push_str("\nGuarda este correo: el código identifica tu compra si necesitas ayuda.");
    text
}

pub fn render_html(email: &PurchaseEmail) -> String {
    let coupon_block = email
        .coupon_code
        .as_deref()
        .map(|coupon| {
            format!(
                r#"<p>Tu cupón para la próxima compra: <strong>{}</strong> <span style="color: #666; font-size: 14px;">(un solo uso)</span></p>"#,
                escape_html(coupon)
            )
        })
        .unwrap_or_default();

    let newsletter_block = if email.subscribe_newsletter {
        r#"<p style="color: #666;">Te has suscrito a nuestra newsletter. Puedes darte de baja en cualquier momento desde cualquier envío.</p>"#
    } else {
        ""
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
<p>{}</p>
<h2 style="color: #333;">Gracias por comprar {}</h2>
<div style="background: #f5f5f5; padding: 20px; border-radius: 8px; text-align: center;">
<code style="font-size: 24px; font-weight: bold; letter-spacing: 2px; color: #333;">{}</code>
</div>
<p><a href="{}">Descargar</a> (hasta {} descargas)</p>
{}
{}
<hr style="border: none; border-top: 1px solid #eee; margin: 30px 0;">
<p style="color: #999; font-size: 12px;">Guarda este correo: el código identifica tu compra si necesitas ayuda.</p>
</body>
</html>"#,
        escape_html(&greeting(email)),
        escape_html(&email.product_title),
        escape_html(&email.redemption_code),
        escape_html(&email.download_url),
        email.max_downloads,
        coupon_block,
        newsletter_block
    )
}

/// Resend API request body.
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
    html: String,
}

/// Resend API response.
#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Email service using the Resend API.
#[derive(Clone)]
pub struct EmailService {
    api_key: String,
    from_email: String,
    http_client: Client,
}

impl EmailService {
    pub fn new(api_key: String, from_email: String) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build email client: {}", e)))?;

        Ok(Self {
            api_key,
            from_email,
            http_client,
        })
    }
}

#[async_trait]
impl Mailer for EmailService {
    async fn send_purchase_email(&self, email: &PurchaseEmail) -> Result<String> {
        let request = ResendEmailRequest {
            from: &self.from_email,
            to: vec![email.to_email.as_str()],
            subject: render_subject(email),
            text: render_text(email),
            html: render_html(email),
        };

        let response = self
            .http_client
            .post(RESEND_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send request to Resend API");
                AppError::Notification(format!("Email service error: {}", e))
            })?;

        if response.status().is_success() {
            let result: ResendEmailResponse = response.json().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to parse Resend API response");
                AppError::Notification("Email service response error".into())
            })?;

            tracing::info!(
                to = %email.to_email,
                code = %email.redemption_code,
                message_id = %result.id,
                "Purchase email sent via Resend"
            );
            Ok(result.id)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Resend API returned error");
            Err(AppError::Notification(format!(
                "Email service error: {} - {}",
                status, body
            )))
        }
    }
}

/// Logs purchase emails instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_purchase_email(&self, email: &PurchaseEmail) -> Result<String> {
        let message_id = format!("log-{}", uuid::Uuid::new_v4());
        tracing::info!(
            to = %email.to_email,
            code = %email.redemption_code,
            download_url = %email.download_url,
            coupon = ?email.coupon_code,
            message_id = %message_id,
            "Email delivery disabled, purchase email logged only"
        );
        Ok(message_id)
    }
}
