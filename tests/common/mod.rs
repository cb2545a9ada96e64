//! Shared fixtures: in-memory database, fake payment provider, recording mailer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use rust_decimal::Decimal;
use sha2::Sha256;

pub use axum::{
    body::Body,
    http::{Request, StatusCode},
};
pub use rust_decimal_macros::dec;
pub use tower::ServiceExt;

pub use storefront::config::Config;
pub use storefront::db::{AppState, DbPool, init_db, queries};
pub use storefront::email::{Mailer, PurchaseEmail};
pub use storefront::error::{AppError, Result};
pub use storefront::models::*;
pub use storefront::payments::{CheckoutRequest, CheckoutSession, PaymentGateway};
pub use storefront::pipeline::{CheckoutCallback, CompletionOutcome, NotificationOutcome};

type HmacSha256 = Hmac<Sha256>;

pub const PRODUCT_ID: &str = "recetario-navidad";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test123secret456";
pub const CALLBACK_SECRET: &str = "callback-secret";
pub const BASE_URL: &str = "https://shop.example.com";
pub const ASSET_BASE_URL: &str = "https://cdn.example.com/files";

// ============ Fakes ============

/// Payment provider double with an in-memory coupon registry.
#[derive(Default)]
pub struct FakeGateway {
    pub coupons: Mutex<HashMap<String, Coupon>>,
    pub checkout_requests: Mutex<Vec<CheckoutRequest>>,
    pub sessions_created: AtomicUsize,
    /// Coupon endpoints return provider errors
    pub coupons_down: AtomicBool,
    /// Checkout session creation returns provider errors
    pub checkout_down: AtomicBool,
}

impl FakeGateway {
    pub fn add_coupon(&self, code: &str, percent_off: u32, times_redeemed: i64) {
        self.coupons.lock().unwrap().insert(
            code.to_string(),
            Coupon {
                code: code.to_string(),
                percent_off,
                max_redemptions: Some(1),
                times_redeemed,
                valid: true,
            },
        );
    }

    pub fn coupon(&self, code: &str) -> Option<Coupon> {
        self.coupons.lock().unwrap().get(code).cloned()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        if self.checkout_down.load(Ordering::SeqCst) {
            return Err(AppError::Provider("checkout unavailable".into()));
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        self.checkout_requests.lock().unwrap().push(request.clone());
        Ok(CheckoutSession {
            id: format!("cs_test_{}", n),
            url: format!("https://checkout.example.com/pay/cs_test_{}", n),
        })
    }

    async fn create_coupon(&self, code: &str, percent_off: u32) -> Result<Coupon> {
        if self.coupons_down.load(Ordering::SeqCst) {
            return Err(AppError::Provider("coupons unavailable".into()));
        }
        let mut coupons = self.coupons.lock().unwrap();
        if coupons.contains_key(code) {
            return Err(AppError::Provider(format!("coupon {} already exists", code)));
        }
        let coupon = Coupon {
            code: code.to_string(),
            percent_off,
            max_redemptions: Some(1),
            times_redeemed: 0,
            valid: true,
        };
        coupons.insert(code.to_string(), coupon.clone());
        Ok(coupon)
    }

    async fn retrieve_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        if self.coupons_down.load(Ordering::SeqCst) {
            return Err(AppError::Provider("coupons unavailable".into()));
        }
        Ok(self.coupon(code))
    }
}

/// Mailer that keeps every email it was asked to send.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<PurchaseEmail>>,
    pub fail: AtomicBool,
}

impl RecordingMailer {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<PurchaseEmail> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_purchase_email(&self, email: &PurchaseEmail) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Notification("mail server unavailable".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(format!("msg_{}", sent.len()))
    }
}

// ============ State ============

pub struct TestContext {
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub mailer: Arc<RecordingMailer>,
}

impl TestContext {
    pub fn app(&self) -> axum::Router {
        storefront::handlers::router(self.state.clone())
    }
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 3000,
        database_path: ":memory:".into(),
        base_url: BASE_URL.into(),
        dev_mode: true,
        stripe_secret_key: None,
        stripe_webhook_secret: Some(STRIPE_WEBHOOK_SECRET.into()),
        callback_secret: Some(CALLBACK_SECRET.into()),
        currency: "eur".into(),
        code_namespace: "SHOP".into(),
        default_max_downloads: 5,
        reward_coupon_percent: storefront::coupons::DEFAULT_PERCENT_OFF,
        resend_api_key: None,
        email_from: "Tienda <tienda@example.com>".into(),
        asset_base_url: ASSET_BASE_URL.into(),
        notification_max_attempts: 3,
        notification_retry_interval_secs: 60,
    }
}

/// Single-connection in-memory pool; every checkout sees the same database.
pub fn create_test_pool() -> DbPool {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder().max_size(1).build(manager).unwrap();
    init_db(&pool.get().unwrap()).unwrap();
    pool
}

pub fn create_test_context_with(config: Config, db: DbPool) -> TestContext {
    let gateway = Arc::new(FakeGateway::default());
    let mailer = Arc::new(RecordingMailer::default());
    let state = AppState::new(&config, db, gateway.clone(), mailer.clone());
    TestContext {
        state,
        gateway,
        mailer,
    }
}

/// Fresh context with the test product already imported.
pub fn create_test_context() -> TestContext {
    let ctx = create_test_context_with(test_config(), create_test_pool());
    {
        let conn = ctx.state.db.get().unwrap();
        create_test_product(&conn, PRODUCT_ID, dec!(14.75));
    }
    ctx
}

// ============ Data ============

pub fn create_test_product(conn: &Connection, id: &str, price: Decimal) -> Product {
    let product = Product {
        id: id.to_string(),
        title: "Recetario de Navidad".to_string(),
        price,
        items: vec!["PDF".to_string(), "EPUB".to_string()],
        category: "recetarios".to_string(),
        file: Some(AssetRef(format!("{}.pdf", id))),
        max_downloads: None,
    };
    queries::upsert_product(conn, &product).unwrap();
    product
}

pub fn callback(session_id: &str, status: TransactionStatus, amount: Decimal) -> CheckoutCallback {
    CheckoutCallback {
        session_id: session_id.to_string(),
        status,
        gross_amount: amount,
        customer_email: "ana@example.com".to_string(),
        customer_name: Some("Ana García".to_string()),
        product_id: PRODUCT_ID.to_string(),
        payment_method: Some("card".to_string()),
        city: Some("Sevilla".to_string()),
        coupon_code: None,
        payment_intent_id: Some(format!("pi_{}", session_id)),
        subscribe_newsletter: true,
    }
}

pub fn create_pending(conn: &Connection, session_id: &str, max_downloads: i32) -> Transaction {
    let (transaction, _) = queries::create_transaction(
        conn,
        &CreateTransaction {
            session_id: session_id.to_string(),
            amount: dec!(14.75),
            customer_email: "ana@example.com".to_string(),
            customer_name: None,
            product_id: PRODUCT_ID.to_string(),
            payment_method: None,
            city: None,
            coupon_code: None,
            newsletter_opt_in: false,
            max_downloads,
        },
    )
    .unwrap();
    transaction
}

pub fn get_transaction(state: &AppState, session_id: &str) -> Transaction {
    let conn = state.db.get().unwrap();
    queries::get_transaction_by_session_id(&conn, session_id)
        .unwrap()
        .expect("transaction should exist")
}

pub fn get_notification(state: &AppState, transaction_id: &str) -> Option<NotificationJob> {
    let conn = state.db.get().unwrap();
    queries::get_notification_for_transaction(&conn, transaction_id).unwrap()
}

/// Pull a rescheduled notification into the past so the next pass picks it up.
pub fn make_notification_due(state: &AppState, transaction_id: &str) {
    let conn = state.db.get().unwrap();
    conn.execute(
        "UPDATE notifications SET next_attempt_at = 0 WHERE transaction_id = ?1",
        [transaction_id],
    )
    .unwrap();
}

pub fn count_rows(state: &AppState, table: &str) -> i64 {
    let conn = state.db.get().unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

// ============ Signatures ============

pub fn hmac_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub fn stripe_signature_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

pub async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
