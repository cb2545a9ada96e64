pub mod from_row;
pub mod queries;
mod schema;

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::codes::CodeGenerator;
use crate::config::Config;
use crate::coupons::CouponManager;
use crate::email::Mailer;
use crate::error::Result;
use crate::models::{AssetResolver, BaseUrlResolver};
use crate::notify::{Dispatcher, RetryPolicy};
use crate::payments::PaymentGateway;
use crate::pipeline::Orchestrator;

pub type DbPool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub base_url: String,
    pub currency: String,
    pub default_max_downloads: i32,
    /// `None` rejects Stripe webhooks
    pub stripe_webhook_secret: Option<String>,
    /// `None` disables the generic signed callback endpoint
    pub callback_secret: Option<String>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub coupons: CouponManager,
    pub assets: Arc<dyn AssetResolver>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Wire the pipeline together from configuration and the two outbound seams.
    pub fn new(
        config: &Config,
        db: DbPool,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let coupons = CouponManager::new(gateway.clone());
        let dispatcher = Dispatcher::new(
            db.clone(),
            mailer,
            coupons.clone(),
            config.base_url.clone(),
            config.reward_percent(),
            RetryPolicy {
                max_attempts: config.notification_max_attempts.max(1),
                base_delay_secs: config.notification_retry_interval_secs as i64,
                ..RetryPolicy::default()
            },
        );
        let orchestrator = Orchestrator::new(
            db.clone(),
            CodeGenerator::new(config.code_namespace.clone()),
            dispatcher,
            config.default_max_downloads,
        );

        Self {
            db,
            base_url: config.base_url.clone(),
            currency: config.currency.clone(),
            default_max_downloads: config.default_max_downloads,
            stripe_webhook_secret: config.stripe_webhook_secret.clone(),
            callback_secret: config.callback_secret.clone(),
            gateway,
            coupons,
            assets: Arc::new(BaseUrlResolver::new(config.asset_base_url.clone())),
            orchestrator,
        }
    }
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(schema::SCHEMA)?;
    Ok(())
}

/// Open a file-backed pool. WAL plus a busy timeout lets concurrent webhook
/// deliveries queue on the write lock instead of failing.
pub fn create_pool(path: &str) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    init_db(&conn)?;

    Ok(pool)
}
