use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use storefront::config::Config;
use storefront::db::{self, AppState, queries};
use storefront::email::{EmailService, LogMailer, Mailer};
use storefront::handlers;
use storefront::models::Product;
use storefront::payments::{StripeClient, StripeConfig};

#[derive(Parser)]
#[command(name = "storefront", about = "Storefront purchase pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and the notification retry worker (default)
    Serve,
    #[command(subcommand)]
    Products(ProductsCommands),
    #[command(subcommand)]
    Notifications(NotificationsCommands),
}

#[derive(Subcommand)]
enum ProductsCommands {
    /// Import or refresh products from a JSON array exported by the CMS
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum NotificationsCommands {
    /// List purchase emails that ran out of attempts
    Failed,
    /// Run one retry pass over due emails
    Retry,
    /// Send the purchase email of a transaction again
    Resend { transaction_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storefront=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let pool = db::create_pool(&config.database_path)
        .with_context(|| format!("failed to open database at {}", config.database_path))?;
    let state = build_state(&config, pool)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, state).await,
        Commands::Products(ProductsCommands::Import { file }) => import_products(&state, &file),
        Commands::Notifications(command) => handle_notifications(&state, command).await,
    }
}

fn build_state(config: &Config, pool: db::DbPool) -> Result<AppState> {
    let secret_key = match (&config.stripe_secret_key, config.dev_mode) {
        (Some(key), _) => key.clone(),
        (None, true) => {
            tracing::warn!("STRIPE_SECRET_KEY not set, checkout and coupon calls will fail");
            String::new()
        }
        (None, false) => anyhow::bail!("STRIPE_SECRET_KEY must be set outside dev mode"),
    };
    let gateway = Arc::new(StripeClient::new(&StripeConfig {
        secret_key,
        currency: config.currency.clone(),
    })?);

    let mailer: Arc<dyn Mailer> = match (&config.resend_api_key, config.dev_mode) {
        (Some(key), false) => Arc::new(EmailService::new(key.clone(), config.email_from.clone())?),
        _ => {
            tracing::info!("Email delivery disabled, purchase emails are only logged");
            Arc::new(LogMailer)
        }
    };

    Ok(AppState::new(config, pool, gateway, mailer))
}

async fn serve(config: &Config, state: AppState) -> Result<()> {
    let worker = state.orchestrator.dispatcher().clone();
    let interval = Duration::from_secs(config.notification_retry_interval_secs.max(1));
    tokio::spawn(worker.run_worker(interval));

    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("failed to bind {}", config.addr()))?;
    tracing::info!("Storefront listening on {}", config.addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

fn import_products(state: &AppState, file: &Path) -> Result<()> {
    let raw = fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let products: Vec<Product> = serde_json::from_str(&raw).context("invalid product JSON")?;

    let conn = state.db.get()?;
    for product in &products {
        queries::upsert_product(&conn, product)?;
    }
    println!("Imported {} products", products.len());
    Ok(())
}

async fn handle_notifications(state: &AppState, command: NotificationsCommands) -> Result<()> {
    let dispatcher = state.orchestrator.dispatcher();
    match command {
        NotificationsCommands::Failed => {
            let jobs = dispatcher.list_dead()?;
            if jobs.is_empty() {
                println!("No failed purchase emails");
            }
            for job in jobs {
                println!(
                    "{}  attempts={}  error={}",
                    job.transaction_id,
                    job.attempts,
                    job.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        NotificationsCommands::Retry => {
            let summary = dispatcher.run_due().await?;
            println!(
                "sent={} failed={} skipped={}",
                summary.sent, summary.failed, summary.skipped
            );
        }
        NotificationsCommands::Resend { transaction_id } => {
            match dispatcher.resend(&transaction_id).await? {
                Some(message_id) => println!("Sent ({})", message_id),
                None => println!("Already queued for delivery"),
            }
        }
    }
    Ok(())
}
