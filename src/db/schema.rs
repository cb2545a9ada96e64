pub const SCHEMA: &str = r#"
-- Read-only mirror of CMS products
CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    price TEXT NOT NULL,
    items TEXT NOT NULL DEFAULT '[]',
    category TEXT NOT NULL,
    file_ref TEXT,
    max_downloads INTEGER,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL UNIQUE,
    redemption_code TEXT UNIQUE,
    status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed', 'refunded')),
    amount TEXT NOT NULL,
    stripe_commission TEXT,
    iva TEXT,
    irpf TEXT,
    net_amount TEXT,
    customer_email TEXT NOT NULL,
    customer_name TEXT,
    product_id TEXT NOT NULL,
    payment_method TEXT,
    city TEXT,
    coupon_code TEXT,
    reward_coupon_code TEXT,
    payment_intent_id TEXT,
    newsletter_opt_in INTEGER NOT NULL DEFAULT 0,
    download_count INTEGER NOT NULL DEFAULT 0,
    max_downloads INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK (download_count >= 0 AND download_count <= max_downloads)
);

CREATE INDEX IF NOT EXISTS idx_transactions_payment_intent ON transactions(payment_intent_id);

-- Codes and finalized figures are write-once
CREATE TRIGGER IF NOT EXISTS transactions_code_immutable
BEFORE UPDATE OF redemption_code ON transactions
WHEN OLD.redemption_code IS NOT NULL AND NEW.redemption_code IS NOT OLD.redemption_code
BEGIN
    SELECT RAISE(ABORT, 'redemption_code is immutable');
END;

CREATE TRIGGER IF NOT EXISTS transactions_financials_immutable
BEFORE UPDATE OF amount, stripe_commission, iva, irpf, net_amount ON transactions
WHEN OLD.net_amount IS NOT NULL AND (
    NEW.amount IS NOT OLD.amount
    OR NEW.stripe_commission IS NOT OLD.stripe_commission
    OR NEW.iva IS NOT OLD.iva
    OR NEW.irpf IS NOT OLD.irpf
    OR NEW.net_amount IS NOT OLD.net_amount
)
BEGIN
    SELECT RAISE(ABORT, 'financial figures are immutable once finalized');
END;

CREATE TRIGGER IF NOT EXISTS transactions_created_at_immutable
BEFORE UPDATE OF created_at ON transactions
WHEN NEW.created_at IS NOT OLD.created_at
BEGIN
    SELECT RAISE(ABORT, 'created_at is immutable');
END;

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

-- Purchase email outbox, at most one per transaction
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    transaction_id TEXT NOT NULL UNIQUE REFERENCES transactions(id),
    status TEXT NOT NULL CHECK (status IN ('pending', 'sending', 'sent', 'dead')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    last_error TEXT,
    message_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_due ON notifications(status, next_attempt_at);
"#;
