//! Row mapping for the query layer.

use std::str::FromStr;

use rusqlite::{Connection, Params, Row, types::Type};

use crate::error::Result;
use crate::models::*;

pub const TRANSACTION_COLS: &str = "id, session_id, redemption_code, status, amount, stripe_commission, iva, irpf, net_amount, customer_email, customer_name, product_id, payment_method, city, coupon_code, reward_coupon_code, payment_intent_id, newsletter_opt_in, download_count, max_downloads, created_at, updated_at";

pub const PRODUCT_COLS: &str = "id, title, price, items, category, file_ref, max_downloads";

pub const NOTIFICATION_COLS: &str =
    "id, transaction_id, status, attempts, next_attempt_at, last_error, message_id, created_at, updated_at";

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Read a TEXT column and parse it (statuses, decimal amounts).
fn parse_text<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_opt_text<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

impl FromRow for Transaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Transaction {
            id: row.get(0)?,
            session_id: row.get(1)?,
            redemption_code: row.get(2)?,
            status: parse_text(row, 3)?,
            amount: parse_text(row, 4)?,
            stripe_commission: parse_opt_text(row, 5)?,
            iva: parse_opt_text(row, 6)?,
            irpf: parse_opt_text(row, 7)?,
            net_amount: parse_opt_text(row, 8)?,
            customer_email: row.get(9)?,
            customer_name: row.get(10)?,
            product_id: row.get(11)?,
            payment_method: row.get(12)?,
            city: row.get(13)?,
            coupon_code: row.get(14)?,
            reward_coupon_code: row.get(15)?,
            payment_intent_id: row.get(16)?,
            newsletter_opt_in: row.get::<_, i32>(17)? != 0,
            download_count: row.get(18)?,
            max_downloads: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }
}

impl FromRow for Product {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let items: String = row.get(3)?;
        Ok(Product {
            id: row.get(0)?,
            title: row.get(1)?,
            price: parse_text(row, 2)?,
            items: serde_json::from_str(&items).map_err(|e| conversion_error(3, e))?,
            category: row.get(4)?,
            file: row.get::<_, Option<String>>(5)?.map(AssetRef),
            max_downloads: row.get(6)?,
        })
    }
}

impl FromRow for NotificationJob {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(NotificationJob {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            status: parse_text(row, 2)?,
            attempts: row.get(3)?,
            next_attempt_at: row.get(4)?,
            last_error: row.get(5)?,
            message_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

pub fn query_one<T: FromRow, P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(T::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn query_all<T: FromRow, P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| T::from_row(row))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
