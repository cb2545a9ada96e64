pub mod codes;
pub mod config;
pub mod coupons;
pub mod db;
pub mod email;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod payments;
pub mod pipeline;
pub mod split;
pub mod util;
