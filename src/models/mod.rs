mod coupon;
mod notification;
mod product;
mod transaction;

pub use coupon::*;
pub use notification::*;
pub use product::*;
pub use transaction::*;
