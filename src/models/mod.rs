//! Data models for reference holdings, snapshots, changes, and orders.

mod change;
mod order;
mod record;

pub use change::{Change, ChangeKind};
pub use order::{LiveOrder, OrderIntent, OrderSide, OrderStatus, Urgency};
pub use record::{symbol_for, Market, PositionRecord, Snapshot};
