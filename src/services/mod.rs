//! Business services. Each mutating operation runs in one transaction that
//! starts by locking the order row.

pub mod exceptions;
pub mod order_changes;
pub mod order_status;
pub mod orders;
pub mod reconciliation;
