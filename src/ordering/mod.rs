//! Dense sibling ordering
//!
//! - `ledger` - pure position planning (insert, delete, move, bulk reorder)
//! - `store` - the store seam the plans are applied through
//! - `service` - one transaction per operation, plus event emission

pub mod ledger;
pub mod service;
pub mod store;

pub use ledger::{InsertPlan, PositionUpdate, Sibling};
pub use service::OrderingService;
pub use store::{SiblingPayload, SiblingScope, SiblingStore, SiblingTx};
