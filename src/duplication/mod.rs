//! Deep copy of curriculum hierarchies
//!
//! - `schema` - node kinds, relations and the depth ceiling
//! - `planner` - unrolls the schema into ordered copy levels
//! - `identifier_map` - source id to duplicate id, per kind
//! - `store` - the transactional store seam
//! - `executor` - runs one duplication inside one transaction

pub mod executor;
pub mod identifier_map;
pub mod planner;
pub mod schema;
pub mod store;

pub use executor::{DuplicationExecutor, DuplicationOutcome, DuplicationRequest};
pub use identifier_map::IdentifierMap;
pub use planner::{plan, DepthGuard, DuplicationPlan, PlanLevel};
pub use schema::{AttachmentField, HierarchySchema, NodeKind, Relation, DEFAULT_MAX_DEPTH, TOP_BLOCK_DEPTH};
pub use store::{HierarchyStore, HierarchyTx, NewAttachmentCopy, NodeSelector, SourceNode};
