//! Tourist Core - tiered persistence and change propagation for map pins
//!
//! This crate keeps a small object graph of pins and their photos durable
//! across restarts, safe to mutate from concurrent lanes, and observable by
//! list views that animate structural changes instead of reloading:
//!
//! - **Entity**: `Pin` and `Photo` values, identified across lanes by `ObjectId`
//! - **Model**: entity description loaded at startup, drives the store schema
//! - **Store**: the SQLite file holding every committed object
//! - **Context**: isolated working copies of the graph, saved tier to tier
//! - **Scheduler**: serialized background mutation followed by a save cascade
//! - **Autosave**: periodic cascade from the main context down to the store
//! - **Query**: fetch requests and live queries over the main context
//! - **Reconciler**: commit batches turned into ordered list operations
//! - **Lifecycle**: host lifecycle transitions mapped onto flush and autosave
//! - **Config**: store location, model override and autosave interval
//!
//! # Architecture
//!
//! ```text
//! Background ──save──▶ Main ──save──▶ Persistent ──commit──▶ model.sqlite
//!  (mutation)        (display reads,     (owns the
//!                     live queries)       connection)
//! ```
//!
//! Each context lives on its own lane, a named thread running posted jobs in
//! order. Contexts hold their graph in an `Arc`; a save publishes a new
//! generation to the parent, and readers keep whatever snapshot they hold.

pub mod autosave;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod graph;
pub mod lane;
pub mod lifecycle;
pub mod model;
pub mod query;
pub mod reconciler;
pub mod scheduler;
pub mod stack;
pub mod store;

pub use autosave::Autosave;
pub use config::{ConfigError, StackConfig};
pub use context::{CommitNotice, Context, Tier};
pub use entity::{Entity, EntityKind, NewPhoto, Object, ObjectId, Photo, Pin, PinId};
pub use error::{ContextError, LaneError, Result, StackError};
pub use graph::{Change, ChangeSet, Graph};
pub use lane::{Lane, LaneHandle};
pub use lifecycle::LifecycleEvent;
pub use model::Model;
pub use query::{diff_results, ChangeBatch, ChangeEvent, FetchRequest, LiveQuery};
pub use reconciler::{
    apply_operations, plan_operations, DiffError, ListView, Outcome, ReconcilerState,
    Reconciler, ReloadReason, StructuralOp, VecListView,
};
pub use scheduler::BatchScheduler;
pub use stack::{MainContext, Stack};
pub use store::SqliteStore;

/// Returns the version of tourist-core
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
