//! Test support for Superplane.
//!
//! - [`MemoryStore`] and [`MemoryPolicyStore`] keep all state in memory
//! - [`ManualClock`] pins gate evaluation to a chosen instant
//! - [`RecordingExecutor`] records dispatches and replies as told
//! - [`Harness`] wires all of them into a [`superplane::Core`]
//!
//! ```ignore
//! let h = Harness::new().await?;
//! let canvas = h.canvas().await?;
//! let source = h.source(&canvas, "github").await?;
//!
//! let mut spec = stage_spec("build");
//! spec.connections.push(connection("github", SourceType::EventSource));
//! let stage = h.stage(&canvas, spec).await?;
//!
//! h.send(&source, json!({"ref": "main"})).await?;
//! h.settle().await?;
//! assert_eq!(h.executor.requests().len(), 1);
//! ```

mod clock;
mod executor;
mod harness;
mod policy;
mod store;

pub use clock::ManualClock;
pub use executor::{reference_for, RecordingExecutor, RECORDING_EXECUTOR};
pub use harness::{connection, stage_spec, Harness, OWNER};
pub use policy::MemoryPolicyStore;
pub use store::MemoryStore;
