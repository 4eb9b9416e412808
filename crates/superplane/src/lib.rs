//! # Superplane
//!
//! The event-to-execution core of a canvas-based delivery orchestrator.
//! External systems post webhooks into event sources; connections filter and
//! fan those events out into stages; each stage gates admission behind
//! approvals, time windows and tag health; admitted work runs on an external
//! executor, and its completion flows back into the graph as a new event.
//!
//! ## Core Concepts
//!
//! - [`Event`](model::Event) = a fact that arrived at a source
//! - [`StageEvent`](model::StageEvent) = that fact, accepted by one stage
//! - [`Execution`](model::Execution) = a stage event admitted and dispatched
//!
//! All shared state lives behind the [`Store`]. Components never share a
//! mutable graph in memory; they cooperate through the store and wake each
//! other with notifications that the periodic scanners make optional.
//!
//! ## Architecture
//!
//! ```text
//! Webhook ──► Router.receive()
//!                 │  filters, inputs, tags (one transaction)
//!                 ▼
//!             stage events ─────────────┐
//!                 │                     │
//!                 ▼ notify              │
//!         StageMachine.process_stage()  │
//!                 │  gates under the    │
//!                 │  stage lease        │
//!                 ▼                     │
//!         ExecutionTracker.dispatch()   │
//!                 │                     │
//!                 ▼                     │
//!             Executor ── finish() ─────┤
//!                 completion event      │
//!                 + fan-out (one tx) ───┘
//!
//! every transition ──► Hub ──► canvas subscribers
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One active execution per stage** - gate 1, the stage lease, and a
//!    unique index in the store
//! 2. **FIFO per stage** - stage events are admitted oldest first; a held
//!    event holds everything behind it
//! 3. **Atomic fan-out** - an event's stage events, tags and state flip are
//!    one transaction
//! 4. **Completion before downstream** - an execution is finished in the
//!    same transaction that creates its downstream stage events
//! 5. **Deny by default** - access exists only through a granted role
//!
//! ## Example
//!
//! ```ignore
//! use superplane::{CoreBuilder, StageSpec};
//!
//! let core = CoreBuilder::new(store, policy_store, encryptor, b"jwt-secret")
//!     .build()
//!     .await?;
//!
//! let org = core.service.create_organization("acme", "Acme", "user-1").await?;
//! let canvas = core.service.create_canvas(org.id, "delivery", "user-1").await?;
//! let source = core.service.create_event_source(canvas.id, "github").await?;
//! core.service.create_stage(canvas.id, spec, "user-1").await?;
//!
//! let handles = core.start(shutdown.clone())?;
//! ```

pub mod authz;
pub mod clock;
pub mod crypto;
mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod hub;
pub mod inputs;
pub mod machine;
pub mod model;
pub mod resolver;
pub mod router;
pub mod service;
pub mod store;
pub mod tracker;
pub mod workers;

// Re-export error types
pub use error::{Error, ErrorKind, Result};

// Re-export the wiring entry point
pub use engine::{Core, CoreBuilder};

// Re-export component types
pub use authz::interceptor::Interceptor;
pub use authz::{DomainKind, Enforcer, EnforcerConfig, PolicyRule, PolicyStore};
pub use clock::{Clock, SystemClock};
pub use crypto::{AesGcmEncryptor, Encryptor, JwtSigner, NoOpEncryptor};
pub use executor::{Executor, ExecutorConfig, ExecutorRegistry};
pub use expr::Evaluator;
pub use hub::{Hub, HubConfig, HubEvent};
pub use machine::{MachineConfig, StageMachine};
pub use router::Router;
pub use service::{Service, StageSpec};
pub use store::Store;
pub use tracker::{ExecutionTracker, TrackerConfig};
pub use workers::{StageNotifier, WorkerConfig};

// Re-export commonly used external types
pub use async_trait::async_trait;
