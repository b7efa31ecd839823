//! strand-runtime - service orchestration for the strand store
//!
//! This crate gives every registered service an isolated execution
//! context: one dedicated thread driving a current-thread scheduler, a
//! hierarchical cancel token, and a cleanup registry that makes teardown
//! deterministic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ServiceRuntime                         │
//! │            (owns the Store and every service)                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   ┌────────────────────┐      ┌────────────────────┐         │
//! │   │  Service "ingest"  │      │  Service "export"  │  ...    │
//! │   │  ┌──────────────┐  │      │  ┌──────────────┐  │         │
//! │   │  │  scheduler   │  │      │  │  scheduler   │  │         │
//! │   │  │  (own thread)│  │      │  │  (own thread)│  │         │
//! │   │  └──────┬───────┘  │      │  └──────┬───────┘  │         │
//! │   │  cancel │ cleanup  │      │  cancel │ cleanup  │         │
//! │   └─────────┼──────────┘      └─────────┼──────────┘         │
//! │             │     dispatch / subscribe  │                    │
//! │             ▼                           ▼                    │
//! │   ┌──────────────────────────────────────────────┐           │
//! │   │                    Store                     │           │
//! │   └──────────────────────────────────────────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Service contexts
//!
//! A service registers through [`ServiceRuntime::register_service`]; its
//! `init` runs on the service's own thread and must return promptly after
//! registering reducers/subscriptions and scheduling background work.
//! Cross-service communication is always an action dispatch or a
//! subscription, never a direct call.
//!
//! ## One scheduler per service
//!
//! Autorun callbacks, event handlers, and background tasks all run on the
//! owning service's queue. [`ServiceContext::spawn`] is the only way for
//! service code to start work, so there is no wrong scheduler to reach
//! for, and a stalled service affects nobody else.
//!
//! ## Deterministic teardown
//!
//! [`RuntimeHandle::stop`] cancels the service's tasks through its token
//! tree, releases its subscriptions and handlers, waits for in-flight
//! callbacks, and is idempotent. The lifecycle is
//! `Unregistered → Initializing → Running → Stopping → Stopped`.

// Modules
pub mod cancel;
pub mod cleanup;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod service;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use cleanup::CleanupRegistry;
pub use error::{RuntimeError, ServiceError, TaskFault};
pub use runtime::{RuntimeConfig, RuntimeHandle, RuntimeStats, ServiceRuntime};
pub use scheduler::{SchedulerHandle, TaskInfo, TaskStatus};
pub use service::{Dispatcher, Service, ServiceContext, ServiceDescriptor, ServiceState};
