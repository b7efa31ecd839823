//! strand-core - reactive state store for the strand runtime
//!
//! This crate provides the central immutable state store: a tree of named
//! slices driven by actions, a reactive autorun engine, and an event bus.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Store                             │
//! │  (dispatch serialization + publication + fan-out)          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │   Action ──► ReducerRegistry ──► StateTree (immutable)     │
//! │                   │                    │                   │
//! │                   │ events             │ commits           │
//! │                   ▼                    ▼                   │
//! │               EventBus          AutorunEngine              │
//! │                   │                    │                   │
//! │                   ▼                    ▼                   │
//! │              handlers            subscriptions             │
//! │          (owner's scheduler)  (owner's scheduler)          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## The state tree
//!
//! An ordered mapping from slice name to slice state. Trees are immutable
//! once published: every commit builds a new tree that shares unchanged
//! slices, so readers never lock.
//!
//! ## Actions and reducers
//!
//! Each slice has one pure reducer over its closed action enum. Reducers
//! are composed by routing: an action targets one slice by default, or
//! several when explicitly declared cross-cutting. A reducer panic fails
//! that dispatch and leaves the tree untouched.
//!
//! ## Autorun subscriptions
//!
//! A subscription pairs a selector with a callback. After each commit the
//! selector is re-evaluated and the callback fires only when the selected
//! value changed (structural equality by default). Callbacks owned by a
//! service run on that service's scheduler, never inline with dispatch.
//!
//! ## Events
//!
//! Reducers may emit events as a side product of a dispatch. Events never
//! mutate state; the bus delivers them to every handler registered for
//! their kind.
//!
//! # Example
//!
//! ```rust
//! use strand_core::{Action, Reduction, ReduceResult, SliceReducer, Store};
//! use strand_core::error::ReduceError;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Counter { value: i64 }
//!
//! #[derive(Debug)]
//! enum CounterAction { Init, Increment }
//!
//! struct CounterReducer;
//!
//! impl SliceReducer for CounterReducer {
//!     type State = Counter;
//!     type Action = CounterAction;
//!
//!     fn reduce(&self, state: Option<&Counter>, action: &CounterAction) -> ReduceResult<Counter> {
//!         match (state, action) {
//!             (None, CounterAction::Init) => Ok(Reduction::new(Counter { value: 0 })),
//!             (None, _) => Err(ReduceError::RequiresState),
//!             (Some(s), CounterAction::Init) => Ok(Reduction::new(s.clone())),
//!             (Some(s), CounterAction::Increment) => {
//!                 Ok(Reduction::new(Counter { value: s.value + 1 }))
//!             }
//!         }
//!     }
//! }
//!
//! let store = Store::new();
//! store.register_reducer("counter", CounterReducer).unwrap();
//! store.dispatch(Action::new("counter", CounterAction::Init)).unwrap();
//! let commit = store.dispatch(Action::new("counter", CounterAction::Increment)).unwrap();
//! assert!(commit.changed);
//! ```

// Modules
pub mod action;
pub mod autorun;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod reducer;
pub mod selector;
pub mod snapshot;
pub mod state;
pub mod store;

// Re-exports for convenience
pub use action::{Action, ActionRoute, Event};
pub use autorun::{CallbackExecutor, SubscribeOptions, SubscriptionHandle};
pub use config::StoreConfig;
pub use error::{
    DispatchError, ReduceError, ReducerFault, RegistryError, SelectorError, SnapshotError,
    StoreError, SubscriptionFault,
};
pub use events::HandlerHandle;
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use reducer::{reducer_fn, FnReducer, ReduceResult, ReducerRegistry, Reduction, SliceReducer};
pub use selector::{select, PathStep, SelectorPath};
pub use snapshot::{JsonFileSink, JsonFileSource, SnapshotSink, SnapshotSource};
pub use state::{SliceState, StateTree};
pub use store::{Commit, Store, StoreBuilder};
