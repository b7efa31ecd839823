//! Error types for the strand core
//!
//! Faults are recovered at the boundary of the unit that caused them: a
//! reducer fault aborts its dispatch (state unchanged), a subscription
//! fault is contained to that subscription, and registration conflicts
//! fail at registration time.

use strand_types::{ServiceId, SliceName, SubscriptionId, Version};
use thiserror::Error;

/// A reducer failed while handling an action
///
/// Either the reducer panicked, or the action payload routed to a slice
/// whose reducer expects a different action type.
#[derive(Debug, Error)]
pub enum ReducerFault {
    /// The reducer panicked mid-reduce
    #[error("reducer for slice '{slice}' panicked on {action}: {message}")]
    Panicked {
        slice: SliceName,
        action: String,
        message: String,
    },

    /// The action payload is not the type the slice's reducer handles
    #[error("reducer for slice '{slice}' cannot handle the payload of {action}")]
    PayloadMismatch { slice: SliceName, action: String },

    /// The stored slice state is not the type the slice's reducer expects
    #[error("slice '{slice}' holds a state of an unexpected type")]
    StateMismatch { slice: SliceName },
}

/// Dispatch failed; the published tree is unchanged
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The reducer faulted (see [`ReducerFault`])
    #[error(transparent)]
    Reducer(#[from] ReducerFault),

    /// A non-initializing action arrived before the slice was initialized
    #[error("slice '{slice}' has no state yet and {action} is not an initializing action")]
    UninitializedSlice { slice: SliceName, action: String },

    /// The action targets a slice with no registered reducer
    #[error("no reducer registered for slice '{0}'")]
    UnknownSlice(SliceName),

    /// The store has been closed; no further dispatches are accepted
    #[error("store is closed")]
    Closed,
}

/// Reducer registration failed
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two reducers were registered for the same slice name
    #[error("a reducer is already registered for slice '{0}'")]
    DuplicateReducer(SliceName),
}

/// A reducer's way of refusing an action it cannot apply yet
///
/// Returned from [`SliceReducer::reduce`](crate::reducer::SliceReducer::reduce)
/// when the action requires state that does not exist; the dispatch engine
/// converts it into [`DispatchError::UninitializedSlice`].
#[derive(Debug, Error)]
pub enum ReduceError {
    /// The action is only valid against an initialized slice
    #[error("action requires an initialized slice")]
    RequiresState,
}

/// Snapshot encoding/decoding or persistence failed
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("slice '{0}' has no snapshot codec registered")]
    NoCodec(SliceName),

    #[error("slice '{slice}' failed to {direction}: {message}")]
    Codec {
        slice: SliceName,
        direction: &'static str,
        message: String,
    },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Selector path parsing or evaluation failed
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector path is empty")]
    Empty,

    #[error("selector path segment '{0}' is not a plain field or index")]
    BadSegment(String),

    #[error("selector path references unknown slice '{0}'")]
    UnknownSlice(SliceName),

    #[error("slice '{0}' is not serializable; register it with a snapshot codec")]
    NotSerializable(SliceName),

    #[error("selector path step '{0}' does not resolve against the current state")]
    Unresolved(String),
}

/// Store-level error covering registration plus snapshot hydration
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// A selector or callback raised during an autorun pass
///
/// Isolated to the one subscription; other subscriptions and the dispatch
/// pipeline are unaffected. Recorded in the store's fault log and logged
/// via `tracing`.
#[derive(Debug, Clone, Error)]
#[error("subscription {subscription} faulted at {version}: {message}")]
pub struct SubscriptionFault {
    /// The subscription that faulted
    pub subscription: SubscriptionId,
    /// Service owning the subscription, if any
    pub owner: Option<ServiceId>,
    /// Tree version the subscription was being evaluated against
    pub version: Version,
    /// Panic or refusal message
    pub message: String,
}

/// Render a panic payload as a message for fault reports
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
