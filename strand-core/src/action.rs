//! Actions and events
//!
//! An [`Action`] is a slice-routed intent carrying the user's closed
//! per-slice payload enum; it is consumed exactly once by the dispatch
//! engine. An [`Event`] is a tagged notification emitted by a reducer as a
//! side product of a dispatch; it never mutates state.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use strand_types::{EventKind, SliceName};

/// Where an action is routed
///
/// Single-slice by default; an action may target several slices only when
/// explicitly built as cross-cutting, and its targets are applied in
/// slice-name order (the tree's own order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRoute {
    /// The default: the action targets exactly one slice
    Slice(SliceName),
    /// Explicitly declared cross-cutting action
    Slices(Vec<SliceName>),
}

impl ActionRoute {
    /// Target slices in application order
    pub fn targets(&self) -> &[SliceName] {
        match self {
            ActionRoute::Slice(name) => std::slice::from_ref(name),
            ActionRoute::Slices(names) => names,
        }
    }
}

/// A slice-routed intent that may change state
pub struct Action {
    route: ActionRoute,
    payload: Box<dyn Any + Send>,
    summary: String,
}

impl Action {
    /// Build a single-slice action
    pub fn new<A>(slice: impl Into<SliceName>, payload: A) -> Self
    where
        A: fmt::Debug + Send + 'static,
    {
        Self {
            route: ActionRoute::Slice(slice.into()),
            summary: format!("{payload:?}"),
            payload: Box::new(payload),
        }
    }

    /// Build an explicitly cross-cutting action
    ///
    /// Targets are sorted and deduplicated so application order is the
    /// tree's slice-name order regardless of how the caller listed them.
    pub fn cross_cutting<A>(slices: Vec<SliceName>, payload: A) -> Self
    where
        A: fmt::Debug + Send + 'static,
    {
        let mut slices = slices;
        slices.sort();
        slices.dedup();
        Self {
            route: ActionRoute::Slices(slices),
            summary: format!("{payload:?}"),
            payload: Box::new(payload),
        }
    }

    pub fn route(&self) -> &ActionRoute {
        &self.route
    }

    /// Debug rendering of the payload, captured at construction
    ///
    /// Used in fault reports so every failure names the originating action.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Typed view of the payload
    pub fn downcast_ref<A: 'static>(&self) -> Option<&A> {
        self.payload.downcast_ref::<A>()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("route", &self.route)
            .field("payload", &self.summary)
            .finish()
    }
}

/// A notification emitted during dispatch
///
/// Events are delivered to handlers registered for their kind and then
/// discarded; they carry no authority to change state.
#[derive(Clone)]
pub struct Event {
    kind: EventKind,
    payload: Arc<dyn Any + Send + Sync>,
    summary: String,
}

impl Event {
    pub fn new<P>(kind: impl Into<EventKind>, payload: P) -> Self
    where
        P: fmt::Debug + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            summary: format!("{payload:?}"),
            payload: Arc::new(payload),
        }
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Typed view of the payload
    pub fn downcast_ref<P: 'static>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("payload", &self.summary)
            .finish()
    }
}
