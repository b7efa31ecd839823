//! Slice reducers and the reducer registry
//!
//! A reducer is a pure transition function for one slice: given the
//! current slice state (or none, before initialization) and an action, it
//! returns the next state plus any emitted events. The registry composes
//! per-slice reducers into one whole-tree reducer; routing is done by the
//! dispatch engine, so reducers for independent slices commute and
//! registration order never affects output.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use strand_types::SliceName;

use crate::action::{Action, Event};
use crate::error::{panic_message, DispatchError, ReduceError, ReducerFault, RegistryError, SnapshotError};
use crate::state::SliceState;

/// Result of one successful reduce: the next slice state plus emitted events
#[derive(Debug)]
pub struct Reduction<S> {
    pub state: S,
    pub events: Vec<Event>,
}

impl<S> Reduction<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.events.extend(events);
        self
    }
}

/// Result type for [`SliceReducer::reduce`]
pub type ReduceResult<S> = Result<Reduction<S>, ReduceError>;

/// Pure transition function for one slice
///
/// `reduce` must be deterministic and free of I/O or task spawning; it may
/// refuse an action that requires existing state by returning
/// [`ReduceError::RequiresState`], which the dispatch engine surfaces as
/// an uninitialized-slice error.
pub trait SliceReducer: Send + Sync + 'static {
    /// The slice's state type
    type State: Debug + PartialEq + Send + Sync + 'static;

    /// The slice's closed action enum
    type Action: Debug + Send + 'static;

    fn reduce(&self, state: Option<&Self::State>, action: &Self::Action) -> ReduceResult<Self::State>;
}

/// Adapter so a plain closure can serve as a reducer
pub struct FnReducer<S, A, F> {
    f: F,
    _marker: PhantomData<fn(&S, &A)>,
}

/// Wrap a closure as a [`SliceReducer`]
pub fn reducer_fn<S, A, F>(f: F) -> FnReducer<S, A, F>
where
    S: Debug + PartialEq + Send + Sync + 'static,
    A: Debug + Send + 'static,
    F: Fn(Option<&S>, &A) -> ReduceResult<S> + Send + Sync + 'static,
{
    FnReducer {
        f,
        _marker: PhantomData,
    }
}

impl<S, A, F> SliceReducer for FnReducer<S, A, F>
where
    S: Debug + PartialEq + Send + Sync + 'static,
    A: Debug + Send + 'static,
    F: Fn(Option<&S>, &A) -> ReduceResult<S> + Send + Sync + 'static,
{
    type State = S;
    type Action = A;

    fn reduce(&self, state: Option<&S>, action: &A) -> ReduceResult<S> {
        (self.f)(state, action)
    }
}

/// Outcome of one erased reduce, ready for tree assembly
pub(crate) struct ErasedReduction {
    pub state: Arc<dyn SliceState>,
    /// False when the new state structurally equals the old one; the old
    /// `Arc` is then reused so no-change dispatches republish the same tree
    pub changed: bool,
    pub events: Vec<Event>,
}

impl std::fmt::Debug for ErasedReduction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedReduction")
            .field("changed", &self.changed)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Type-erased reducer stored in the registry
pub(crate) trait ErasedReducer: Send + Sync {
    fn reduce_erased(
        &self,
        slice: &SliceName,
        state: Option<&Arc<dyn SliceState>>,
        action: &Action,
    ) -> Result<ErasedReduction, DispatchError>;
}

struct ReducerAdapter<R> {
    inner: R,
}

impl<R: SliceReducer> ErasedReducer for ReducerAdapter<R> {
    fn reduce_erased(
        &self,
        slice: &SliceName,
        state: Option<&Arc<dyn SliceState>>,
        action: &Action,
    ) -> Result<ErasedReduction, DispatchError> {
        let typed_action =
            action
                .downcast_ref::<R::Action>()
                .ok_or_else(|| ReducerFault::PayloadMismatch {
                    slice: slice.clone(),
                    action: action.summary().to_string(),
                })?;

        let typed_state = match state {
            Some(arc) => Some(arc.as_any().downcast_ref::<R::State>().ok_or_else(|| {
                ReducerFault::StateMismatch {
                    slice: slice.clone(),
                }
            })?),
            None => None,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.inner.reduce(typed_state, typed_action)
        }));

        match outcome {
            Err(payload) => Err(ReducerFault::Panicked {
                slice: slice.clone(),
                action: action.summary().to_string(),
                message: panic_message(payload),
            }
            .into()),
            Ok(Err(ReduceError::RequiresState)) => Err(DispatchError::UninitializedSlice {
                slice: slice.clone(),
                action: action.summary().to_string(),
            }),
            Ok(Ok(reduction)) => {
                let changed = typed_state.map_or(true, |old| *old != reduction.state);
                let state = if changed {
                    Arc::new(reduction.state) as Arc<dyn SliceState>
                } else {
                    // unwrap is safe: changed is false only when old state existed
                    Arc::clone(state.expect("unchanged reduce implies prior state"))
                };
                Ok(ErasedReduction {
                    state,
                    changed,
                    events: reduction.events,
                })
            }
        }
    }
}

/// Serde-backed codec for one slice, erased for registry storage
///
/// Codecs power the snapshot interface and the safe selector-path surface;
/// a slice without a codec is neither persisted nor path-addressable.
pub(crate) trait ErasedCodec: Send + Sync {
    fn encode(&self, slice: &SliceName, state: &dyn SliceState) -> Result<serde_json::Value, SnapshotError>;
    fn decode(&self, slice: &SliceName, value: serde_json::Value) -> Result<Arc<dyn SliceState>, SnapshotError>;
}

struct JsonCodec<S> {
    _marker: PhantomData<fn() -> S>,
}

impl<S> ErasedCodec for JsonCodec<S>
where
    S: Any + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, slice: &SliceName, state: &dyn SliceState) -> Result<serde_json::Value, SnapshotError> {
        let typed = state
            .as_any()
            .downcast_ref::<S>()
            .ok_or_else(|| SnapshotError::Codec {
                slice: slice.clone(),
                direction: "encode",
                message: "stored state has an unexpected type".to_string(),
            })?;
        serde_json::to_value(typed).map_err(|e| SnapshotError::Codec {
            slice: slice.clone(),
            direction: "encode",
            message: e.to_string(),
        })
    }

    fn decode(&self, slice: &SliceName, value: serde_json::Value) -> Result<Arc<dyn SliceState>, SnapshotError> {
        let typed: S = serde_json::from_value(value).map_err(|e| SnapshotError::Codec {
            slice: slice.clone(),
            direction: "decode",
            message: e.to_string(),
        })?;
        Ok(Arc::new(typed))
    }
}

/// Maps each slice name to its reducer (and optional snapshot codec)
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: HashMap<SliceName, Box<dyn ErasedReducer>>,
    codecs: HashMap<SliceName, Arc<dyn ErasedCodec>>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer for a slice
    ///
    /// Registering two reducers for the same slice name is an error.
    pub fn register<R: SliceReducer>(
        &mut self,
        slice: impl Into<SliceName>,
        reducer: R,
    ) -> Result<(), RegistryError> {
        let slice = slice.into();
        if self.reducers.contains_key(&slice) {
            return Err(RegistryError::DuplicateReducer(slice));
        }
        self.reducers
            .insert(slice, Box::new(ReducerAdapter { inner: reducer }));
        Ok(())
    }

    /// Register a reducer whose state is serde-serializable
    ///
    /// Also installs the slice's snapshot codec, enabling persistence and
    /// selector-path access.
    pub fn register_persistent<R>(
        &mut self,
        slice: impl Into<SliceName>,
        reducer: R,
    ) -> Result<(), RegistryError>
    where
        R: SliceReducer,
        R::State: Serialize + DeserializeOwned,
    {
        let slice = slice.into();
        self.register(slice.clone(), reducer)?;
        self.codecs.insert(
            slice,
            Arc::new(JsonCodec::<R::State> {
                _marker: PhantomData,
            }),
        );
        Ok(())
    }

    pub(crate) fn get(&self, slice: &SliceName) -> Option<&dyn ErasedReducer> {
        self.reducers.get(slice).map(|b| b.as_ref())
    }

    pub(crate) fn codec(&self, slice: &SliceName) -> Option<Arc<dyn ErasedCodec>> {
        self.codecs.get(slice).cloned()
    }

    pub fn has(&self, slice: &SliceName) -> bool {
        self.reducers.contains_key(slice)
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}
