//! The store: dispatch engine, publication, and fan-out
//!
//! `dispatch` is the single serialization point: actions are applied
//! exactly one at a time against the current tree, under one mutex shared
//! by every caller. Fan-out to the autorun engine and the event bus
//! happens on the store's notifier thread, outside the critical section,
//! so subscriber work never blocks the next dispatch. Notifications are
//! enqueued while the serialization point is still held, which makes
//! delivery order identical to commit order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use strand_types::{EventKind, ServiceId, SliceName, Version};

use crate::action::{Action, Event};
use crate::autorun::{AutorunEngine, CallbackExecutor, SubscribeOptions, SubscriptionHandle};
use crate::config::StoreConfig;
use crate::error::{
    DispatchError, RegistryError, SelectorError, SnapshotError, StoreError, SubscriptionFault,
};
use crate::events::{EventBus, HandlerHandle};
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::reducer::{ReducerRegistry, SliceReducer};
use crate::selector::SelectorPath;
use crate::snapshot::{SnapshotSink, SnapshotSource};
use crate::state::{Committed, StateTree};

/// Result of one dispatch
#[derive(Debug, Clone)]
pub struct Commit {
    /// Version of the published tree after this dispatch
    pub version: Version,
    /// Whether any slice actually changed
    pub changed: bool,
    /// Number of events emitted by the reducers
    pub events: usize,
    /// The tree this dispatch committed (or republished unchanged)
    pub tree: Arc<StateTree>,
}

enum Notification {
    Commit {
        version: Version,
        tree: Arc<StateTree>,
        changed: bool,
        events: Vec<Event>,
    },
    Flush(std::sync::mpsc::Sender<()>),
}

struct StoreInner {
    config: StoreConfig,
    registry: RwLock<ReducerRegistry>,
    /// The serialization point: held for reduce + publish, never for fan-out
    commit_lock: Mutex<()>,
    current: RwLock<Committed>,
    autorun: AutorunEngine,
    events: EventBus,
    metrics: Arc<StoreMetrics>,
    notifier_tx: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    notifier_join: Mutex<Option<JoinHandle<()>>>,
    source: Mutex<Option<Box<dyn SnapshotSource>>>,
}

/// Builder for a [`Store`]
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    source: Option<Box<dyn SnapshotSource>>,
    sink: Option<Box<dyn SnapshotSink>>,
}

impl StoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Snapshot source consulted when persistent slices register
    pub fn source(mut self, source: impl SnapshotSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Snapshot sink fed on the configured cadence
    pub fn sink(mut self, sink: impl SnapshotSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Store {
        let metrics = Arc::new(StoreMetrics::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(StoreInner {
            autorun: AutorunEngine::new(Arc::clone(&metrics), self.config.fault_log_capacity),
            events: EventBus::new(Arc::clone(&metrics)),
            config: self.config,
            registry: RwLock::new(ReducerRegistry::new()),
            commit_lock: Mutex::new(()),
            current: RwLock::new(Committed::genesis()),
            metrics,
            notifier_tx: Mutex::new(Some(tx)),
            notifier_join: Mutex::new(None),
            source: Mutex::new(self.source),
        });

        let thread_inner = Arc::clone(&inner);
        let sink = self.sink;
        let join = std::thread::Builder::new()
            .name("strand-notifier".to_string())
            .spawn(move || notifier_loop(thread_inner, rx, sink))
            .expect("failed to spawn store notifier thread");
        *inner.notifier_join.lock() = Some(join);

        Store { inner }
    }
}

/// The central state store
///
/// Not a process-wide singleton: a store is an explicit value, and tests
/// build as many independent stores as they need. Share one via `Arc`.
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Register a reducer for a slice
    pub fn register_reducer<R: SliceReducer>(
        &self,
        slice: impl Into<SliceName>,
        reducer: R,
    ) -> Result<(), RegistryError> {
        self.inner.registry.write().register(slice, reducer)
    }

    /// Register a reducer whose state participates in snapshots and
    /// selector paths
    ///
    /// If the store has a snapshot source and it holds a value for this
    /// slice, the slice is hydrated immediately as a regular commit.
    pub fn register_persistent<R>(
        &self,
        slice: impl Into<SliceName>,
        reducer: R,
    ) -> Result<(), StoreError>
    where
        R: SliceReducer,
        R::State: Serialize + DeserializeOwned,
    {
        let slice = slice.into();
        self.inner
            .registry
            .write()
            .register_persistent(slice.clone(), reducer)?;
        self.hydrate(&slice)?;
        Ok(())
    }

    fn hydrate(&self, slice: &SliceName) -> Result<(), StoreError> {
        let value = {
            let mut source = self.inner.source.lock();
            match source.as_mut() {
                Some(source) => source.load(slice)?,
                None => None,
            }
        };
        let Some(value) = value else {
            return Ok(());
        };

        let codec = self
            .inner
            .registry
            .read()
            .codec(slice)
            .ok_or_else(|| SnapshotError::NoCodec(slice.clone()))?;
        let state = codec.decode(slice, value)?;

        let _guard = self.inner.commit_lock.lock();
        let committed = self.inner.current.read().clone();
        let mut slices = committed.tree.clone_slices();
        slices.insert(slice.clone(), state);
        let tree = Arc::new(StateTree::from_slices(slices));
        let version = committed.version.next();
        *self.inner.current.write() = Committed {
            version,
            tree: Arc::clone(&tree),
        };
        self.inner.metrics.record_commit();
        tracing::debug!(slice = %slice, version = %version, "hydrated from snapshot");
        self.notify(Notification::Commit {
            version,
            tree,
            changed: true,
            events: Vec::new(),
        });
        Ok(())
    }

    /// Apply one action against the current tree
    ///
    /// Total order across all callers; on failure the published tree is
    /// left at the previous committed version.
    pub fn dispatch(&self, action: Action) -> Result<Commit, DispatchError> {
        self.inner.metrics.record_dispatch();
        let _guard = self.inner.commit_lock.lock();
        if self.inner.notifier_tx.lock().is_none() {
            return Err(DispatchError::Closed);
        }

        let committed = self.inner.current.read().clone();
        let registry = self.inner.registry.read();

        let mut next_slices = None;
        let mut events = Vec::new();
        let mut changed = false;
        for slice in action.route().targets() {
            let reducer = registry
                .get(slice)
                .ok_or_else(|| DispatchError::UnknownSlice(slice.clone()))?;
            let prior = committed.tree.slice_dyn(slice);
            let out = match reducer.reduce_erased(slice, prior, &action) {
                Ok(out) => out,
                Err(err) => {
                    if matches!(err, DispatchError::Reducer(_)) {
                        self.inner.metrics.record_reducer_fault();
                    }
                    tracing::warn!(
                        slice = %slice,
                        action = action.summary(),
                        "dispatch failed: {err}"
                    );
                    return Err(err);
                }
            };
            if out.changed {
                let map: &mut BTreeMap<_, _> =
                    next_slices.get_or_insert_with(|| committed.tree.clone_slices());
                map.insert(slice.clone(), out.state);
                changed = true;
            }
            events.extend(out.events);
        }
        drop(registry);

        let (version, tree) = if changed {
            let tree = Arc::new(StateTree::from_slices(
                next_slices.expect("changed commit always builds a tree"),
            ));
            let version = committed.version.next();
            *self.inner.current.write() = Committed {
                version,
                tree: Arc::clone(&tree),
            };
            self.inner.metrics.record_commit();
            tracing::debug!(version = %version, action = action.summary(), "committed");
            (version, tree)
        } else {
            self.inner.metrics.record_noop();
            (committed.version, Arc::clone(&committed.tree))
        };

        let event_count = events.len();
        if changed || event_count > 0 {
            self.notify(Notification::Commit {
                version,
                tree: Arc::clone(&tree),
                changed,
                events,
            });
        }

        Ok(Commit {
            version,
            changed,
            events: event_count,
            tree,
        })
    }

    fn notify(&self, note: Notification) {
        if let Some(tx) = self.inner.notifier_tx.lock().as_ref() {
            let _ = tx.send(note);
        }
    }

    /// The currently published tree
    pub fn state(&self) -> Arc<StateTree> {
        Arc::clone(&self.inner.current.read().tree)
    }

    /// Version of the currently published tree
    pub fn version(&self) -> Version {
        self.inner.current.read().version
    }

    /// Subscribe a standalone autorun; the callback runs on the notifier
    /// thread
    pub fn subscribe<T, S, C>(
        &self,
        selector: S,
        callback: C,
        options: SubscribeOptions<T>,
    ) -> SubscriptionHandle
    where
        T: Clone + PartialEq + Send + 'static,
        S: Fn(&StateTree) -> Option<T> + Send + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        self.inner
            .autorun
            .subscribe(None, None, selector, callback, options)
    }

    /// Subscribe an autorun owned by a service context
    ///
    /// Used by the service runtime; callbacks are posted to the owner's
    /// executor instead of running inline.
    pub fn subscribe_owned<T, S, C>(
        &self,
        owner: ServiceId,
        executor: Arc<dyn CallbackExecutor>,
        selector: S,
        callback: C,
        options: SubscribeOptions<T>,
    ) -> SubscriptionHandle
    where
        T: Clone + PartialEq + Send + 'static,
        S: Fn(&StateTree) -> Option<T> + Send + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        self.inner
            .autorun
            .subscribe(Some(owner), Some(executor), selector, callback, options)
    }

    /// Subscribe through a safe selector path (marshaled-boundary surface)
    ///
    /// The selected value is the serde view addressed by the path; the
    /// slice must be registered with `register_persistent`.
    pub fn subscribe_path<C>(
        &self,
        path: SelectorPath,
        callback: C,
        options: SubscribeOptions<Value>,
    ) -> SubscriptionHandle
    where
        C: Fn(&Value) + Send + Sync + 'static,
    {
        let inner = Arc::downgrade(&self.inner);
        self.inner.autorun.subscribe(
            None,
            None,
            move |tree: &StateTree| {
                let inner = inner.upgrade()?;
                let codec = inner.registry.read().codec(path.slice())?;
                let state = tree.slice_dyn(path.slice())?;
                let root = codec.encode(path.slice(), state.as_ref()).ok()?;
                path.resolve(&root).ok()
            },
            callback,
            options,
        )
    }

    /// One-shot evaluation of a safe selector path
    pub fn select_path(&self, path: &SelectorPath) -> Result<Value, SelectorError> {
        let tree = self.state();
        let codec = self
            .inner
            .registry
            .read()
            .codec(path.slice())
            .ok_or_else(|| SelectorError::NotSerializable(path.slice().clone()))?;
        let state = tree
            .slice_dyn(path.slice())
            .ok_or_else(|| SelectorError::UnknownSlice(path.slice().clone()))?;
        let root = codec
            .encode(path.slice(), state.as_ref())
            .map_err(|_| SelectorError::NotSerializable(path.slice().clone()))?;
        path.resolve(&root)
    }

    /// Register a standalone event handler; runs on the notifier thread
    pub fn on<F>(&self, kind: impl Into<EventKind>, handler: F) -> HandlerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, None, None, handler)
    }

    /// Register an event handler owned by a service context
    pub fn on_owned<F>(
        &self,
        kind: impl Into<EventKind>,
        owner: ServiceId,
        executor: Arc<dyn CallbackExecutor>,
        handler: F,
    ) -> HandlerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, Some(owner), Some(executor), handler)
    }

    /// Block until every notification enqueued so far has been processed
    ///
    /// Must not be called from an autorun callback or event handler that
    /// runs on the notifier thread itself.
    pub fn sync(&self) {
        let ack_rx = {
            let tx = self.inner.notifier_tx.lock();
            let Some(tx) = tx.as_ref() else { return };
            let (ack_tx, ack_rx) = std::sync::mpsc::channel();
            if tx.send(Notification::Flush(ack_tx)).is_err() {
                return;
            }
            ack_rx
        };
        let _ = ack_rx.recv();
    }

    /// Stop accepting dispatches, drain pending fan-out, and join the
    /// notifier thread; idempotent
    pub fn close(&self) {
        let tx = self.inner.notifier_tx.lock().take();
        drop(tx);
        let join = self.inner.notifier_join.lock().take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.notifier_tx.lock().is_none()
    }

    /// Retained subscription faults, oldest first
    pub fn faults(&self) -> Vec<SubscriptionFault> {
        self.inner.autorun.faults()
    }

    /// Retained subscription faults for one owning service
    pub fn faults_for(&self, owner: &ServiceId) -> Vec<SubscriptionFault> {
        self.inner.autorun.faults_for(owner)
    }

    /// Drain the subscription fault log
    pub fn take_faults(&self) -> Vec<SubscriptionFault> {
        self.inner.autorun.take_faults()
    }

    /// Number of live autorun subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.autorun.len()
    }

    /// Number of live event handlers
    pub fn handler_count(&self) -> usize {
        self.inner.events.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

fn notifier_loop(
    inner: Arc<StoreInner>,
    mut rx: mpsc::UnboundedReceiver<Notification>,
    mut sink: Option<Box<dyn SnapshotSink>>,
) {
    let mut changed_commits: u64 = 0;
    while let Some(note) = rx.blocking_recv() {
        match note {
            Notification::Commit {
                version,
                tree,
                changed,
                events,
            } => {
                if changed {
                    inner.autorun.run_pass(version, &tree);
                    changed_commits += 1;
                    if let (Some(sink), Some(every)) = (sink.as_mut(), inner.config.snapshot_every)
                    {
                        if every > 0 && changed_commits % every == 0 {
                            persist_snapshot(&inner, sink.as_mut(), version, &tree);
                        }
                    }
                }
                for event in &events {
                    inner.events.deliver(event);
                }
            }
            Notification::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn persist_snapshot(
    inner: &StoreInner,
    sink: &mut dyn SnapshotSink,
    version: Version,
    tree: &StateTree,
) {
    let mut slices = BTreeMap::new();
    {
        let registry = inner.registry.read();
        for (name, state) in tree.iter() {
            let Some(codec) = registry.codec(name) else {
                continue;
            };
            match codec.encode(name, state.as_ref()) {
                Ok(value) => {
                    slices.insert(name.clone(), value);
                }
                Err(err) => tracing::warn!(slice = %name, "snapshot encode failed: {err}"),
            }
        }
    }
    if let Err(err) = sink.persist(version, &slices) {
        tracing::warn!(version = %version, "snapshot persist failed: {err}");
    }
}
