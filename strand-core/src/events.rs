//! The event bus
//!
//! Events are emitted only by reducers (through their [`Reduction`]
//! (crate::reducer::Reduction)) and delivered by the store's notifier to
//! every handler registered for their kind. The handler list is
//! snapshotted per delivery, so handlers added during delivery never
//! retroactively receive the event. Handlers must not block; a handler
//! owned by a service runs on that service's scheduler.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use strand_types::{EventKind, HandlerId, ServiceId};

use crate::action::Event;
use crate::autorun::CallbackExecutor;
use crate::metrics::StoreMetrics;

struct HandlerEntry {
    id: HandlerId,
    #[allow(dead_code)]
    owner: Option<ServiceId>,
    executor: Option<Arc<dyn CallbackExecutor>>,
    live: AtomicBool,
    handler: Arc<dyn Fn(&Event) + Send + Sync>,
}

/// Handle for releasing an event handler
#[derive(Clone)]
pub struct HandlerHandle {
    id: HandlerId,
    kind: EventKind,
    entry: Weak<HandlerEntry>,
    bus: Weak<EventBusInner>,
}

impl HandlerHandle {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.entry
            .upgrade()
            .map_or(false, |e| e.live.load(Ordering::Acquire))
    }

    pub fn release(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.live.store(false, Ordering::Release);
        }
        if let Some(bus) = self.bus.upgrade() {
            let mut handlers = bus.handlers.write();
            if let Some(list) = handlers.get_mut(&self.kind) {
                list.retain(|e| e.id != self.id);
                if list.is_empty() {
                    handlers.remove(&self.kind);
                }
            }
        }
    }
}

struct EventBusInner {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<HandlerEntry>>>>,
    metrics: Arc<StoreMetrics>,
}

/// Delivers events to handlers registered per kind
pub(crate) struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new(metrics: Arc<StoreMetrics>) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                handlers: RwLock::new(HashMap::new()),
                metrics,
            }),
        }
    }

    /// Register a handler for an event kind
    pub fn on<F>(
        &self,
        kind: impl Into<EventKind>,
        owner: Option<ServiceId>,
        executor: Option<Arc<dyn CallbackExecutor>>,
        handler: F,
    ) -> HandlerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let kind = kind.into();
        let entry = Arc::new(HandlerEntry {
            id: HandlerId::next(),
            owner,
            executor,
            live: AtomicBool::new(true),
            handler: Arc::new(handler),
        });
        let handle = HandlerHandle {
            id: entry.id,
            kind: kind.clone(),
            entry: Arc::downgrade(&entry),
            bus: Arc::downgrade(&self.inner),
        };
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(entry);
        handle
    }

    /// Deliver one event to every live handler of its kind
    ///
    /// Runs on the notifier thread in commit order.
    pub fn deliver(&self, event: &Event) {
        let entries: Vec<Arc<HandlerEntry>> = {
            let handlers = self.inner.handlers.read();
            match handlers.get(event.kind()) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for entry in entries {
            if !entry.live.load(Ordering::Acquire) {
                continue;
            }
            self.inner.metrics.record_event_delivered();
            // A panicking handler must not take down the notifier or the
            // owning service's thread
            let handler = Arc::clone(&entry.handler);
            let id = entry.id;
            let owned_event = event.clone();
            let guarded = Box::new(move || {
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| (*handler)(&owned_event)))
                {
                    tracing::warn!(
                        handler = %id,
                        kind = %owned_event.kind(),
                        "event handler panicked: {}",
                        crate::error::panic_message(payload)
                    );
                }
            });
            match &entry.executor {
                Some(executor) => {
                    if !executor.execute(guarded) {
                        tracing::debug!(
                            handler = %entry.id,
                            kind = %event.kind(),
                            "event dropped; owner no longer accepts work"
                        );
                    }
                }
                None => guarded(),
            }
        }
    }

    /// Number of live handlers across all kinds
    pub fn len(&self) -> usize {
        self.inner.handlers.read().values().map(Vec::len).sum()
    }
}
