//! The autorun engine
//!
//! An autorun subscription owns a selector over the state tree, the
//! previously selected value, and a callback. After every committed
//! dispatch the engine evaluates live selectors in registration order and
//! fires callbacks only for those whose selected value changed under the
//! subscription's equality (structural by default, memoization on by
//! default).
//!
//! Callbacks do not run inline with dispatch: subscriptions owned by a
//! service post their callback to that service's scheduler through the
//! [`CallbackExecutor`] seam, so a slow subscriber never blocks the next
//! dispatch or another service's callbacks. Standalone subscriptions run
//! on the store's notifier thread.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use strand_types::{ServiceId, SubscriptionId, Version};

use crate::error::{panic_message, SubscriptionFault};
use crate::metrics::StoreMetrics;
use crate::state::StateTree;

/// Execution context for a subscription's callbacks
///
/// Implemented by the service runtime's scheduler handle; `execute`
/// returns false when the owner is no longer accepting work.
pub trait CallbackExecutor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) -> bool;
}

/// Per-subscription options
///
/// Defaults: structural equality, no default value, memoization on.
pub struct SubscribeOptions<T> {
    equality: Option<Box<dyn Fn(&T, &T) -> bool + Send>>,
    default_value: Option<T>,
    memoize: bool,
}

impl<T> Default for SubscribeOptions<T> {
    fn default() -> Self {
        Self {
            equality: None,
            default_value: None,
            memoize: true,
        }
    }
}

impl<T> SubscribeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace structural equality with a custom comparator
    pub fn equality(mut self, eq: impl Fn(&T, &T) -> bool + Send + 'static) -> Self {
        self.equality = Some(Box::new(eq));
        self
    }

    /// Value substituted when the selector panics or selects nothing
    pub fn default_value(mut self, value: T) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Disable memoization; the callback then fires on every commit
    pub fn memoize(mut self, memoize: bool) -> Self {
        self.memoize = memoize;
        self
    }
}

enum EvalOutcome {
    /// Selected value unchanged; callback skipped
    Skip,
    /// Callback job to run in the owner's context
    Fire(Box<dyn FnOnce() + Send>),
    /// Selector faulted and no default value was configured
    Fault(String),
}

type EvalFn = Box<dyn FnMut(&StateTree) -> EvalOutcome + Send>;

struct SubscriptionEntry {
    id: SubscriptionId,
    owner: Option<ServiceId>,
    executor: Option<Arc<dyn CallbackExecutor>>,
    live: AtomicBool,
    eval: Mutex<EvalFn>,
}

/// Handle for releasing a subscription
///
/// Dropping the handle does not release the subscription; call
/// [`release`](SubscriptionHandle::release). Releasing mid-evaluation is
/// safe and takes effect no later than the next pass.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    entry: Weak<SubscriptionEntry>,
    engine: Weak<AutorunInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
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
        if let Some(inner) = self.engine.upgrade() {
            inner.subs.lock().remove(&self.id);
        }
    }
}

struct AutorunInner {
    /// Keyed by monotonically increasing id, so iteration order is
    /// registration order
    subs: Mutex<BTreeMap<SubscriptionId, Arc<SubscriptionEntry>>>,
    faults: Mutex<VecDeque<SubscriptionFault>>,
    fault_capacity: usize,
    metrics: Arc<StoreMetrics>,
}

impl AutorunInner {
    fn record_fault(&self, fault: SubscriptionFault) {
        self.metrics.record_subscription_fault();
        tracing::warn!(
            subscription = %fault.subscription,
            version = %fault.version,
            "subscription fault: {}",
            fault.message
        );
        let mut faults = self.faults.lock();
        if faults.len() == self.fault_capacity {
            faults.pop_front();
        }
        faults.push_back(fault);
    }
}

/// Holds the live subscriptions and drives evaluation passes
pub(crate) struct AutorunEngine {
    inner: Arc<AutorunInner>,
}

impl AutorunEngine {
    pub fn new(metrics: Arc<StoreMetrics>, fault_capacity: usize) -> Self {
        Self {
            inner: Arc::new(AutorunInner {
                subs: Mutex::new(BTreeMap::new()),
                faults: Mutex::new(VecDeque::new()),
                fault_capacity,
                metrics,
            }),
        }
    }

    /// Register a subscription
    ///
    /// `owner`/`executor` tie the subscription to a service context; both
    /// are `None` for standalone subscriptions, whose callbacks run inline
    /// on the notifier thread.
    pub fn subscribe<T, S, C>(
        &self,
        owner: Option<ServiceId>,
        executor: Option<Arc<dyn CallbackExecutor>>,
        selector: S,
        callback: C,
        options: SubscribeOptions<T>,
    ) -> SubscriptionHandle
    where
        T: Clone + PartialEq + Send + 'static,
        S: Fn(&StateTree) -> Option<T> + Send + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        let callback = Arc::new(callback);
        let SubscribeOptions {
            equality,
            default_value,
            memoize,
        } = options;
        let mut previous: Option<T> = None;

        let eval: EvalFn = Box::new(move |tree: &StateTree| {
            let selected = match catch_unwind(AssertUnwindSafe(|| selector(tree))) {
                Ok(selected) => selected,
                Err(payload) => match &default_value {
                    Some(default) => Some(default.clone()),
                    None => return EvalOutcome::Fault(panic_message(payload)),
                },
            };
            let value = match selected {
                Some(value) => value,
                None => match &default_value {
                    Some(default) => default.clone(),
                    None => return EvalOutcome::Fault("selector selected no value".to_string()),
                },
            };

            if memoize {
                if let Some(previous) = &previous {
                    let unchanged = match &equality {
                        Some(eq) => eq(previous, &value),
                        None => *previous == value,
                    };
                    if unchanged {
                        return EvalOutcome::Skip;
                    }
                }
            }

            previous = Some(value.clone());
            let callback = Arc::clone(&callback);
            EvalOutcome::Fire(Box::new(move || (*callback)(&value)))
        });

        let entry = Arc::new(SubscriptionEntry {
            id,
            owner,
            executor,
            live: AtomicBool::new(true),
            eval: Mutex::new(eval),
        });
        let handle = SubscriptionHandle {
            id,
            entry: Arc::downgrade(&entry),
            engine: Arc::downgrade(&self.inner),
        };
        self.inner.subs.lock().insert(id, entry);
        handle
    }

    /// Evaluate every live subscription against a freshly committed tree
    ///
    /// Runs on the notifier thread, in commit order; no subscription ever
    /// observes versions out of order.
    pub fn run_pass(&self, version: Version, tree: &StateTree) {
        let entries: Vec<Arc<SubscriptionEntry>> =
            self.inner.subs.lock().values().cloned().collect();

        for entry in entries {
            if !entry.live.load(Ordering::Acquire) {
                continue;
            }
            self.inner.metrics.record_autorun_eval();
            let outcome = {
                let mut eval = entry.eval.lock();
                (*eval)(tree)
            };
            match outcome {
                EvalOutcome::Skip => self.inner.metrics.record_autorun_skip(),
                EvalOutcome::Fire(job) => {
                    self.inner.metrics.record_autorun_fire();
                    // A panicking callback is a per-subscription fault, not
                    // a dead notifier or service thread
                    let guarded: Box<dyn FnOnce() + Send> = {
                        let inner = Arc::downgrade(&self.inner);
                        let id = entry.id;
                        let owner = entry.owner.clone();
                        Box::new(move || {
                            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                                let message = panic_message(payload);
                                if let Some(inner) = inner.upgrade() {
                                    inner.record_fault(SubscriptionFault {
                                        subscription: id,
                                        owner,
                                        version,
                                        message,
                                    });
                                } else {
                                    tracing::warn!(
                                        subscription = %id,
                                        "callback panicked: {message}"
                                    );
                                }
                            }
                        })
                    };
                    match &entry.executor {
                        Some(executor) => {
                            if !executor.execute(guarded) {
                                tracing::debug!(
                                    subscription = %entry.id,
                                    "callback dropped; owner no longer accepts work"
                                );
                            }
                        }
                        None => guarded(),
                    }
                }
                EvalOutcome::Fault(message) => {
                    self.inner.record_fault(SubscriptionFault {
                        subscription: entry.id,
                        owner: entry.owner.clone(),
                        version,
                        message,
                    });
                }
            }
        }
    }

    /// All retained subscription faults, oldest first
    pub fn faults(&self) -> Vec<SubscriptionFault> {
        self.inner.faults.lock().iter().cloned().collect()
    }

    /// Retained faults for one owning service
    pub fn faults_for(&self, owner: &ServiceId) -> Vec<SubscriptionFault> {
        self.inner
            .faults
            .lock()
            .iter()
            .filter(|f| f.owner.as_ref() == Some(owner))
            .cloned()
            .collect()
    }

    /// Drain the fault log
    pub fn take_faults(&self) -> Vec<SubscriptionFault> {
        self.inner.faults.lock().drain(..).collect()
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.inner.subs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SliceState;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::AtomicUsize;
    use strand_types::SliceName;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: i64,
    }

    fn tree(value: i64) -> StateTree {
        let mut slices: Map<SliceName, Arc<dyn SliceState>> = Map::new();
        slices.insert(SliceName::new("counter"), Arc::new(Counter { value }));
        StateTree::from_slices(slices)
    }

    fn engine() -> AutorunEngine {
        AutorunEngine::new(Arc::new(StoreMetrics::new()), 16)
    }

    fn counter_selector(tree: &StateTree) -> Option<i64> {
        tree.slice::<Counter>(&SliceName::new("counter"))
            .map(|c| c.value)
    }

    #[test]
    fn test_fires_once_per_distinct_value() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);

        let _handle = engine.subscribe(
            None,
            None,
            counter_selector,
            move |_: &i64| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default(),
        );

        engine.run_pass(Version(1), &tree(0));
        engine.run_pass(Version(2), &tree(0));
        engine.run_pass(Version(3), &tree(1));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_memoize_disabled_fires_every_pass() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);

        let _handle = engine.subscribe(
            None,
            None,
            counter_selector,
            move |_: &i64| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default().memoize(false),
        );

        engine.run_pass(Version(1), &tree(0));
        engine.run_pass(Version(2), &tree(0));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_custom_equality() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);

        // Compare only the sign of the counter
        let _handle = engine.subscribe(
            None,
            None,
            counter_selector,
            move |_: &i64| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default().equality(|a: &i64, b: &i64| a.signum() == b.signum()),
        );

        engine.run_pass(Version(1), &tree(1));
        engine.run_pass(Version(2), &tree(5));
        engine.run_pass(Version(3), &tree(-2));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_selector_fault_is_contained() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);

        let _faulty = engine.subscribe(
            None,
            None,
            |_tree: &StateTree| -> Option<i64> { panic!("selector boom") },
            |_: &i64| {},
            SubscribeOptions::default(),
        );
        let _healthy = engine.subscribe(
            None,
            None,
            counter_selector,
            move |_: &i64| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default(),
        );

        engine.run_pass(Version(1), &tree(0));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let faults = engine.faults();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].message.contains("selector boom"));
    }

    #[test]
    fn test_default_value_substitutes_for_fault() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);

        let _handle = engine.subscribe(
            None,
            None,
            |tree: &StateTree| {
                tree.slice::<Counter>(&SliceName::new("missing"))
                    .map(|c| c.value)
            },
            move |value: &i64| seen_in_cb.lock().push(*value),
            SubscribeOptions::default().default_value(-1),
        );

        engine.run_pass(Version(1), &tree(0));

        assert_eq!(engine.faults().len(), 0);
        assert_eq!(*seen.lock(), vec![-1]);
    }

    #[test]
    fn test_release_stops_callbacks() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);

        let handle = engine.subscribe(
            None,
            None,
            counter_selector,
            move |_: &i64| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default(),
        );

        engine.run_pass(Version(1), &tree(0));
        assert!(handle.is_live());

        handle.release();
        assert!(!handle.is_live());
        assert_eq!(engine.len(), 0);

        engine.run_pass(Version(2), &tree(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_order_is_evaluation_order() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            engine.subscribe(
                None,
                None,
                counter_selector,
                move |_: &i64| order.lock().push(tag),
                SubscribeOptions::default(),
            );
        }

        engine.run_pass(Version(1), &tree(0));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }
}
