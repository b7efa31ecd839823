//! Services and their execution context
//!
//! A service is an isolated unit owning reducers, subscriptions, and
//! background work. Its `init` runs on the service's own thread, must
//! return promptly after registering what it needs, and models ongoing
//! work as scheduled tasks rather than blocking loops. Everything a
//! service does crosses into the core through its [`ServiceContext`]:
//! cross-service communication is dispatching an action or reacting to a
//! subscription, never a bare call into another service.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use futures::FutureExt;
use std::panic::AssertUnwindSafe;

use strand_core::error::panic_message;
use strand_core::{
    Action, Commit, DispatchError, Event, HandlerHandle, RegistryError, SliceReducer, StateTree,
    Store, StoreError, SubscribeOptions, SubscriptionHandle,
};
use strand_types::{EventKind, ServiceId, SliceName, TaskId, Version};

use crate::cancel::CancelToken;
use crate::cleanup::CleanupRegistry;
use crate::error::{ServiceError, TaskFault};
use crate::scheduler::{Job, SchedulerHandle, TaskRegistry, TaskStatus};

/// Lifecycle of a service context
///
/// `Unregistered → Initializing → Running → Stopping → Stopped`; no
/// transition skips a state and `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Unregistered,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Unregistered => "unregistered",
            ServiceState::Initializing => "initializing",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Identity and teardown ordering of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    id: ServiceId,
    priority: i32,
}

impl ServiceDescriptor {
    /// Descriptor with the default priority (0)
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(id),
            priority: 0,
        }
    }

    /// Lower-priority services are stopped first on runtime shutdown
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// A unit of behavior hosted by the service runtime
pub trait Service: Send + 'static {
    /// Register reducers and subscriptions, schedule background work, and
    /// return promptly. Runs on the service's own thread.
    fn init(&mut self, ctx: &mut ServiceContext) -> Result<(), ServiceError>;
}

/// A service's window into the runtime
///
/// The context is the only API service code has for talking to the store
/// and for spawning work; there is no alternate scheduler to reach for.
pub struct ServiceContext {
    id: ServiceId,
    store: Arc<Store>,
    scheduler: SchedulerHandle,
    cancel: CancelToken,
    cleanup: Arc<Mutex<CleanupRegistry>>,
    tasks: Arc<TaskRegistry>,
    faults: Arc<Mutex<VecDeque<TaskFault>>>,
    fault_capacity: usize,
}

impl ServiceContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ServiceId,
        store: Arc<Store>,
        scheduler: SchedulerHandle,
        cancel: CancelToken,
        cleanup: Arc<Mutex<CleanupRegistry>>,
        tasks: Arc<TaskRegistry>,
        faults: Arc<Mutex<VecDeque<TaskFault>>>,
        fault_capacity: usize,
    ) -> Self {
        Self {
            id,
            store,
            scheduler,
            cancel,
            cleanup,
            tasks,
            faults,
            fault_capacity,
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// The currently published tree
    pub fn state(&self) -> Arc<StateTree> {
        self.store.state()
    }

    /// Version of the currently published tree
    pub fn version(&self) -> Version {
        self.store.version()
    }

    /// Dispatch an action through the store's serialization point
    pub fn dispatch(&self, action: Action) -> Result<Commit, DispatchError> {
        self.store.dispatch(action)
    }

    /// Register a reducer for a slice this service owns
    pub fn register_reducer<R: SliceReducer>(
        &self,
        slice: impl Into<SliceName>,
        reducer: R,
    ) -> Result<(), RegistryError> {
        self.store.register_reducer(slice, reducer)
    }

    /// Register a reducer whose state participates in snapshots and
    /// selector paths
    pub fn register_persistent<R>(
        &self,
        slice: impl Into<SliceName>,
        reducer: R,
    ) -> Result<(), StoreError>
    where
        R: SliceReducer,
        R::State: Serialize + DeserializeOwned,
    {
        self.store.register_persistent(slice, reducer)
    }

    /// Subscribe an autorun owned by this service
    ///
    /// The callback runs on this service's scheduler and is released
    /// automatically when the service stops.
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
        let handle = self.store.subscribe_owned(
            self.id.clone(),
            Arc::new(self.scheduler.clone()),
            selector,
            callback,
            options,
        );
        self.cleanup.lock().track_subscription(handle.clone());
        handle
    }

    /// Register an event handler owned by this service
    pub fn on<F>(&self, kind: impl Into<EventKind>, handler: F) -> HandlerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handle = self.store.on_owned(
            kind,
            self.id.clone(),
            Arc::new(self.scheduler.clone()),
            handler,
        );
        self.cleanup.lock().track_handler(handle.clone());
        handle
    }

    /// Schedule a background task on this service's scheduler
    ///
    /// The task receives a child of the service's cancel token and must
    /// check it between sub-steps. A panic inside the task is contained:
    /// it marks the task faulted and lands in the service's fault log.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F) -> TaskId
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId::next();
        let name = name.into();
        let token = self.cancel.child();

        self.tasks.insert(id, name.clone());
        self.cleanup.lock().track_task(id);

        let tasks = Arc::clone(&self.tasks);
        let faults = Arc::clone(&self.faults);
        let fault_capacity = self.fault_capacity;
        let service = self.id.clone();
        let status_token = token.clone();

        let wrapped = async move {
            let result = AssertUnwindSafe(async move { f(token).await })
                .catch_unwind()
                .await;
            match result {
                Ok(()) => {
                    let status = if status_token.is_cancelled() {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Completed
                    };
                    tasks.set_status(id, status);
                }
                Err(payload) => {
                    tasks.set_status(id, TaskStatus::Faulted);
                    let fault = TaskFault {
                        service,
                        task: id,
                        name,
                        message: panic_message(payload),
                    };
                    tracing::error!(task = %id, "{fault}");
                    let mut faults = faults.lock();
                    if faults.len() == fault_capacity {
                        faults.pop_front();
                    }
                    faults.push_back(fault);
                }
            }
        };

        if !self.scheduler.submit(Job::Task {
            id,
            future: Box::pin(wrapped),
        }) {
            // Scheduler already closed; the task never ran
            self.tasks.set_status(id, TaskStatus::Cancelled);
        }
        id
    }

    /// This service's cancel token; cancelled when the service stops
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Cloneable dispatch-and-read handle for scheduled tasks
    ///
    /// Tasks outlive the borrow of the context, so they capture one of
    /// these instead. It deliberately exposes only the cross-context
    /// verbs: dispatch and reads of the published tree.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            store: Arc::clone(&self.store),
        }
    }
}

/// Dispatch-and-read handle handed to scheduled tasks
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<Store>,
}

impl Dispatcher {
    pub fn dispatch(&self, action: Action) -> Result<Commit, DispatchError> {
        self.store.dispatch(action)
    }

    pub fn state(&self) -> Arc<StateTree> {
        self.store.state()
    }

    pub fn version(&self) -> Version {
        self.store.version()
    }
}
