//! The service runtime
//!
//! The runtime owns the store and one execution context per registered
//! service. Registration spawns the service's thread, runs `init` there,
//! and returns a [`RuntimeHandle`] once the service is running. Teardown
//! is deterministic: `stop()` cancels the service's tasks, releases its
//! subscriptions and handlers, waits for in-flight callbacks, and is
//! idempotent.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use strand_core::error::panic_message;
use strand_core::{Store, SubscriptionFault};
use strand_types::ServiceId;

use crate::cancel::CancelToken;
use crate::cleanup::CleanupRegistry;
use crate::error::{RuntimeError, ServiceError, TaskFault};
use crate::scheduler::{self, SchedulerHandle, TaskInfo, TaskRegistry};
use crate::service::{Service, ServiceContext, ServiceDescriptor, ServiceState};

/// Tunables for the service runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How long a stopping service's tasks get to observe cancellation
    /// before being aborted
    pub stop_timeout_ms: u64,

    /// Maximum retained task faults per service
    pub task_fault_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 2_000,
            task_fault_capacity: 256,
        }
    }
}

struct ServiceShared {
    descriptor: ServiceDescriptor,
    state: Mutex<ServiceState>,
    cancel: CancelToken,
    scheduler: SchedulerHandle,
    cleanup: Arc<Mutex<CleanupRegistry>>,
    tasks: Arc<TaskRegistry>,
    faults: Arc<Mutex<VecDeque<TaskFault>>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Handle to one registered service
///
/// Cheap to clone; all clones address the same service.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<ServiceShared>,
    store: Arc<Store>,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl RuntimeHandle {
    pub fn id(&self) -> &ServiceId {
        self.shared.descriptor.id()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.shared.descriptor
    }

    pub fn state(&self) -> ServiceState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Stop the service: cancel its tasks, release its subscriptions and
    /// event handlers, and wait for its scheduler to drain
    ///
    /// Idempotent; after the first call returns, no callback or task owned
    /// by this service executes again. Must not be called from the
    /// service's own context (it would wait on itself).
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ServiceState::Running => *state = ServiceState::Stopping,
                _ => return,
            }
        }
        tracing::info!(service = %self.id(), "stopping");

        self.shared.cancel.cancel();
        self.shared.cleanup.lock().release_all();
        self.shared.scheduler.close();

        let join = self.shared.join.lock().take();
        if let Some(join) = join {
            let _ = join.join();
        }

        *self.shared.state.lock() = ServiceState::Stopped;
        tracing::info!(service = %self.id(), "stopped");
    }

    /// Task faults recorded for this service, oldest first
    pub fn task_faults(&self) -> Vec<TaskFault> {
        self.shared.faults.lock().iter().cloned().collect()
    }

    /// Subscription faults recorded for this service, oldest first
    pub fn subscription_faults(&self) -> Vec<SubscriptionFault> {
        self.store.faults_for(self.id())
    }

    /// Status of every task this service has scheduled
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.shared.tasks.snapshot()
    }
}

/// Point-in-time counts across the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStats {
    pub services: usize,
    pub running: usize,
    pub stopped: usize,
    pub subscriptions: usize,
    pub handlers: usize,
    pub tasks_running: usize,
}

/// Owns the store and every registered service context
pub struct ServiceRuntime {
    store: Arc<Store>,
    config: RuntimeConfig,
    services: Mutex<BTreeMap<ServiceId, RuntimeHandle>>,
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRuntime {
    /// Runtime with a fresh store and default configuration
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::new()), RuntimeConfig::default())
    }

    /// Runtime around an explicitly constructed store
    pub fn with_store(store: Arc<Store>, config: RuntimeConfig) -> Self {
        Self {
            store,
            config,
            services: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Register a service and run its `init` on the service's own thread
    ///
    /// Blocks until `init` returns; the service is `Running` when this
    /// returns `Ok`.
    pub fn register_service<S: Service>(
        &self,
        descriptor: ServiceDescriptor,
        service: S,
    ) -> Result<RuntimeHandle, RuntimeError> {
        let id = descriptor.id().clone();
        if self.services.lock().contains_key(&id) {
            return Err(RuntimeError::DuplicateService(id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = SchedulerHandle::new(id.clone(), tx);
        let shared = Arc::new(ServiceShared {
            descriptor,
            state: Mutex::new(ServiceState::Initializing),
            cancel: CancelToken::root(),
            scheduler,
            cleanup: Arc::new(Mutex::new(CleanupRegistry::new())),
            tasks: Arc::new(TaskRegistry::new()),
            faults: Arc::new(Mutex::new(VecDeque::new())),
            join: Mutex::new(None),
        });

        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<(), ServiceError>>();
        let thread_shared = Arc::clone(&shared);
        let thread_store = Arc::clone(&self.store);
        let stop_timeout = Duration::from_millis(self.config.stop_timeout_ms);
        let fault_capacity = self.config.task_fault_capacity;

        let join = std::thread::Builder::new()
            .name(format!("strand-service-{id}"))
            .spawn(move || {
                service_thread(
                    thread_shared,
                    thread_store,
                    rx,
                    stop_timeout,
                    fault_capacity,
                    service,
                    init_tx,
                )
            })
            .expect("failed to spawn service thread");
        *shared.join.lock() = Some(join);

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                if let Some(join) = shared.join.lock().take() {
                    let _ = join.join();
                }
                return Err(RuntimeError::Init {
                    service: id,
                    source,
                });
            }
            Err(_) => {
                if let Some(join) = shared.join.lock().take() {
                    let _ = join.join();
                }
                return Err(RuntimeError::InitAborted(id));
            }
        }

        let handle = RuntimeHandle {
            shared,
            store: Arc::clone(&self.store),
        };

        let mut services = self.services.lock();
        if services.contains_key(&id) {
            // Lost a registration race for the same id
            drop(services);
            handle.stop();
            return Err(RuntimeError::DuplicateService(id));
        }
        services.insert(id, handle.clone());
        Ok(handle)
    }

    /// Handle for a registered service
    pub fn handle(&self, id: &ServiceId) -> Option<RuntimeHandle> {
        self.services.lock().get(id).cloned()
    }

    /// Stop every service (lowest priority first, then id order), then
    /// close the store
    pub fn shutdown(&self) {
        let mut handles: Vec<RuntimeHandle> = {
            let mut services = self.services.lock();
            let handles = services.values().cloned().collect();
            services.clear();
            handles
        };
        handles.sort_by(|a, b| {
            (a.descriptor().priority(), a.id())
                .cmp(&(b.descriptor().priority(), b.id()))
        });
        for handle in handles {
            handle.stop();
        }
        self.store.close();
    }

    pub fn stats(&self) -> RuntimeStats {
        let services = self.services.lock();
        let mut running = 0;
        let mut stopped = 0;
        let mut tasks_running = 0;
        for handle in services.values() {
            match handle.state() {
                ServiceState::Running => running += 1,
                ServiceState::Stopped => stopped += 1,
                _ => {}
            }
            tasks_running += handle.shared.tasks.running_count();
        }
        RuntimeStats {
            services: services.len(),
            running,
            stopped,
            subscriptions: self.store.subscription_count(),
            handlers: self.store.handler_count(),
            tasks_running,
        }
    }
}

impl Drop for ServiceRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service_thread<S: Service>(
    shared: Arc<ServiceShared>,
    store: Arc<Store>,
    rx: mpsc::UnboundedReceiver<crate::scheduler::Job>,
    stop_timeout: Duration,
    fault_capacity: usize,
    mut service: S,
    init_tx: std::sync::mpsc::Sender<Result<(), ServiceError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(service = %shared.descriptor.id(), "scheduler build failed: {err}");
            *shared.state.lock() = ServiceState::Stopped;
            let _ = init_tx.send(Err(ServiceError::Init(format!(
                "scheduler construction failed: {err}"
            ))));
            return;
        }
    };

    let mut ctx = ServiceContext::new(
        shared.descriptor.id().clone(),
        store,
        shared.scheduler.clone(),
        shared.cancel.clone(),
        Arc::clone(&shared.cleanup),
        Arc::clone(&shared.tasks),
        Arc::clone(&shared.faults),
        fault_capacity,
    );

    let init_result = match catch_unwind(AssertUnwindSafe(|| service.init(&mut ctx))) {
        Ok(result) => result,
        Err(payload) => Err(ServiceError::Init(panic_message(payload))),
    };

    match init_result {
        Ok(()) => {
            *shared.state.lock() = ServiceState::Running;
            tracing::info!(service = %shared.descriptor.id(), "service running");
            let _ = init_tx.send(Ok(()));
        }
        Err(err) => {
            // Failed init tears down whatever it managed to register
            *shared.state.lock() = ServiceState::Stopping;
            shared.cancel.cancel();
            shared.cleanup.lock().release_all();
            *shared.state.lock() = ServiceState::Stopped;
            let _ = init_tx.send(Err(err));
            return;
        }
    }

    runtime.block_on(scheduler::run_loop(
        rx,
        stop_timeout,
        Arc::clone(&shared.tasks),
    ));
    tracing::debug!(service = %shared.descriptor.id(), "scheduler drained");
}
