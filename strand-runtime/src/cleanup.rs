//! Per-service cleanup registry
//!
//! Every subscription, event handler, and background task a service
//! creates through its context is tracked here, so `stop()` can tear the
//! service down deterministically: release everything, then wait for the
//! scheduler to drain.

use strand_core::{HandlerHandle, SubscriptionHandle};
use strand_types::TaskId;

/// Tracks the live resources owned by one service context
#[derive(Default)]
pub struct CleanupRegistry {
    subscriptions: Vec<SubscriptionHandle>,
    handlers: Vec<HandlerHandle>,
    tasks: Vec<TaskId>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_subscription(&mut self, handle: SubscriptionHandle) {
        self.subscriptions.push(handle);
    }

    pub fn track_handler(&mut self, handle: HandlerHandle) {
        self.handlers.push(handle);
    }

    pub fn track_task(&mut self, id: TaskId) {
        self.tasks.push(id);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Task ids scheduled through the owning context
    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    /// Release every tracked subscription and handler
    ///
    /// Tasks are not touched here; they are cancelled through the service's
    /// cancel token and drained by the scheduler.
    pub fn release_all(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.release();
        }
        for handler in self.handlers.drain(..) {
            handler.release();
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_tasks() {
        let mut registry = CleanupRegistry::new();
        let t1 = TaskId::next();
        let t2 = TaskId::next();

        registry.track_task(t1);
        registry.track_task(t2);

        assert_eq!(registry.task_count(), 2);
        assert_eq!(registry.tasks(), &[t1, t2]);
    }

    #[test]
    fn test_release_all_empties_registry() {
        let mut registry = CleanupRegistry::new();
        registry.track_task(TaskId::next());
        registry.release_all();

        assert_eq!(registry.task_count(), 0);
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(registry.handler_count(), 0);
    }
}
