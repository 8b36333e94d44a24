//! Live-update subscription handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

/// Handle returned by `subscribe`. Delivery stops on the first call to
/// [`Subscription::unsubscribe`]; later calls are no-ops. Dropping the
/// handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(active: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            active,
            task: Some(task),
        }
    }

    /// A handle that never delivers (no remote configured or watch failed).
    #[must_use]
    pub fn inert() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Whether updates may still be delivered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop delivery and release the remote listener. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            // Aborting drops the watch receiver, which releases the listener.
            task.abort();
            tracing::debug!("experiment subscription closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inert_subscription() {
        let mut sub = Subscription::inert();
        assert!(!sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn test_unsubscribe_aborts_task_once() {
        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(std::future::pending::<()>());
        let mut sub = Subscription::new(Arc::clone(&active), task);

        assert!(sub.is_active());
        sub.unsubscribe();
        assert!(!active.load(Ordering::SeqCst));
        sub.unsubscribe();
        assert!(sub.task.is_none());
    }
}
