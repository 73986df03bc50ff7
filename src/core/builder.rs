use std::sync::Arc;

use crate::core::{Config, TaskScheduler};
use crate::error::RuntimeError;
use crate::subscribers::Subscribe;
use crate::workers::Worker;

/// Builder for a [`TaskScheduler`] with subscribers and an initial roster.
pub struct SchedulerBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    workers: Vec<Arc<dyn Worker>>,
}

impl SchedulerBuilder {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Sets event subscribers.
    ///
    /// Each subscriber gets its own bounded queue and task; a slow one drops events
    /// instead of holding up the scheduler.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscribe>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Attaches `worker` before the dispatch loop starts, in call order.
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Validates the configuration and starts the scheduler.
    ///
    /// Must be called inside a tokio runtime: this spawns the dispatch loop, the result
    /// loop and the subscriber listener.
    pub fn build(self) -> Result<TaskScheduler, RuntimeError> {
        self.cfg.validate()?;
        Ok(TaskScheduler::assemble(self.cfg, self.subscribers, self.workers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::BackoffPolicy;

    #[tokio::test]
    async fn rejects_unworkable_poll_factor() {
        let cfg = Config {
            poll: BackoffPolicy {
                factor: 2.0,
                ..BackoffPolicy::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            SchedulerBuilder::new(cfg).build(),
            Err(RuntimeError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn starts_running_with_initial_workers() {
        let sched = SchedulerBuilder::new(Config::default())
            .with_worker(Arc::new(crate::workers::InLoopWorker::new("a")))
            .with_worker(Arc::new(crate::workers::InLoopWorker::new("b")))
            .build()
            .unwrap();
        assert!(sched.is_running());
        assert_eq!(sched.worker_ids(), vec![1, 2]);
        sched.shutdown().await;
        assert!(!sched.is_running());
    }
}
