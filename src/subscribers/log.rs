//! # Logging subscriber.
//!
//! [`LogWriter`] renders scheduler events through `tracing`, one line per event, with
//! the event's metadata as structured fields.
//!
//! ```text
//! INFO  task_queued    task="square" task_id=3 attempt=1
//! WARN  timeout_hit    task="slow" task_id=9 worker="proc-1" timeout_ms=500
//! ERROR task_failed    task="parse" worker="loop" reason="parse: bad input"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Writes every event to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogWriter;

fn label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::TaskQueued => "task_queued",
        EventKind::TaskDispatched => "task_dispatched",
        EventKind::TaskCompleted => "task_completed",
        EventKind::TaskFailed => "task_failed",
        EventKind::TimeoutHit => "timeout_hit",
        EventKind::RetryScheduled => "retry_scheduled",
        EventKind::TaskCancelled => "task_cancelled",
        EventKind::WorkerAttached => "worker_attached",
        EventKind::WorkerDetached => "worker_detached",
        EventKind::WorkerCrashed => "worker_crashed",
        EventKind::LoadChanged => "load_changed",
        EventKind::StopScheduled => "stop_scheduled",
        EventKind::ShutdownRequested => "shutdown_requested",
        EventKind::ShutdownComplete => "shutdown_complete",
        EventKind::SubscriberPanicked => "subscriber_panicked",
        EventKind::SubscriberOverflow => "subscriber_overflow",
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let event = label(e.kind);
        let task = e.task.as_deref().unwrap_or("-");
        let worker = e.worker.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::TaskFailed | EventKind::WorkerCrashed | EventKind::SubscriberPanicked => {
                tracing::error!(event, task, task_id = e.task_id, worker, reason, "workheap event")
            }
            EventKind::TimeoutHit
            | EventKind::RetryScheduled
            | EventKind::StopScheduled
            | EventKind::SubscriberOverflow => tracing::warn!(
                event,
                task,
                task_id = e.task_id,
                worker,
                attempt = e.attempt,
                timeout_ms = e.timeout_ms,
                delay_ms = e.delay_ms,
                reason,
                "workheap event"
            ),
            EventKind::LoadChanged => tracing::trace!(event, load = e.load, "workheap event"),
            EventKind::TaskQueued | EventKind::TaskDispatched | EventKind::TaskCompleted => {
                tracing::debug!(
                    event,
                    task,
                    task_id = e.task_id,
                    series = e.series.as_deref(),
                    worker,
                    attempt = e.attempt,
                    "workheap event"
                )
            }
            _ => tracing::info!(event, task, worker, reason, "workheap event"),
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_snake_case() {
        for kind in [EventKind::TaskQueued, EventKind::SubscriberOverflow, EventKind::LoadChanged] {
            assert!(label(kind).chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
