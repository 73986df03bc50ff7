//! Error types used by the scheduler, its queue and its tasks.
//!
//! - [`TaskError`]: the terminal failure of one submitted task, as seen by its caller.
//! - [`QueueError`]: a pending take on the priority heap that can never be served.
//! - [`RuntimeError`]: failures of the scheduler machinery itself.
//! - [`PoolError`]: jobs that could not run on the blocking pool.
//! - [`WireError`]: codec failures on the subprocess transport.
//!
//! Each type provides `as_label` (stable snake_case, for logs and metrics) and
//! `as_message` (human-readable detail).

use thiserror::Error;

/// # Errors delivered to the caller of a submitted task.
///
/// Worker-side failures never cross a worker boundary as live error objects; they
/// arrive here already formatted as text ([`TaskError::Call`]).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The submitted callable failed. `text` is the formatted diagnostic.
    #[error("call failed: {text}")]
    Call {
        /// Formatted error chain produced on the worker.
        text: String,
    },

    /// No response within the task's timeout, on the original attempt and on its one retry.
    #[error("timed out after {attempts} tries, gave up")]
    Timeout {
        /// Number of attempts that timed out.
        attempts: u32,
    },

    /// The worker transport was lost mid-call.
    #[error("worker disconnected")]
    Disconnected,

    /// Removed from the queue before it was dispatched.
    #[error("task cancelled before dispatch")]
    Cancelled,

    /// The scheduler shut down before the task could be handled.
    #[error("scheduler shut down before the task was handled")]
    Shutdown,

    /// The task was in flight on a worker that crashed and was not reassigned.
    #[error("task abandoned by a crashed worker")]
    Abandoned,

    /// Niceness outside the accepted `-20..=20` range.
    #[error("niceness {niceness} is outside -20..=20")]
    InvalidNiceness {
        /// The rejected value.
        niceness: i32,
    },

    /// Submission after the scheduler stopped.
    #[error("scheduler is not running")]
    NotRunning,
}

impl TaskError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use workheap::TaskError;
    ///
    /// let err = TaskError::Timeout { attempts: 2 };
    /// assert_eq!(err.as_label(), "task_timeout");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Call { .. } => "task_call_failed",
            TaskError::Timeout { .. } => "task_timeout",
            TaskError::Disconnected => "task_disconnected",
            TaskError::Cancelled => "task_cancelled",
            TaskError::Shutdown => "task_shutdown",
            TaskError::Abandoned => "task_abandoned",
            TaskError::InvalidNiceness { .. } => "task_invalid_niceness",
            TaskError::NotRunning => "scheduler_not_running",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            TaskError::Call { text } => format!("error: {text}"),
            TaskError::Timeout { attempts } => {
                format!("timed out after {attempts} tries, gave up")
            }
            TaskError::Disconnected => "worker disconnected".to_string(),
            TaskError::Cancelled => "cancelled".to_string(),
            TaskError::Shutdown => "scheduler shut down".to_string(),
            TaskError::Abandoned => "abandoned by crashed worker".to_string(),
            TaskError::InvalidNiceness { niceness } => format!("bad niceness: {niceness}"),
            TaskError::NotRunning => "scheduler not running".to_string(),
        }
    }
}

/// # Errors from the asynchronous priority heap.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A take was pending (or issued on an empty heap) after shutdown.
    #[error("no more items forthcoming")]
    Shutdown,
}

impl QueueError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            QueueError::Shutdown => "queue_shutdown",
        }
    }
}

/// # Errors produced by the scheduler runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// No worker is attached under this id.
    #[error("no worker attached with id {id}")]
    UnknownWorker {
        /// The id that was looked up.
        id: u64,
    },

    /// A worker back-end could not be started.
    #[error("failed to start worker: {reason}")]
    Spawn {
        /// What went wrong.
        reason: String,
    },

    /// A configuration value is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use workheap::RuntimeError;
    ///
    /// let err = RuntimeError::UnknownWorker { id: 7 };
    /// assert_eq!(err.as_label(), "runtime_unknown_worker");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::UnknownWorker { .. } => "runtime_unknown_worker",
            RuntimeError::Spawn { .. } => "runtime_spawn_failed",
            RuntimeError::InvalidConfig { .. } => "runtime_invalid_config",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::UnknownWorker { id } => format!("unknown worker id={id}"),
            RuntimeError::Spawn { reason } => format!("spawn failed: {reason}"),
            RuntimeError::InvalidConfig { reason } => format!("bad config: {reason}"),
        }
    }
}

/// # Errors from the explicit blocking pool.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was not started, or was shut down.
    #[error("blocking pool is not running")]
    NotRunning,

    /// The job panicked on its pool thread.
    #[error("pool job panicked: {message}")]
    Panicked {
        /// Panic payload, as text.
        message: String,
    },

    /// A consumerator's items were already handed to a consumer.
    #[error("consumerator is already being consumed")]
    AlreadyConsuming,
}

impl PoolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::NotRunning => "pool_not_running",
            PoolError::Panicked { .. } => "pool_job_panicked",
            PoolError::AlreadyConsuming => "pool_already_consuming",
        }
    }
}

/// # Errors on the subprocess byte-stream transport.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WireError {
    /// The peer closed the stream.
    #[error("transport closed")]
    Closed,

    /// Reading or writing the stream failed.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("bad frame: {0}")]
    Codec(#[from] serde_json::Error),
}

impl WireError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WireError::Closed => "wire_closed",
            WireError::Io(_) => "wire_io",
            WireError::Codec(_) => "wire_codec",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_both_tries() {
        let err = TaskError::Timeout { attempts: 2 };
        assert_eq!(err.to_string(), "timed out after 2 tries, gave up");
    }

    #[test]
    fn queue_shutdown_reads_like_end_of_stream() {
        assert_eq!(QueueError::Shutdown.to_string(), "no more items forthcoming");
    }

    #[test]
    fn labels_are_snake_case() {
        let all = [
            TaskError::Call { text: "x".into() },
            TaskError::Timeout { attempts: 2 },
            TaskError::Disconnected,
            TaskError::Cancelled,
            TaskError::Shutdown,
            TaskError::Abandoned,
            TaskError::InvalidNiceness { niceness: 99 },
            TaskError::NotRunning,
        ];
        for err in all {
            let label = err.as_label();
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{label}");
        }
    }
}
