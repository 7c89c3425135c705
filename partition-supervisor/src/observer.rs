use crate::config::TopicPartitions;
use crate::policy::PolicyAction;
use tracing::{debug, error, info};

pub const METRIC_TASKS_SUBMITTED: &str = "partition_supervisor_tasks_submitted_total";
pub const METRIC_TASK_FAILURES: &str = "partition_supervisor_task_failures_total";
pub const METRIC_STREAMS_EXHAUSTED: &str = "partition_supervisor_streams_exhausted_total";
pub const METRIC_CONSUMER_STOPS: &str = "partition_supervisor_consumer_stops_total";
pub const METRIC_POOL_ACTIVE: &str = "partition_supervisor_pool_active";
pub const METRIC_POOL_QUEUED: &str = "partition_supervisor_pool_queued";

/// Hooks called by the supervisor as tasks move through their lifecycle.
///
/// Every hook defaults to doing nothing, so implementors only override what they watch.
pub trait SupervisorObserver: Send + Sync + 'static {
    fn started(&self, _topics: &TopicPartitions, _threads: usize) {}

    /// A task for `(topic, stream)` entered the pool, initially or as a restart.
    fn task_submitted(&self, _topic: &str, _stream: usize, _restart: bool) {}

    fn task_failed(
        &self,
        _topic: &str,
        _stream: usize,
        _error: &anyhow::Error,
        _action: PolicyAction,
    ) {
    }

    fn task_cancelled(&self, _topic: &str, _stream: usize) {}

    fn stream_exhausted(&self, _topic: &str, _stream: usize) {}

    fn stopped(&self) {}
}

/// Logs every event with `tracing` and counts it with `metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SupervisorObserver for TracingObserver {
    fn started(&self, topics: &TopicPartitions, threads: usize) {
        info!(
            topics = %topics,
            streams = topics.total_streams(),
            threads,
            "consumer started"
        );
    }

    fn task_submitted(&self, topic: &str, stream: usize, restart: bool) {
        debug!(topic, stream, restart, "submitted worker task");
        let labels = [
            ("topic", topic.to_owned()),
            ("restart", restart.to_string()),
        ];
        metrics::counter!(METRIC_TASKS_SUBMITTED, &labels).increment(1);
    }

    fn task_failed(&self, topic: &str, stream: usize, error: &anyhow::Error, action: PolicyAction) {
        error!(
            topic,
            stream,
            action = action.as_str(),
            "error processing stream, {}: {:#}",
            action,
            error
        );

        let labels = [
            ("topic", topic.to_owned()),
            ("action", action.as_str().to_owned()),
        ];
        metrics::counter!(METRIC_TASK_FAILURES, &labels).increment(1);
    }

    fn task_cancelled(&self, topic: &str, stream: usize) {
        debug!(topic, stream, "task cancelled");
    }

    fn stream_exhausted(&self, topic: &str, stream: usize) {
        info!(topic, stream, "stream exhausted, task will not be restarted");

        let labels = [("topic", topic.to_owned())];
        metrics::counter!(METRIC_STREAMS_EXHAUSTED, &labels).increment(1);
    }

    fn stopped(&self) {
        info!("consumer stopped");
        metrics::counter!(METRIC_CONSUMER_STOPS).increment(1);
    }
}
