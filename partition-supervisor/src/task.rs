use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::connector::RecordStream;

/// User processing logic. Receives the whole stream and owns the loop over it.
///
/// Returning `Ok(())` means the stream was exhausted. Returning an error, or panicking,
/// is a processing fault and goes through the configured error policy.
#[async_trait]
pub trait RecordHandler<R>: Send + Sync + 'static {
    async fn handle(&self, topic: &str, stream: &mut RecordStream<R>) -> anyhow::Result<()>;
}

/// Handler calling `f` for each record in order, failing the stream on the first error.
pub struct ForEachRecord<F, R> {
    f: F,
    _record: PhantomData<fn(R)>,
}

pub fn for_each_record<R, F>(f: F) -> ForEachRecord<F, R>
where
    F: Fn(&str, R) -> anyhow::Result<()> + Send + Sync + 'static,
{
    ForEachRecord {
        f,
        _record: PhantomData,
    }
}

#[async_trait]
impl<R, F> RecordHandler<R> for ForEachRecord<F, R>
where
    R: Send + 'static,
    F: Fn(&str, R) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, topic: &str, stream: &mut RecordStream<R>) -> anyhow::Result<()> {
        while let Some(record) = stream.next_record().await? {
            (self.f)(topic, record)?;
        }
        Ok(())
    }
}

/// How a worker task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Interrupted by shutdown. Not an error.
    Cancelled,
    /// The handler returned normally.
    Exhausted,
    /// The handler failed or panicked.
    Failed(anyhow::Error),
}

/// One stream and the identity of the task processing it. The stream moves with the task,
/// so a restarted task picks up where the failed one stopped.
pub struct WorkerTask<R> {
    topic: String,
    index: usize,
    stream: RecordStream<R>,
}

impl<R: Send + 'static> WorkerTask<R> {
    pub fn new(topic: String, index: usize, stream: RecordStream<R>) -> Self {
        Self {
            topic,
            index,
            stream,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Position of the stream among the streams of its topic.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn partition(&self) -> i32 {
        self.stream.partition()
    }

    /// Run the handler over the stream until it fails, ends, or `cancel` fires.
    ///
    /// The task is handed back with the outcome so it can be resubmitted as-is.
    pub async fn run<H>(mut self, handler: &H, cancel: &CancellationToken) -> (Self, TaskOutcome)
    where
        H: RecordHandler<R> + ?Sized,
    {
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => TaskOutcome::Cancelled,
            result = AssertUnwindSafe(handler.handle(&self.topic, &mut self.stream)).catch_unwind() => {
                match result {
                    Ok(Ok(())) => TaskOutcome::Exhausted,
                    Ok(Err(error)) => TaskOutcome::Failed(error),
                    Err(panic) => TaskOutcome::Failed(anyhow::anyhow!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                }
            }
        };

        // Errors surfacing while shutdown is underway are side effects of the shutdown itself.
        let outcome = match outcome {
            TaskOutcome::Failed(_) | TaskOutcome::Exhausted if cancel.is_cancelled() => {
                TaskOutcome::Cancelled
            }
            outcome => outcome,
        };

        (self, outcome)
    }
}

impl<R> fmt::Debug for WorkerTask<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTask")
            .field("topic", &self.topic)
            .field("index", &self.index)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
