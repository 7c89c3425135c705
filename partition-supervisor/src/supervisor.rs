use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ClientConfiguration;
use crate::connector::{BrokerConnector, TopicStreams};
use crate::decode::Decoder;
use crate::error::{ConnectorError, LifecycleError};
use crate::observer::{SupervisorObserver, TracingObserver};
use crate::policy::PolicyAction;
use crate::pool::{PoolStatus, WorkerPool};
use crate::task::{RecordHandler, TaskOutcome, WorkerTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Runs one worker task per partition stream on a bounded pool and applies the configured
/// error policy whenever a task fails.
///
/// Cloning is cheap and every clone drives the same consumer.
pub struct Supervisor<R, C, H> {
    inner: Arc<Inner<R, C, H>>,
}

struct Inner<R, C, H> {
    config: Arc<ClientConfiguration>,
    connector: C,
    decoder: Arc<dyn Decoder<R>>,
    handler: Arc<H>,
    observer: Arc<dyn SupervisorObserver>,
    pool: WorkerPool,
    /// Serializes lifecycle transitions. Held across connect and shutdown.
    lifecycle: Mutex<LifecycleState>,
    state: watch::Sender<LifecycleState>,
}

impl<R, C, H> Clone for Supervisor<R, C, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, C, H> Supervisor<R, C, H>
where
    R: Send + 'static,
    C: BrokerConnector<R>,
    H: RecordHandler<R>,
{
    pub fn new(
        config: ClientConfiguration,
        connector: C,
        decoder: impl Decoder<R>,
        handler: H,
    ) -> Self {
        Self::with_observer(config, connector, decoder, handler, TracingObserver)
    }

    pub fn with_observer(
        config: ClientConfiguration,
        connector: C,
        decoder: impl Decoder<R>,
        handler: H,
        observer: impl SupervisorObserver,
    ) -> Self {
        let pool = WorkerPool::new(config.threads);
        let (state, _) = watch::channel(LifecycleState::Created);

        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                connector,
                decoder: Arc::new(decoder),
                handler: Arc::new(handler),
                observer: Arc::new(observer),
                pool,
                lifecycle: Mutex::new(LifecycleState::Created),
                state,
            }),
        }
    }

    /// Connect, open every configured stream and submit one worker task per stream.
    ///
    /// Only valid on a freshly created supervisor. If the connector cannot be brought up it
    /// is closed again and the supervisor ends up stopped.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        if *lifecycle != LifecycleState::Created {
            return Err(LifecycleError::InvalidState {
                operation: "start",
                state: *lifecycle,
            });
        }

        let streams = match inner.open_streams().await {
            Ok(streams) => streams,
            Err(e) => {
                if let Err(close_error) = inner.connector.close().await {
                    warn!("failed to close connector after failed start: {}", close_error);
                }
                inner.pool.shutdown_now().await;
                inner.transition(&mut lifecycle, LifecycleState::Stopped);
                return Err(e.into());
            }
        };

        inner
            .observer
            .started(&inner.config.topics, inner.pool.size());

        for (topic, topic_streams) in streams {
            for (index, stream) in topic_streams.into_iter().enumerate() {
                Inner::submit(inner, WorkerTask::new(topic.clone(), index, stream), false);
            }
        }

        inner.transition(&mut lifecycle, LifecycleState::Running);
        Ok(())
    }

    /// Cancel every task, wait for them to exit and close the connector.
    ///
    /// Idempotent: concurrent and repeated calls all return once the supervisor is stopped.
    /// Must not be awaited from inside a record handler, as it waits for that handler to exit.
    pub async fn stop(&self) {
        self.inner.stop().await
    }

    /// Resolves once the supervisor is stopped, whoever stopped it.
    pub async fn stopped(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so the wait can only end on Stopped.
        if state
            .wait_for(|state| *state == LifecycleState::Stopped)
            .await
            .is_err()
        {
            warn!("lifecycle channel closed before the consumer stopped");
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    pub fn config(&self) -> &ClientConfiguration {
        &self.inner.config
    }
}

impl<R, C, H> Inner<R, C, H>
where
    R: Send + 'static,
    C: BrokerConnector<R>,
    H: RecordHandler<R>,
{
    async fn open_streams(&self) -> Result<TopicStreams<R>, ConnectorError> {
        let properties = self.config.properties();
        debug!("connecting with properties:\n{}", properties);

        self.connector.connect(&properties).await?;
        self.connector
            .open_streams(&self.config.topics, self.decoder.clone())
            .await
    }

    fn submit(self: &Arc<Self>, task: WorkerTask<R>, restart: bool) {
        let topic = task.topic().to_owned();
        let index = task.index();

        let inner = self.clone();
        if self
            .pool
            .submit(Box::new(move |cancel| inner.run_task(task, cancel)))
        {
            self.observer.task_submitted(&topic, index, restart);
        } else {
            debug!(topic = topic.as_str(), stream = index, "pool is shut down, task not submitted");
        }
    }

    fn schedule(self: &Arc<Self>, task: WorkerTask<R>, delay: std::time::Duration) {
        let topic = task.topic().to_owned();
        let index = task.index();

        let inner = self.clone();
        let scheduled = self.pool.schedule_after(
            Box::new(move |cancel| inner.run_task(task, cancel)),
            delay,
        );
        if scheduled {
            self.observer.task_submitted(&topic, index, true);
        } else {
            debug!(topic = topic.as_str(), stream = index, "pool is shut down, restart not scheduled");
        }
    }

    fn run_task(self: Arc<Self>, task: WorkerTask<R>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        async move {
            let (task, outcome) = task.run(self.handler.as_ref(), &cancel).await;

            match outcome {
                TaskOutcome::Cancelled => self.observer.task_cancelled(task.topic(), task.index()),
                TaskOutcome::Exhausted => self.observer.stream_exhausted(task.topic(), task.index()),
                TaskOutcome::Failed(e) => {
                    let action = self.config.error_policy.action();
                    self.observer
                        .task_failed(task.topic(), task.index(), &e, action);

                    match action {
                        PolicyAction::RestartNow => self.submit(task, true),
                        PolicyAction::RestartAfter(delay) => self.schedule(task, delay),
                        PolicyAction::ShutdownNow => {
                            drop(task);
                            self.request_stop();
                        }
                        PolicyAction::ShutdownAfter(delay) => {
                            drop(task);
                            tokio::time::sleep(delay).await;
                            self.request_stop();
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Stop from inside a pool task. The stop runs detached, since it waits for every pool
    /// task to exit, the requesting one included.
    fn request_stop(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move { inner.stop().await });
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        match *lifecycle {
            LifecycleState::Stopped => return,
            LifecycleState::Created => {
                self.pool.shutdown_now().await;
                self.transition(&mut lifecycle, LifecycleState::Stopped);
                return;
            }
            LifecycleState::Running => {}
        }

        self.pool.shutdown_now().await;

        if let Err(e) = self.connector.close().await {
            error!("failed to close connector: {}", e);
        }

        self.transition(&mut lifecycle, LifecycleState::Stopped);
        self.observer.stopped();
    }
}

impl<R, C, H> Inner<R, C, H> {
    fn transition(&self, lifecycle: &mut LifecycleState, next: LifecycleState) {
        debug!(from = %lifecycle, to = %next, "consumer state transition");
        *lifecycle = next;
        self.state.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Created.to_string(), "created");
        assert_eq!(LifecycleState::Stopped.to_string(), "stopped");

        let error = LifecycleError::InvalidState {
            operation: "start",
            state: LifecycleState::Running,
        };
        assert_eq!(error.to_string(), "cannot start a consumer that is running");
    }
}
