use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{CommitMode, Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, TopicPartitionList};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TopicPartitions;
use crate::connector::{
    partition_ids, BrokerConnector, PartitionStream, RecordStream, TopicStreams,
};
use crate::decode::Decoder;
use crate::error::{ConnectorError, StreamError};
use crate::properties::{
    Properties, AUTOCOMMIT_ENABLE, AUTOCOMMIT_INTERVAL_MS, BACKOFF_INCREMENT_MS, FETCH_SIZE,
    GROUP_ID, QUEUED_CHUNKS_MAX, REBALANCE_RETRIES_MAX, SOCKET_BUFFER_SIZE, SOCKET_TIMEOUT_MS,
    ZK_CONNECT, ZK_CONNECTION_TIMEOUT_MS,
};

/// Connector reading partitions through librdkafka.
///
/// Partitions are assigned statically: stream `i` of a topic reads partition `i`, through its
/// own split partition queue. The consumer's main queue is polled by a background driver so
/// that librdkafka keeps serving callbacks.
#[derive(Default)]
pub struct KafkaConnector {
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    consumer: Arc<StreamConsumer>,
    poll_timeout: Option<Duration>,
    autocommit: bool,
    metadata_retries: u32,
    backoff: Duration,
    socket_timeout: Duration,
    driver: Option<(CancellationToken, JoinHandle<()>)>,
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Translate the legacy property set into librdkafka settings.
pub fn client_config(properties: &Properties) -> Result<ClientConfig, ConnectorError> {
    let brokers = properties
        .get(ZK_CONNECT)
        .ok_or(ConnectorError::MissingProperty(ZK_CONNECT))?;
    let group = properties
        .get(GROUP_ID)
        .ok_or(ConnectorError::MissingProperty(GROUP_ID))?;

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.partition.eof", "false");

    let numeric = [
        (SOCKET_TIMEOUT_MS, "socket.timeout.ms"),
        (ZK_CONNECTION_TIMEOUT_MS, "socket.connection.setup.timeout.ms"),
        (SOCKET_BUFFER_SIZE, "socket.receive.buffer.bytes"),
        (FETCH_SIZE, "max.partition.fetch.bytes"),
        (BACKOFF_INCREMENT_MS, "fetch.error.backoff.ms"),
        (AUTOCOMMIT_INTERVAL_MS, "auto.commit.interval.ms"),
    ];
    for (legacy, key) in numeric {
        if let Some(value) = number(properties, legacy)? {
            client_config.set(key, value.to_string());
        }
    }

    // The legacy client bounded its prefetch in chunks of one fetch each.
    if let (Some(chunks), Some(fetch_size)) = (
        number(properties, QUEUED_CHUNKS_MAX)?,
        number(properties, FETCH_SIZE)?,
    ) {
        let kbytes = (chunks.saturating_mul(fetch_size) / 1024).max(1);
        client_config.set("queued.max.messages.kbytes", kbytes.to_string());
    }

    if let Some(value) = properties.get(AUTOCOMMIT_ENABLE) {
        let enabled = flag(AUTOCOMMIT_ENABLE, value)?;
        client_config.set("enable.auto.commit", enabled.to_string());
    }

    Ok(client_config)
}

fn number(properties: &Properties, key: &'static str) -> Result<Option<i64>, ConnectorError> {
    match properties.get(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(Some)
            .ok_or_else(|| ConnectorError::InvalidProperty {
                key,
                value: value.to_owned(),
            }),
    }
}

fn flag(key: &'static str, value: &str) -> Result<bool, ConnectorError> {
    value.parse().map_err(|_| ConnectorError::InvalidProperty {
        key,
        value: value.to_owned(),
    })
}

impl Connection {
    /// Number of partitions `topic` has, retried while the cluster settles.
    async fn partition_count(&self, topic: &str) -> Result<usize, ConnectorError> {
        let mut attempt = 0;
        loop {
            let consumer = self.consumer.clone();
            let owned_topic = topic.to_owned();
            let timeout = self.socket_timeout;
            let metadata = tokio::task::spawn_blocking(move || {
                consumer.fetch_metadata(Some(owned_topic.as_str()), Timeout::After(timeout))
            })
            .await
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;

            let result = metadata.map_err(ConnectorError::from).and_then(|metadata| {
                match metadata.topics().iter().find(|t| t.name() == topic) {
                    Some(t) if t.error().is_none() && !t.partitions().is_empty() => {
                        Ok(t.partitions().len())
                    }
                    _ => Err(ConnectorError::Unavailable(format!(
                        "no metadata for topic {topic}"
                    ))),
                }
            });

            match result {
                Ok(count) => return Ok(count),
                Err(e) if attempt < self.metadata_retries => {
                    attempt += 1;
                    warn!(
                        topic,
                        attempt, "failed to fetch topic metadata, retrying: {}", e
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: Send + 'static> BrokerConnector<R> for KafkaConnector {
    async fn connect(&self, properties: &Properties) -> Result<(), ConnectorError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Err(ConnectorError::AlreadyConnected);
        }

        let client_config = client_config(properties)?;
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;

        let autocommit = match properties.get(AUTOCOMMIT_ENABLE) {
            Some(value) => flag(AUTOCOMMIT_ENABLE, value)?,
            None => true,
        };
        let metadata_retries = number(properties, REBALANCE_RETRIES_MAX)?.unwrap_or(0);

        *connection = Some(Connection {
            consumer: Arc::new(consumer),
            poll_timeout: properties.poll_timeout(),
            autocommit,
            metadata_retries: u32::try_from(metadata_retries).unwrap_or(u32::MAX),
            backoff: properties
                .get_ms(BACKOFF_INCREMENT_MS)
                .unwrap_or(Duration::from_secs(1)),
            socket_timeout: properties
                .get_ms(SOCKET_TIMEOUT_MS)
                .unwrap_or(Duration::from_secs(30)),
            driver: None,
        });

        info!(
            "connecting to Kafka brokers at {}...",
            properties.get(ZK_CONNECT).unwrap_or_default()
        );
        Ok(())
    }

    async fn open_streams(
        &self,
        topics: &TopicPartitions,
        decoder: Arc<dyn Decoder<R>>,
    ) -> Result<TopicStreams<R>, ConnectorError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(ConnectorError::NotConnected)?;

        let mut assignment = TopicPartitionList::new();
        let mut streams = TopicStreams::new();

        for (topic, count) in topics.iter() {
            let available = connection.partition_count(topic).await?;
            if count > available {
                return Err(ConnectorError::NotEnoughPartitions {
                    topic: topic.to_owned(),
                    requested: count,
                    available,
                });
            }

            let partitions = partition_ids(topic, count)?;
            let mut topic_streams: Vec<RecordStream<R>> = Vec::with_capacity(count);
            for partition in partitions {
                let queue = connection
                    .consumer
                    .split_partition_queue(topic, partition)
                    .ok_or_else(|| {
                        ConnectorError::Unavailable(format!(
                            "cannot split queue for {topic}/{partition}"
                        ))
                    })?;
                assignment.add_partition(topic, partition);
                topic_streams.push(Box::new(KafkaPartitionStream {
                    partition,
                    queue,
                    decoder: decoder.clone(),
                    poll_timeout: connection.poll_timeout,
                }));
            }
            streams.insert(topic.to_owned(), topic_streams);
        }

        connection.consumer.assign(&assignment)?;

        if connection.driver.is_none() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(drive_main_queue(
                connection.consumer.clone(),
                cancel.clone(),
            ));
            connection.driver = Some((cancel, handle));
        }

        info!(
            topics = %topics,
            "assigned {} partitions",
            assignment.count()
        );
        Ok(streams)
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        if let Some((cancel, handle)) = connection.driver {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("kafka driver task failed: {}", e);
            }
        }

        if !connection.autocommit {
            match connection.consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => debug!("committed consumer offsets"),
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                    debug!("no offsets to commit")
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("disconnected from Kafka brokers");
        Ok(())
    }
}

/// Keep polling the main queue. Every assigned partition is split off, so nothing but
/// errors and stray messages should show up here.
async fn drive_main_queue(consumer: Arc<StreamConsumer>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            message = consumer.recv() => match message {
                Ok(message) => warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    "ignoring message received on the main queue"
                ),
                Err(e) => warn!("kafka error on the main queue: {}", e),
            },
        }
    }
}

struct KafkaPartitionStream<R> {
    partition: i32,
    queue: StreamPartitionQueue<DefaultConsumerContext>,
    decoder: Arc<dyn Decoder<R>>,
    poll_timeout: Option<Duration>,
}

#[async_trait]
impl<R: Send + 'static> PartitionStream<R> for KafkaPartitionStream<R> {
    async fn next_record(&mut self) -> Result<Option<R>, StreamError> {
        let message = match self.poll_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.queue.recv())
                .await
                .map_err(|_| StreamError::Timeout(timeout))?,
            None => self.queue.recv().await,
        }?;

        let Some(payload) = message.payload() else {
            return Err(StreamError::EmptyPayload {
                offset: message.offset(),
            });
        };

        Ok(Some(self.decoder.decode(payload)?))
    }

    fn partition(&self) -> i32 {
        self.partition
    }
}
