use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TopicPartitions;
use crate::decode::Decoder;
use crate::error::{ConnectorError, StreamError};
use crate::properties::Properties;

/// One partition's ordered sequence of typed records.
///
/// A stream is owned by exactly one worker task at a time. `next_record` must be
/// cancel-safe: dropping the returned future (which is how shutdown interrupts a blocked
/// worker) must not lose or corrupt the stream.
#[async_trait]
pub trait PartitionStream<R>: Send {
    /// Wait for the next record. `Ok(None)` means the stream has ended for good.
    async fn next_record(&mut self) -> Result<Option<R>, StreamError>;

    /// Partition this stream reads from, for logs.
    fn partition(&self) -> i32;
}

pub type RecordStream<R> = Box<dyn PartitionStream<R>>;

/// Streams opened per topic, in partition order.
pub type TopicStreams<R> = BTreeMap<String, Vec<RecordStream<R>>>;

/// Connection to the broker cluster. Owned, connected and closed by the supervisor only.
#[async_trait]
pub trait BrokerConnector<R: Send + 'static>: Send + Sync + 'static {
    /// Establish the connection using the mapped client properties.
    async fn connect(&self, properties: &Properties) -> Result<(), ConnectorError>;

    /// Open `count` streams for every configured topic, decoding payloads with `decoder`.
    async fn open_streams(
        &self,
        topics: &TopicPartitions,
        decoder: Arc<dyn Decoder<R>>,
    ) -> Result<TopicStreams<R>, ConnectorError>;

    /// Release every network resource. Called at most once, after all workers have exited.
    /// When autocommit is disabled, consumed offsets are flushed here.
    async fn close(&self) -> Result<(), ConnectorError>;
}

/// Partition ids `0..count` for one topic. Kafka partition ids are `i32`, so a larger
/// count can never be satisfied.
pub(crate) fn partition_ids(topic: &str, count: usize) -> Result<Range<i32>, ConnectorError> {
    let end = i32::try_from(count).map_err(|_| ConnectorError::NotEnoughPartitions {
        topic: topic.to_owned(),
        requested: count,
        available: i32::MAX as usize,
    })?;
    Ok(0..end)
}
