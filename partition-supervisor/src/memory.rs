//! In-process broker connector backed by channels.
//!
//! Streams decode the payloads published through [`MemoryConnector::publish`] with the
//! decoder handed to `open_streams`, exactly like a network connector would. Handy to
//! exercise handlers and error policies without a cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TopicPartitions;
use crate::connector::{
    partition_ids, BrokerConnector, PartitionStream, RecordStream, TopicStreams,
};
use crate::decode::Decoder;
use crate::error::{ConnectorError, StreamError};
use crate::properties::Properties;

#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    connect_error: Option<String>,
}

#[derive(Default)]
struct State {
    properties: Option<Properties>,
    senders: BTreeMap<(String, i32), mpsc::UnboundedSender<Vec<u8>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose `connect` always fails, to simulate an unreachable cluster.
    pub fn unreachable(reason: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                connect_error: Some(reason.to_owned()),
                ..Default::default()
            }),
        }
    }

    /// Publish a raw payload to an open stream. Returns false if the stream is not open.
    pub fn publish(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> bool {
        let Ok(state) = self.inner.state.lock() else {
            warn!("poisoned MemoryConnector mutex");
            return false;
        };
        match state.senders.get(&(topic.to_owned(), partition)) {
            Some(sender) => sender.send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// End one stream: once its buffered records are drained, it yields `None`.
    pub fn end_stream(&self, topic: &str, partition: i32) -> bool {
        match self.inner.state.lock() {
            Ok(mut state) => state
                .senders
                .remove(&(topic.to_owned(), partition))
                .is_some(),
            Err(_) => false,
        }
    }

    /// Properties received by the last successful `connect`.
    pub fn properties(&self) -> Option<Properties> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.properties.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.properties().is_some()
    }

    pub fn open_streams_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.senders.len())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Send + 'static> BrokerConnector<R> for MemoryConnector {
    async fn connect(&self, properties: &Properties) -> Result<(), ConnectorError> {
        if let Some(reason) = &self.inner.connect_error {
            return Err(ConnectorError::Unavailable(reason.clone()));
        }

        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| ConnectorError::Unavailable("poisoned connector state".to_owned()))?;
        if state.properties.is_some() {
            return Err(ConnectorError::AlreadyConnected);
        }
        state.properties = Some(properties.clone());
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        debug!("memory connector connected");
        Ok(())
    }

    async fn open_streams(
        &self,
        topics: &TopicPartitions,
        decoder: Arc<dyn Decoder<R>>,
    ) -> Result<TopicStreams<R>, ConnectorError> {
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| ConnectorError::Unavailable("poisoned connector state".to_owned()))?;
        let poll_timeout = state
            .properties
            .as_ref()
            .ok_or(ConnectorError::NotConnected)?
            .poll_timeout();

        let mut streams = TopicStreams::new();
        for (topic, count) in topics.iter() {
            let partitions = partition_ids(topic, count)?;
            let mut topic_streams: Vec<RecordStream<R>> = Vec::with_capacity(count);
            for partition in partitions {
                let (sender, receiver) = mpsc::unbounded_channel();
                state.senders.insert((topic.to_owned(), partition), sender);
                topic_streams.push(Box::new(MemoryStream {
                    partition,
                    receiver,
                    decoder: decoder.clone(),
                    poll_timeout,
                }));
            }
            streams.insert(topic.to_owned(), topic_streams);
        }

        Ok(streams)
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);

        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| ConnectorError::Unavailable("poisoned connector state".to_owned()))?;
        state.senders.clear();
        state.properties = None;

        debug!("memory connector closed");
        Ok(())
    }
}

struct MemoryStream<R> {
    partition: i32,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: Arc<dyn Decoder<R>>,
    poll_timeout: Option<Duration>,
}

#[async_trait]
impl<R: Send + 'static> PartitionStream<R> for MemoryStream<R> {
    async fn next_record(&mut self) -> Result<Option<R>, StreamError> {
        let payload = match self.poll_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.receiver.recv())
                .await
                .map_err(|_| StreamError::Timeout(timeout))?,
            None => self.receiver.recv().await,
        };

        match payload {
            Some(payload) => Ok(Some(self.decoder.decode(&payload)?)),
            None => Ok(None),
        }
    }

    fn partition(&self) -> i32 {
        self.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Utf8Decoder;
    use crate::properties::CONSUMER_TIMEOUT_MS;

    fn topics() -> TopicPartitions {
        [("events", 2)].into_iter().collect()
    }

    fn utf8() -> Arc<dyn Decoder<String>> {
        Arc::new(Utf8Decoder)
    }

    #[tokio::test]
    async fn test_streams_decode_published_payloads() {
        let connector = MemoryConnector::new();
        BrokerConnector::<String>::connect(&connector, &Properties::new())
            .await
            .expect("failed to connect");

        let mut streams = connector
            .open_streams(&topics(), utf8())
            .await
            .expect("failed to open streams");
        let mut events = streams.remove("events").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(connector.open_streams_count(), 2);

        assert!(connector.publish("events", 1, "hello"));
        assert!(!connector.publish("events", 7, "nobody"));

        let record = events[1].next_record().await.expect("failed to receive");
        assert_eq!(record.as_deref(), Some("hello"));
        assert_eq!(events[1].partition(), 1);

        assert!(connector.end_stream("events", 0));
        assert!(events[0].next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_requires_connect() {
        let connector = MemoryConnector::new();
        let result = connector
            .open_streams(&topics(), utf8())
            .await;

        assert!(matches!(result, Err(ConnectorError::NotConnected)));
    }

    #[tokio::test]
    async fn test_open_rejects_counts_beyond_partition_ids() {
        let connector = MemoryConnector::new();
        BrokerConnector::<String>::connect(&connector, &Properties::new())
            .await
            .expect("failed to connect");

        let topics: TopicPartitions = [("events", usize::MAX)].into_iter().collect();
        let result = connector.open_streams(&topics, utf8()).await;

        assert!(matches!(
            result,
            Err(ConnectorError::NotEnoughPartitions { requested: usize::MAX, .. })
        ));
        assert_eq!(connector.open_streams_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_connector() {
        let connector = MemoryConnector::unreachable("no route to host");
        let result = BrokerConnector::<String>::connect(&connector, &Properties::new()).await;

        assert!(matches!(result, Err(ConnectorError::Unavailable(_))));
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_poll_timeout() {
        let connector = MemoryConnector::new();
        let mut properties = Properties::new();
        properties.set(CONSUMER_TIMEOUT_MS, "20");
        BrokerConnector::<String>::connect(&connector, &properties)
            .await
            .unwrap();

        let mut streams = connector
            .open_streams(&topics(), utf8())
            .await
            .unwrap();
        let stream = &mut streams.get_mut("events").unwrap()[0];

        match stream.next_record().await {
            Err(StreamError::Timeout(timeout)) => {
                assert_eq!(timeout, Duration::from_millis(20))
            }
            other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let connector = MemoryConnector::new();
        BrokerConnector::<String>::connect(&connector, &Properties::new())
            .await
            .unwrap();
        let mut streams = connector
            .open_streams(&topics(), utf8())
            .await
            .unwrap();

        BrokerConnector::<String>::close(&connector).await.unwrap();

        assert_eq!(connector.close_count(), 1);
        assert!(!connector.is_connected());
        let stream = &mut streams.get_mut("events").unwrap()[1];
        assert!(stream.next_record().await.unwrap().is_none());
    }
}
