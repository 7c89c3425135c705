//! Translation of a [`ClientConfiguration`] into the flat property set handed to a
//! [`BrokerConnector`](crate::connector::BrokerConnector).
//!
//! The keys are the legacy high-level consumer keys, kept byte for byte so the output can be
//! fed to existing deployments. Connectors that speak a different dialect translate from here.

use std::fmt;
use std::time::Duration;

use crate::config::ClientConfiguration;

pub const ZK_CONNECT: &str = "zk.connect";
pub const ZK_CONNECTION_TIMEOUT_MS: &str = "zk.connectiontimeout.ms";
pub const GROUP_ID: &str = "groupid";
pub const SOCKET_TIMEOUT_MS: &str = "socket.timeout.ms";
pub const SOCKET_BUFFER_SIZE: &str = "socket.buffersize";
pub const FETCH_SIZE: &str = "fetch.size";
pub const BACKOFF_INCREMENT_MS: &str = "backoff.increment.ms";
pub const QUEUED_CHUNKS_MAX: &str = "queuedchunks.max";
pub const AUTOCOMMIT_ENABLE: &str = "autocommit.enable";
pub const AUTOCOMMIT_INTERVAL_MS: &str = "autocommit.interval.ms";
pub const CONSUMER_TIMEOUT_MS: &str = "consumer.timeout.ms";
pub const REBALANCE_RETRIES_MAX: &str = "rebalance.retries.max";

/// Ordered string key/value pairs. Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing the value in place if the key is already present.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_owned(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Read a millisecond value. Negative values (the `-1` "unset" marker) read as `None`.
    pub fn get_ms(&self, key: &str) -> Option<Duration> {
        self.get_i64(key)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    /// The per-poll timeout every stream must honour, if one is configured.
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.get_ms(CONSUMER_TIMEOUT_MS)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl From<&ClientConfiguration> for Properties {
    fn from(config: &ClientConfiguration) -> Self {
        let consumer_timeout = match config.consumer_timeout {
            Some(timeout) => timeout.as_millis().to_string(),
            None => "-1".to_owned(),
        };

        let mut properties = Properties::new();
        properties
            .set(ZK_CONNECT, config.zk_connect.as_str())
            .set(
                ZK_CONNECTION_TIMEOUT_MS,
                config.zk_connection_timeout.as_millis().to_string(),
            )
            .set(GROUP_ID, config.group_id.as_str())
            .set(SOCKET_TIMEOUT_MS, config.socket_timeout.as_millis().to_string())
            .set(SOCKET_BUFFER_SIZE, config.socket_buffer_size.to_string())
            .set(FETCH_SIZE, config.fetch_size.to_string())
            .set(
                BACKOFF_INCREMENT_MS,
                config.backoff_increment.as_millis().to_string(),
            )
            .set(QUEUED_CHUNKS_MAX, config.queued_chunks_max.to_string())
            .set(AUTOCOMMIT_ENABLE, config.autocommit_enable.to_string())
            .set(
                AUTOCOMMIT_INTERVAL_MS,
                config.autocommit_interval.as_millis().to_string(),
            )
            .set(CONSUMER_TIMEOUT_MS, consumer_timeout)
            .set(
                REBALANCE_RETRIES_MAX,
                config.rebalance_retries_max.to_string(),
            );
        properties
    }
}

impl ClientConfiguration {
    /// Property set used to connect the broker connector.
    pub fn properties(&self) -> Properties {
        Properties::from(self)
    }
}
