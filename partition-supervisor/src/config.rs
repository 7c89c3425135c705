use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::policy::ErrorPolicy;

/// Everything the supervisor needs to know to connect, open streams and react to failures.
///
/// Loaded from the environment with `ClientConfiguration::init_from_env()`; every field maps
/// to the upper-cased field name (`GROUP_ID`, `TOPICS`, ...). Defaults follow the legacy
/// high-level consumer defaults so that the generated property set stays compatible with
/// existing deployments.
#[derive(Envconfig, Clone, Debug)]
pub struct ClientConfiguration {
    /// Connection string of the cluster quorum. The rdkafka connector dials it as the
    /// bootstrap broker list.
    #[envconfig(default = "localhost:9092")]
    pub zk_connect: String,

    #[envconfig(default = "6000")]
    pub zk_connection_timeout: EnvMsDuration,

    pub group_id: NonEmptyString,

    #[envconfig(default = "30000")]
    pub socket_timeout: EnvMsDuration,

    /// Socket receive buffer, in bytes.
    #[envconfig(default = "65536")]
    pub socket_buffer_size: usize,

    /// Bytes requested per partition fetch.
    #[envconfig(default = "307200")]
    pub fetch_size: usize,

    #[envconfig(default = "1000")]
    pub backoff_increment: EnvMsDuration,

    #[envconfig(default = "10")]
    pub queued_chunks_max: usize,

    #[envconfig(default = "true")]
    pub autocommit_enable: bool,

    #[envconfig(default = "10000")]
    pub autocommit_interval: EnvMsDuration,

    /// Maximum time a stream waits for the next record before failing. Unset means forever.
    pub consumer_timeout: Option<EnvMsDuration>,

    #[envconfig(default = "4")]
    pub rebalance_retries_max: u32,

    /// Upper bound on the number of streams processed concurrently.
    #[envconfig(default = "4")]
    pub threads: NonZeroUsize,

    /// Streams to open per topic, as `topic:count[,topic:count...]`.
    pub topics: TopicPartitions,

    #[envconfig(default = "restart")]
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

impl EnvMsDuration {
    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Number of streams to open for each topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPartitions(BTreeMap<String, usize>);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseTopicPartitionsError {
    #[error("expected `topic:count`, got `{0}`")]
    MalformedEntry(String),
    #[error("invalid stream count for topic {topic}: `{count}`")]
    InvalidCount { topic: String, count: String },
    #[error("topic {0} is listed more than once")]
    DuplicateTopic(String),
    #[error("no topics configured")]
    Empty,
}

impl TopicPartitions {
    /// Streams per topic, in topic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(topic, count)| (topic.as_str(), *count))
    }

    pub fn get(&self, topic: &str) -> Option<usize> {
        self.0.get(topic).copied()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Total number of partition streams across all topics.
    pub fn total_streams(&self) -> usize {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for TopicPartitions {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        TopicPartitions(
            iter.into_iter()
                .map(|(topic, count)| (topic.into(), count))
                .collect(),
        )
    }
}

impl FromStr for TopicPartitions {
    type Err = ParseTopicPartitionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut topics = BTreeMap::new();

        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (topic, count) = entry
                .split_once(':')
                .ok_or_else(|| ParseTopicPartitionsError::MalformedEntry(entry.to_owned()))?;
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(ParseTopicPartitionsError::MalformedEntry(entry.to_owned()));
            }

            let count = match count.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ParseTopicPartitionsError::InvalidCount {
                        topic: topic.to_owned(),
                        count: count.trim().to_owned(),
                    })
                }
            };

            if topics.insert(topic.to_owned(), count).is_some() {
                return Err(ParseTopicPartitionsError::DuplicateTopic(topic.to_owned()));
            }
        }

        if topics.is_empty() {
            return Err(ParseTopicPartitionsError::Empty);
        }

        Ok(TopicPartitions(topics))
    }
}

impl fmt::Display for TopicPartitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .iter()
            .map(|(topic, count)| format!("{topic}:{count}"))
            .collect();
        f.write_str(&entries.join(","))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_minimal_env() {
        let config = ClientConfiguration::init_from_hashmap(&env(&[
            ("GROUP_ID", "billing"),
            ("TOPICS", "events:3"),
        ]))
        .expect("minimal configuration should load");

        assert_eq!(config.group_id.as_str(), "billing");
        assert_eq!(config.zk_connect, "localhost:9092");
        assert_eq!(config.zk_connection_timeout.as_millis(), 6000);
        assert_eq!(config.socket_timeout.as_millis(), 30000);
        assert_eq!(config.socket_buffer_size, 64 * 1024);
        assert_eq!(config.fetch_size, 300 * 1024);
        assert_eq!(config.backoff_increment.as_millis(), 1000);
        assert_eq!(config.queued_chunks_max, 10);
        assert!(config.autocommit_enable);
        assert_eq!(config.autocommit_interval.as_millis(), 10000);
        assert_eq!(config.consumer_timeout, None);
        assert_eq!(config.rebalance_retries_max, 4);
        assert_eq!(config.threads.get(), 4);
        assert_eq!(config.topics.get("events"), Some(3));
        assert_eq!(config.error_policy, ErrorPolicy::Restart(time::Duration::ZERO));
    }

    #[test]
    fn test_required_fields() {
        assert!(ClientConfiguration::init_from_hashmap(&env(&[("TOPICS", "events:1")])).is_err());
        assert!(ClientConfiguration::init_from_hashmap(&env(&[("GROUP_ID", "g")])).is_err());
        assert!(ClientConfiguration::init_from_hashmap(&env(&[
            ("GROUP_ID", ""),
            ("TOPICS", "events:1")
        ]))
        .is_err());
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        assert!(ClientConfiguration::init_from_hashmap(&env(&[
            ("GROUP_ID", "g"),
            ("TOPICS", "events:1"),
            ("THREADS", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn test_parse_topic_partitions() {
        let topics: TopicPartitions = "events:3, clicks:1".parse().unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics.get("events"), Some(3));
        assert_eq!(topics.get("clicks"), Some(1));
        assert_eq!(topics.total_streams(), 4);
        assert_eq!(topics.to_string(), "clicks:1,events:3");

        assert_eq!(
            "events".parse::<TopicPartitions>(),
            Err(ParseTopicPartitionsError::MalformedEntry("events".to_string()))
        );
        assert_eq!(
            "events:0".parse::<TopicPartitions>(),
            Err(ParseTopicPartitionsError::InvalidCount {
                topic: "events".to_string(),
                count: "0".to_string()
            })
        );
        assert_eq!(
            "a:1,a:2".parse::<TopicPartitions>(),
            Err(ParseTopicPartitionsError::DuplicateTopic("a".to_string()))
        );
        assert_eq!(
            " , ".parse::<TopicPartitions>(),
            Err(ParseTopicPartitionsError::Empty)
        );
    }

    #[test]
    fn test_parse_env_ms_duration() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(250)))
        );
        assert_eq!("-1".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }
}
