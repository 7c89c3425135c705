use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::supervisor::LifecycleState;

/// Misuse of the supervisor's public lifecycle, or a failure to bring it up.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("cannot {operation} a consumer that is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
    #[error("failed to start consumer: {0}")]
    Connector(#[from] ConnectorError),
}

/// Enumeration of errors related to connecting to the broker and opening streams.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("a kafka error occurred: {0}")]
    Kafka(#[from] KafkaError),
    #[error("required property {0} is missing")]
    MissingProperty(&'static str),
    #[error("property {key} has an invalid value `{value}`")]
    InvalidProperty { key: &'static str, value: String },
    #[error("connector is not connected")]
    NotConnected,
    #[error("connector is already connected")]
    AlreadyConnected,
    #[error("topic {topic} has {available} partitions but {requested} streams were requested")]
    NotEnoughPartitions {
        topic: String,
        requested: usize,
        available: usize,
    },
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Enumeration of errors raised while waiting for the next record of a stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("a kafka error occurred while receiving: {0}")]
    Kafka(#[from] KafkaError),
    #[error("no record received within {0:?}")]
    Timeout(Duration),
    #[error("received empty payload at offset {offset}")]
    EmptyPayload { offset: i64 },
    #[error("failed to decode record: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}
