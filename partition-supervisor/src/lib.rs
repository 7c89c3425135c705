pub mod config;
pub mod connector;
pub mod decode;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod observer;
pub mod policy;
pub mod pool;
pub mod properties;
pub mod supervisor;
pub mod task;

pub use config::{ClientConfiguration, TopicPartitions};
pub use connector::{BrokerConnector, PartitionStream, RecordStream};
pub use error::{ConnectorError, DecodeError, LifecycleError, StreamError};
pub use policy::{ErrorPolicy, PolicyAction};
pub use supervisor::{LifecycleState, Supervisor};
pub use task::{for_each_record, RecordHandler};
