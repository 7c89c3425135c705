#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use partition_supervisor::memory::MemoryConnector;
use partition_supervisor::observer::SupervisorObserver;
use partition_supervisor::{
    ClientConfiguration, PolicyAction, RecordHandler, RecordStream, Supervisor, TopicPartitions,
};

pub type TestSupervisor = Supervisor<String, MemoryConnector, Recorder>;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub fn config(topics: &str, threads: usize, policy: &str) -> ClientConfiguration {
    config_with(topics, threads, policy, &[])
}

pub fn config_with(
    topics: &str,
    threads: usize,
    policy: &str,
    extra: &[(&str, &str)],
) -> ClientConfiguration {
    let mut env: HashMap<String, String> = [
        ("GROUP_ID", "test-group"),
        ("TOPICS", topics),
        ("ERROR_POLICY", policy),
    ]
    .iter()
    .chain(extra.iter())
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    env.insert("THREADS".to_string(), threads.to_string());

    ClientConfiguration::init_from_hashmap(&env).expect("failed to load test configuration")
}

/// Build a supervisor over a fresh in-memory connector, returning handles to inspect it.
pub fn supervisor(config: ClientConfiguration) -> (TestSupervisor, MemoryConnector, Recorder, Events) {
    setup_tracing();

    let connector = MemoryConnector::new();
    let recorder = Recorder::default();
    let events = Events::default();

    let supervisor = Supervisor::with_observer(
        config,
        connector.clone(),
        partition_supervisor::decode::Utf8Decoder,
        recorder.clone(),
        events.clone(),
    );

    (supervisor, connector, recorder, events)
}

pub async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    assert_or_retry_for_duration(check, Duration::from_secs(5)).await
}

pub async fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check())
}

#[derive(Debug, Clone)]
pub struct Seen {
    pub topic: String,
    pub partition: i32,
    pub record: String,
    pub at: Instant,
}

#[derive(Default)]
struct RecorderState {
    seen: Vec<Seen>,
    live: HashMap<(String, i32), usize>,
    runs: HashMap<(String, i32), usize>,
    overlapped: bool,
}

/// Handler that records every record it sees and tracks how many tasks read each stream.
///
/// `fail` makes the handler return an error, `panic` makes it panic. Both are recorded first.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.state.lock().unwrap().seen.clone()
    }

    pub fn records(&self, topic: &str, partition: i32) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter(|s| s.topic == topic && s.partition == partition)
            .map(|s| s.record)
            .collect()
    }

    pub fn has_seen(&self, topic: &str, partition: i32, record: &str) -> bool {
        self.find(topic, partition, record).is_some()
    }

    pub fn find(&self, topic: &str, partition: i32, record: &str) -> Option<Seen> {
        self.seen()
            .into_iter()
            .find(|s| s.topic == topic && s.partition == partition && s.record == record)
    }

    /// How many tasks started reading the stream.
    pub fn runs(&self, topic: &str, partition: i32) -> usize {
        let state = self.state.lock().unwrap();
        state
            .runs
            .get(&(topic.to_string(), partition))
            .copied()
            .unwrap_or_default()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.values().sum()
    }

    /// Whether two tasks ever read the same stream at once.
    pub fn overlapped(&self) -> bool {
        self.state.lock().unwrap().overlapped
    }

    fn enter(&self, key: (String, i32)) -> Live {
        let mut state = self.state.lock().unwrap();
        *state.runs.entry(key.clone()).or_default() += 1;
        let live = state.live.entry(key.clone()).or_default();
        *live += 1;
        if *live > 1 {
            state.overlapped = true;
        }
        Live {
            state: self.state.clone(),
            key,
        }
    }

    fn record(&self, key: &(String, i32), record: &str) {
        self.state.lock().unwrap().seen.push(Seen {
            topic: key.0.clone(),
            partition: key.1,
            record: record.to_string(),
            at: Instant::now(),
        });
    }
}

struct Live {
    state: Arc<Mutex<RecorderState>>,
    key: (String, i32),
}

impl Drop for Live {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(live) = state.live.get_mut(&self.key) {
                *live -= 1;
            }
        }
    }
}

#[async_trait]
impl RecordHandler<String> for Recorder {
    async fn handle(&self, topic: &str, stream: &mut RecordStream<String>) -> anyhow::Result<()> {
        let key = (topic.to_string(), stream.partition());
        let _live = self.enter(key.clone());

        while let Some(record) = stream.next_record().await? {
            self.record(&key, &record);
            match record.as_str() {
                "fail" => anyhow::bail!("failed processing {}/{}", key.0, key.1),
                "panic" => panic!("panicked processing {}/{}", key.0, key.1),
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub topic: String,
    pub stream: usize,
    pub error: String,
    pub action: PolicyAction,
    pub at: Instant,
}

#[derive(Default)]
struct EventLog {
    started: usize,
    submitted: Vec<(String, usize, bool)>,
    failed: Vec<Failure>,
    cancelled: usize,
    exhausted: Vec<(String, usize)>,
    stopped: usize,
}

/// Observer keeping every supervisor event for later assertions.
#[derive(Clone, Default)]
pub struct Events {
    log: Arc<Mutex<EventLog>>,
}

impl Events {
    pub fn started(&self) -> usize {
        self.log.lock().unwrap().started
    }

    pub fn submitted(&self) -> Vec<(String, usize, bool)> {
        self.log.lock().unwrap().submitted.clone()
    }

    pub fn restarts(&self) -> usize {
        self.submitted().iter().filter(|(_, _, restart)| *restart).count()
    }

    pub fn failed(&self) -> Vec<Failure> {
        self.log.lock().unwrap().failed.clone()
    }

    pub fn cancelled(&self) -> usize {
        self.log.lock().unwrap().cancelled
    }

    pub fn exhausted(&self) -> Vec<(String, usize)> {
        self.log.lock().unwrap().exhausted.clone()
    }

    pub fn stopped(&self) -> usize {
        self.log.lock().unwrap().stopped
    }
}

impl SupervisorObserver for Events {
    fn started(&self, _topics: &TopicPartitions, _threads: usize) {
        self.log.lock().unwrap().started += 1;
    }

    fn task_submitted(&self, topic: &str, stream: usize, restart: bool) {
        self.log
            .lock()
            .unwrap()
            .submitted
            .push((topic.to_string(), stream, restart));
    }

    fn task_failed(&self, topic: &str, stream: usize, error: &anyhow::Error, action: PolicyAction) {
        self.log.lock().unwrap().failed.push(Failure {
            topic: topic.to_string(),
            stream,
            error: error.to_string(),
            action,
            at: Instant::now(),
        });
    }

    fn task_cancelled(&self, _topic: &str, _stream: usize) {
        self.log.lock().unwrap().cancelled += 1;
    }

    fn stream_exhausted(&self, topic: &str, stream: usize) {
        self.log
            .lock()
            .unwrap()
            .exhausted
            .push((topic.to_string(), stream));
    }

    fn stopped(&self) {
        self.log.lock().unwrap().stopped += 1;
    }
}
