//! Change stream polling, modelled after the DynamoDB Streams event source mapping.
//!
//! Each stream binding gets its own poller task. The poller finds the first shard of the table's stream,
//! reads it from the trim horizon and passes every non-empty batch to all bound handlers, one handler at a time.
//! Cursors live in memory only, so a restart re-delivers everything from the horizon.

use crate::config::{StreamConfig, MAX_BATCH_SIZE};
use crate::error::{EmulatorError, StreamError};
use crate::lambda::{invoke, Handler, InvocationContext, Resolver};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub mod dynamodb;

/// Where a new cursor starts reading the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// The oldest record still available
    TrimHorizon,
}

/// The result of one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    /// In shard order, possibly empty
    pub records: Vec<Value>,
    /// None if the shard is closed and fully read
    pub next_token: Option<String>,
}

/// A shard-based change stream, e.g. DynamoDB Streams.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Returns the ID of the latest stream of the table.
    async fn describe_stream(&self, table: &str) -> Result<String, StreamError>;

    /// Returns shard IDs, parents first.
    async fn list_shards(&self, stream_id: &str) -> Result<Vec<String>, StreamError>;

    /// Returns an iterator token for reading the shard from `position`.
    async fn get_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<String, StreamError>;

    /// Reads up to `limit` records at the iterator position.
    async fn fetch(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamError>;
}

/// A stream with the handlers that get its records.
#[derive(Clone)]
pub struct StreamBinding {
    pub table: String,
    pub poll_interval: Duration,
    pub batch_size: i32,
    pub handlers: Vec<Arc<dyn Handler>>,
}

impl StreamBinding {
    /// Resolves the handlers of the stream. Handlers that fail to resolve are logged and skipped.
    /// Returns None if the stream is disabled, its polling settings are out of range
    /// or no handler could be bound.
    pub fn resolve(config: &StreamConfig, resolver: &dyn Resolver) -> Option<Self> {
        if !config.enabled {
            info!("Stream on {} is disabled", config.table);
            return None;
        }

        if let Err(e) = validate(config) {
            error!("Stream on {} skipped: {e}", config.table);
            return None;
        }

        let mut handlers = Vec::with_capacity(config.bindings.len());
        for spec in &config.bindings {
            match resolver.resolve(spec) {
                Ok(handler) => {
                    info!("Bound {} to DynamoDB stream on {}", handler.name(), config.table);
                    handlers.push(handler);
                }
                Err(e) => error!("{} failed to load: {e}", spec.display_name()),
            }
        }

        if handlers.is_empty() {
            return None;
        }

        Some(Self {
            table: config.table.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size,
            handlers,
        })
    }
}

/// GetRecords rejects a limit outside of 1..=1000, and a zero interval would poll in a tight loop.
fn validate(config: &StreamConfig) -> Result<(), EmulatorError> {
    if !(1..=MAX_BATCH_SIZE).contains(&config.batch_size) {
        return Err(EmulatorError::Configuration(format!(
            "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
            config.batch_size
        )));
    }

    if config.poll_interval_ms == 0 {
        return Err(EmulatorError::Configuration("poll_interval_ms must be above 0".to_owned()));
    }

    Ok(())
}

/// Position of the poller in a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCursor {
    pub shard_id: String,
    pub iterator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Uninitialized,
    /// Looking for the stream and shard to read from
    Discovering,
    Polling,
    Stopped,
}

/// Reads one stream binding. Owns its cursor, nothing else can see it.
pub struct StreamPoller {
    binding: StreamBinding,
    source: Arc<dyn StreamSource>,
    timeout: Option<Duration>,
    state: PollerState,
    stream_id: Option<String>,
    cursor: Option<ShardCursor>,
    /// Closed shards that were read to the end
    exhausted: HashSet<String>,
}

impl StreamPoller {
    pub fn new(binding: StreamBinding, source: Arc<dyn StreamSource>, timeout: Option<Duration>) -> Self {
        Self {
            binding,
            source,
            timeout,
            state: PollerState::Uninitialized,
            stream_id: None,
            cursor: None,
            exhausted: HashSet::new(),
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn cursor(&self) -> Option<&ShardCursor> {
        self.cursor.as_ref()
    }

    /// Polls until the shutdown flag is set. Errors never end the loop.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!("DynamoDB STREAM: polling {} every {:?}", self.binding.table, self.binding.poll_interval);

        while !shutdown.is_stopped() {
            let pause = self.step().await;
            shutdown.sleep(pause).await;
        }

        self.state = PollerState::Stopped;
        info!("DynamoDB STREAM: {} poller stopped", self.binding.table);
    }

    /// Runs one iteration of the state machine and returns how long to wait before the next one.
    pub async fn step(&mut self) -> Duration {
        let t0 = Instant::now();

        match self.state {
            PollerState::Uninitialized | PollerState::Discovering => {
                self.state = PollerState::Discovering;
                match self.discover().await {
                    Ok(cursor) => {
                        info!(
                            "DynamoDB STREAM: reading {} shard {}",
                            self.binding.table, cursor.shard_id
                        );
                        self.cursor = Some(cursor);
                        self.state = PollerState::Polling;
                        // start reading right away
                        return Duration::ZERO;
                    }
                    Err(e) => warn!("DynamoDB STREAM: cannot read {}: {e}", self.binding.table),
                }
            }
            PollerState::Polling => self.poll().await,
            PollerState::Stopped => {}
        }

        // never sleep a negative duration if the iteration took longer than the interval
        self.binding.poll_interval.saturating_sub(t0.elapsed())
    }

    /// Finds the stream and the first shard that was not read to the end and positions a cursor at its trim horizon.
    async fn discover(&mut self) -> Result<ShardCursor, StreamError> {
        let stream_id = match &self.stream_id {
            Some(v) => v.clone(),
            None => {
                let v = self.source.describe_stream(&self.binding.table).await?;
                self.stream_id = Some(v.clone());
                v
            }
        };

        let shards = match self.source.list_shards(&stream_id).await {
            Ok(v) => v,
            Err(e) => {
                // the stream may have been replaced, e.g. by re-creating the table
                self.stream_id = None;
                return Err(e);
            }
        };

        // only one shard is read at a time
        let shard_id = shards
            .into_iter()
            .find(|s| !self.exhausted.contains(s))
            .ok_or_else(|| StreamError::NotFound(format!("no open shards in {stream_id}")))?;

        let iterator = self
            .source
            .get_iterator(&stream_id, &shard_id, StartPosition::TrimHorizon)
            .await?;

        Ok(ShardCursor { shard_id, iterator })
    }

    /// Fetches the next batch, delivers it and advances the cursor.
    async fn poll(&mut self) {
        let Some(cursor) = self.cursor.as_mut() else {
            self.state = PollerState::Discovering;
            return;
        };

        let batch = match self.source.fetch(&cursor.iterator, self.binding.batch_size).await {
            Ok(v) => v,
            Err(StreamError::NotFound(e)) => {
                warn!("DynamoDB STREAM: {} is gone ({e}), rediscovering", cursor.shard_id);
                self.cursor = None;
                self.stream_id = None;
                self.state = PollerState::Discovering;
                return;
            }
            Err(e) => {
                // keep the cursor and try again on the next tick
                warn!("DynamoDB STREAM: failed to get records from {}: {e}", self.binding.table);
                return;
            }
        };

        if !batch.records.is_empty() {
            debug!("DynamoDB STREAM: {} record(s) from {}", batch.records.len(), cursor.shard_id);
            let event = json!({ "Records": batch.records });
            deliver(&self.binding.handlers, &event, self.timeout).await;
        }

        match batch.next_token {
            Some(token) => cursor.iterator = token,
            None => {
                info!("DynamoDB STREAM: shard {} is closed", cursor.shard_id);
                self.exhausted.insert(cursor.shard_id.clone());
                self.cursor = None;
                self.state = PollerState::Discovering;
            }
        }
    }
}

/// Invokes every handler with the same batch, one after another.
/// A failing handler is logged and does not stop the others.
async fn deliver(handlers: &[Arc<dyn Handler>], event: &Value, timeout: Option<Duration>) {
    for handler in handlers {
        let ctx = InvocationContext::stream(handler.name());
        match invoke(handler, event.clone(), ctx, timeout).await {
            Ok(_) => info!("DynamoDB STREAM: invoked {}", handler.name()),
            Err(e) => error!("DynamoDB STREAM: {e}"),
        }
    }
}

/// Starts one poller task per binding.
pub fn spawn_pollers(
    bindings: Vec<StreamBinding>,
    source: Arc<dyn StreamSource>,
    timeout: Option<Duration>,
    shutdown: &Shutdown,
) -> Vec<JoinHandle<()>> {
    bindings
        .into_iter()
        .map(|binding| {
            let poller = StreamPoller::new(binding, Arc::clone(&source), timeout);
            tokio::spawn(poller.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HandlerSpec};
    use crate::lambda::{handler_fn, Error, Registry};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves pre-defined batches. The iterator token is the index of the next batch,
    /// so a poller that does not advance its cursor gets the same batch again.
    struct FakeSource {
        batches: Vec<Vec<Value>>,
        shards: Vec<String>,
        /// Errors returned by fetch before any batch is served
        fetch_errors: Mutex<VecDeque<StreamError>>,
        describe_errors: Mutex<VecDeque<StreamError>>,
        /// The last batch closes the shard if set
        close_after_last: bool,
        fetches: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn new(batches: Vec<Vec<Value>>) -> Self {
            Self {
                batches,
                shards: vec!["shard-0".to_owned()],
                fetch_errors: Mutex::new(VecDeque::new()),
                describe_errors: Mutex::new(VecDeque::new()),
                close_after_last: false,
                fetches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamSource for FakeSource {
        async fn describe_stream(&self, table: &str) -> Result<String, StreamError> {
            if let Some(e) = self.describe_errors.lock().unwrap().pop_front() {
                return Err(e);
            }
            Ok(format!("arn:stream/{table}"))
        }

        async fn list_shards(&self, _stream_id: &str) -> Result<Vec<String>, StreamError> {
            Ok(self.shards.clone())
        }

        async fn get_iterator(&self, _s: &str, shard_id: &str, position: StartPosition) -> Result<String, StreamError> {
            assert_eq!(position, StartPosition::TrimHorizon);
            Ok(format!("{shard_id}:0"))
        }

        async fn fetch(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamError> {
            assert_eq!(limit, 100);
            self.fetches.lock().unwrap().push(iterator.to_owned());
            if let Some(e) = self.fetch_errors.lock().unwrap().pop_front() {
                return Err(e);
            }

            let (shard, pos) = iterator.rsplit_once(':').unwrap();
            let pos: usize = pos.parse().unwrap();
            let records = self.batches.get(pos).cloned().unwrap_or_default();
            let closed = self.close_after_last && pos + 1 >= self.batches.len();

            Ok(RecordBatch {
                records,
                next_token: if closed { None } else { Some(format!("{shard}:{}", pos + 1)) },
            })
        }
    }

    type Received = Arc<Mutex<Vec<Value>>>;

    fn recording_handler(name: &str) -> (Arc<dyn Handler>, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let handler = handler_fn(name, move |event, ctx| {
            let log = log.clone();
            async move {
                assert!(ctx.lambda.is_some());
                assert!(!ctx.services.is_intercepting());
                log.lock().unwrap().push(event);
                Ok(Value::Null)
            }
        });
        (handler, received)
    }

    fn binding(handlers: Vec<Arc<dyn Handler>>) -> StreamBinding {
        StreamBinding {
            table: "items".to_owned(),
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            handlers,
        }
    }

    fn records(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"eventID": i.to_string(), "eventName": "INSERT"})).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_each_batch_once_to_every_handler() {
        let (first, first_rx) = recording_handler("first");
        let (second, second_rx) = recording_handler("second");
        let source = Arc::new(FakeSource::new(vec![records(3)]));

        let (shutdown, trigger) = Shutdown::new();
        let poller = StreamPoller::new(binding(vec![first, second]), source.clone(), None);
        let task = tokio::spawn(poller.run(shutdown));

        // 10 polling intervals worth of empty batches after the first one
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        trigger.stop();
        task.await.unwrap();

        for rx in [first_rx, second_rx] {
            let received = rx.lock().unwrap();
            assert_eq!(received.len(), 1, "exactly one batch");
            assert_eq!(received[0], json!({"Records": records(3)}));
        }

        // the cursor moved forward on every poll, including the empty ones
        let fetches = source.fetches.lock().unwrap();
        assert!(fetches.len() >= 10);
        for (i, token) in fetches.iter().enumerate() {
            assert_eq!(token, &format!("shard-0:{i}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn state_machine_transitions() {
        let (handler, _rx) = recording_handler("h");
        let source = Arc::new(FakeSource::new(vec![records(1)]));
        let mut poller = StreamPoller::new(binding(vec![handler]), source, None);

        assert_eq!(poller.state(), PollerState::Uninitialized);
        assert!(poller.cursor().is_none());

        let pause = poller.step().await;
        assert_eq!(pause, Duration::ZERO);
        assert_eq!(poller.state(), PollerState::Polling);
        assert_eq!(poller.cursor().unwrap().iterator, "shard-0:0");

        let pause = poller.step().await;
        assert_eq!(pause, Duration::from_millis(100));
        assert_eq!(poller.cursor().unwrap().iterator, "shard-0:1");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_does_not_block_the_others() {
        let failing = handler_fn("failing", |_e, _c| async move { Err::<Value, _>(Error::from("stream failure")) });
        let panicking = handler_fn("panicking", |_e, _c| async move {
            if true {
                panic!("bug in handler");
            }
            Ok(Value::Null)
        });
        let (ok, ok_rx) = recording_handler("ok");

        let source = Arc::new(FakeSource::new(vec![records(2), records(1)]));
        let mut poller = StreamPoller::new(binding(vec![failing, panicking, ok]), source, None);

        for _ in 0..4 {
            poller.step().await;
        }

        let received = ok_rx.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(poller.state(), PollerState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_keep_the_cursor() {
        let (handler, rx) = recording_handler("h");
        let source = Arc::new(FakeSource::new(vec![records(1)]));
        source
            .fetch_errors
            .lock()
            .unwrap()
            .push_back(StreamError::Transport("connection refused".to_owned()));
        let mut poller = StreamPoller::new(binding(vec![handler]), source.clone(), None);

        poller.step().await; // discover
        let pause = poller.step().await; // error
        assert_eq!(pause, Duration::from_millis(100));
        assert_eq!(poller.state(), PollerState::Polling);
        assert_eq!(poller.cursor().unwrap().iterator, "shard-0:0");

        poller.step().await; // retry
        assert_eq!(rx.lock().unwrap().len(), 1);
        assert_eq!(source.fetches.lock().unwrap().as_slice(), ["shard-0:0", "shard-0:0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_goes_back_to_discovery() {
        let (handler, _rx) = recording_handler("h");
        let source = Arc::new(FakeSource::new(vec![records(1)]));
        source
            .fetch_errors
            .lock()
            .unwrap()
            .push_back(StreamError::NotFound("expired iterator".to_owned()));
        let mut poller = StreamPoller::new(binding(vec![handler]), source, None);

        poller.step().await;
        poller.step().await;
        assert_eq!(poller.state(), PollerState::Discovering);
        assert!(poller.cursor().is_none());

        poller.step().await;
        assert_eq!(poller.state(), PollerState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_errors_are_retried() {
        let (handler, _rx) = recording_handler("h");
        let source = Arc::new(FakeSource::new(vec![]));
        source
            .describe_errors
            .lock()
            .unwrap()
            .push_back(StreamError::Transport("DynamoDB Local is not running".to_owned()));
        let mut poller = StreamPoller::new(binding(vec![handler]), source, None);

        let pause = poller.step().await;
        assert_eq!(pause, Duration::from_millis(100));
        assert_eq!(poller.state(), PollerState::Discovering);

        poller.step().await;
        assert_eq!(poller.state(), PollerState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_shard_moves_to_the_next_one() {
        let (handler, rx) = recording_handler("h");
        let mut source = FakeSource::new(vec![records(1)]);
        source.shards = vec!["shard-0".to_owned(), "shard-1".to_owned()];
        source.close_after_last = true;
        let mut poller = StreamPoller::new(binding(vec![handler]), Arc::new(source), None);

        poller.step().await;
        poller.step().await;
        assert_eq!(poller.state(), PollerState::Discovering);

        poller.step().await;
        assert_eq!(poller.cursor().unwrap().shard_id, "shard-1");
        assert_eq!(rx.lock().unwrap().len(), 1);
    }

    #[test]
    fn binding_skips_unresolvable_handlers() {
        let (handler, _rx) = recording_handler("h");
        let registry = Registry::new().with(HandlerSpec::new("on_change", "bootstrap"), handler);

        let config = StreamConfig {
            table: "items".to_owned(),
            enabled: true,
            poll_interval_ms: 250,
            batch_size: 100,
            bindings: vec![
                HandlerSpec::new("on_change", "bootstrap"),
                HandlerSpec::new("missing", "bootstrap"),
            ],
        };
        let binding = StreamBinding::resolve(&config, &registry).unwrap();
        assert_eq!(binding.handlers.len(), 1);
        assert_eq!(binding.poll_interval, Duration::from_millis(250));

        let disabled = StreamConfig { enabled: false, ..config.clone() };
        assert!(StreamBinding::resolve(&disabled, &registry).is_none());

        let unresolvable = StreamConfig {
            bindings: vec![HandlerSpec::new("missing", "bootstrap")],
            ..config
        };
        assert!(StreamBinding::resolve(&unresolvable, &registry).is_none());
    }

    #[test]
    fn out_of_range_polling_settings_skip_the_binding() {
        let (handler, _rx) = recording_handler("h");
        let registry = Registry::new().with(HandlerSpec::new("x", "bootstrap"), handler);

        let config = Config::from_yaml(
            r#"
streams:
  - { table: zero, batch_size: 0, bindings: [ { path: x } ] }
  - { table: negative, batch_size: -5, bindings: [ { path: x } ] }
  - { table: huge, batch_size: 1001, bindings: [ { path: x } ] }
  - { table: spin, poll_interval_ms: 0, bindings: [ { path: x } ] }
  - { table: max, batch_size: 1000, poll_interval_ms: 1, bindings: [ { path: x } ] }
"#,
        )
        .unwrap();
        assert_eq!(config.streams.len(), 5);

        let bound: Vec<_> = config
            .streams
            .iter()
            .filter_map(|stream| StreamBinding::resolve(stream, &registry))
            .map(|binding| binding.table)
            .collect();
        assert_eq!(bound, vec!["max"]);
    }
}
