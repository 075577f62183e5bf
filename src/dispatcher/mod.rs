use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use crate::config::{AppConfig, ReceiverConfig, ReaperConfig, StoreConfig};
use crate::events::{
    COMMUNICATION_ERROR_EVENT, EventEmitter, VALUES_EVICTED_EVENT, VALUES_UPDATED_EVENT,
    communication_error_payload, updated_payload,
};
use crate::logging::{LogLevel, Logger};
use crate::pools::{WorkerPool, WorkerRecord};
use crate::queue::{Dequeue, IngestionQueue, IngestionReceiver, QueuedMessage};
use crate::reaper::{Reaper, ReaperError};
use crate::receiver::{ConnectionWorker, WorkerContext, WorkerControl};
use crate::server::{AcceptedConnection, ServerError, TcpServer};
use crate::store::{StoreReader, VariableStore};
use crate::wire::CommunicationError;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum DispatcherError {
    Server(ServerError),
    Reaper(ReaperError),
    Spawn { role: &'static str, source: io::Error },
    LocalAddr(io::Error),
}

impl fmt::Display for DispatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(source) => write!(f, "{source}"),
            Self::Reaper(source) => write!(f, "{source}"),
            Self::Spawn { role, source } => write!(f, "failed to spawn {role} thread: {source}"),
            Self::LocalAddr(source) => write!(f, "failed to read local address: {source}"),
        }
    }
}

impl std::error::Error for DispatcherError {}

impl From<ServerError> for DispatcherError {
    fn from(value: ServerError) -> Self {
        Self::Server(value)
    }
}

impl From<ReaperError> for DispatcherError {
    fn from(value: ReaperError) -> Self {
        Self::Reaper(value)
    }
}

/// A bound but not yet running variable server.
pub struct VariableServer {
    server: TcpServer,
    receiver: ReceiverConfig,
    reaper: ReaperConfig,
    store_config: StoreConfig,
    store: VariableStore,
    logger: Arc<Logger>,
    emitter: Arc<EventEmitter>,
}

impl VariableServer {
    /// Binding is the only step that can fail fatally at startup.
    pub fn bind(
        app_config: &AppConfig,
        logger: Arc<Logger>,
        emitter: Arc<EventEmitter>,
    ) -> Result<Self, DispatcherError> {
        let server = TcpServer::from_app_config(app_config)?;

        Ok(Self {
            server,
            receiver: app_config.receiver,
            reaper: app_config.reaper,
            store_config: app_config.store,
            store: VariableStore::new(),
            logger,
            emitter,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Spawns the accept loop, the consumer loop and the reaper.
    pub fn start(self) -> Result<RunningServer, DispatcherError> {
        let local_addr = self.server.local_addr().map_err(DispatcherError::LocalAddr)?;
        let stop = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(WorkerPool::new());
        let reader = self.store.reader();
        let (sender, receiver) = IngestionQueue::new().split();

        let mut reaper = Reaper::new(
            self.reaper,
            Arc::clone(&pool),
            reader.clone(),
            Arc::clone(&self.logger),
        )?;

        let consumer = ConsumerLoop {
            receiver,
            store: self.store,
            emitter: Arc::clone(&self.emitter),
            logger: Arc::clone(&self.logger),
            stop: Arc::clone(&stop),
            eviction: Eviction::from_config(self.store_config, reaper.interval()),
        };
        let consumer = thread::Builder::new()
            .name("vizdebug-consumer".to_owned())
            .spawn(move || consumer.run())
            .map_err(|source| DispatcherError::Spawn {
                role: "consumer",
                source,
            })?;

        let accept = AcceptLoop {
            server: self.server,
            pool: Arc::clone(&pool),
            context: WorkerContext {
                config: self.receiver,
                queue: sender,
                emitter: Arc::clone(&self.emitter),
                logger: Arc::clone(&self.logger),
            },
            stop: Arc::clone(&stop),
        };
        let accept = match thread::Builder::new()
            .name("vizdebug-accept".to_owned())
            .spawn(move || accept.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                stop.store(true, Ordering::SeqCst);
                let _ = consumer.join();
                return Err(DispatcherError::Spawn {
                    role: "accept",
                    source,
                });
            }
        };

        if let Err(error) = reaper.start() {
            stop.store(true, Ordering::SeqCst);
            let _ = accept.join();
            let _ = consumer.join();
            return Err(error.into());
        }

        Ok(RunningServer {
            local_addr,
            stop,
            pool,
            reader,
            reaper,
            accept: Some(accept),
            consumer: Some(consumer),
            logger: self.logger,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub aborted_workers: usize,
}

/// Handle on the running server threads. Dropping it shuts the server down.
pub struct RunningServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    reader: StoreReader,
    reaper: Reaper,
    accept: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    logger: Arc<Logger>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reader(&self) -> StoreReader {
        self.reader.clone()
    }

    pub fn live_workers(&self) -> usize {
        self.pool.count()
    }

    /// Stops accepting, aborts in-flight reads and stops the consumer without
    /// draining the queue. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> ShutdownReport {
        self.stop.store(true, Ordering::SeqCst);

        // The listener is dropped when the accept thread returns.
        if let Some(accept) = self.accept.take() {
            if accept.join().is_err() {
                self.logger
                    .error(Some("dispatcher::accept"), "accept thread panicked");
            }
        }
        let aborted_workers = self.pool.abort_all();
        if let Err(error) = self.reaper.stop() {
            self.logger.error(Some("dispatcher::reaper"), &error.to_string());
        }
        if let Some(consumer) = self.consumer.take() {
            if consumer.join().is_err() {
                self.logger
                    .error(Some("dispatcher::consumer"), "consumer thread panicked");
            }
        }

        ShutdownReport { aborted_workers }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcceptLoop {
    server: TcpServer,
    pool: Arc<WorkerPool>,
    context: WorkerContext,
    stop: Arc<AtomicBool>,
}

impl AcceptLoop {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.server.try_accept() {
                Ok(Some(connection)) => self.spawn_worker(connection),
                Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(error) => {
                    self.context
                        .logger
                        .warn(Some("dispatcher::accept"), &error.to_string());
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    fn spawn_worker(&self, connection: AcceptedConnection) {
        let AcceptedConnection {
            id,
            stream,
            peer_addr,
        } = connection;
        let logger = &self.context.logger;

        let abort_handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(error) => {
                logger.warn(
                    Some("dispatcher::accept"),
                    &format!("dropping connection {id} from {peer_addr}: {error}"),
                );
                return;
            }
        };

        let control = WorkerControl::new();
        let worker = ConnectionWorker::new(
            id,
            peer_addr,
            stream,
            self.context.clone(),
            control.clone(),
        );
        let thread = match thread::Builder::new()
            .name(format!("vizdebug-worker-{id}"))
            .spawn(move || {
                worker.run();
            }) {
            Ok(thread) => thread,
            Err(error) => {
                logger.error(
                    Some("dispatcher::accept"),
                    &format!("failed to spawn worker for connection {id}: {error}"),
                );
                return;
            }
        };

        if let Err(error) = self
            .pool
            .register(WorkerRecord::new(id, peer_addr, control, abort_handle, thread))
        {
            logger.error(Some("dispatcher::accept"), &error.to_string());
            return;
        }

        if logger.enabled(LogLevel::Debug) {
            let Ok(snapshot) = self.pool.snapshot(id) else {
                // Already reaped or aborted.
                return;
            };
            logger.log(
                LogLevel::Debug,
                Some("dispatcher::accept"),
                "Accepted producer connection",
                Some(json!({
                    "worker_id": snapshot.worker_id,
                    "peer_addr": snapshot.peer_addr.to_string(),
                    "accepted_at": snapshot.accepted_at.to_rfc3339(),
                    "state": snapshot.state.to_string(),
                    "live_workers": self.pool.count()
                })),
            );
        }
    }
}

/// Optional removal of identities that stopped reporting. Runs on the
/// consumer thread so the store keeps a single writer.
struct Eviction {
    max_age: chrono::Duration,
    every: Duration,
    last_run: Instant,
}

impl Eviction {
    fn from_config(config: StoreConfig, every: Duration) -> Option<Self> {
        if config.evict_after_seconds == 0 {
            return None;
        }
        let seconds = i64::try_from(config.evict_after_seconds).unwrap_or(i64::MAX);
        Some(Self {
            max_age: chrono::Duration::try_seconds(seconds).unwrap_or(chrono::Duration::MAX),
            every,
            last_run: Instant::now(),
        })
    }

    fn due(&mut self) -> bool {
        if self.last_run.elapsed() < self.every {
            return false;
        }
        self.last_run = Instant::now();
        true
    }
}

struct ConsumerLoop {
    receiver: IngestionReceiver,
    store: VariableStore,
    emitter: Arc<EventEmitter>,
    logger: Arc<Logger>,
    stop: Arc<AtomicBool>,
    eviction: Option<Eviction>,
}

impl ConsumerLoop {
    fn run(mut self) {
        // Whatever is still queued once `stop` is set is dropped with the
        // receiver.
        while !self.stop.load(Ordering::SeqCst) {
            match self.receiver.dequeue_timeout(CONSUMER_POLL_INTERVAL) {
                Ok(queued) => self.apply(queued),
                Err(Dequeue::Empty) => {}
                Err(Dequeue::Disconnected) => break,
            }
            self.evict_stale();
        }
    }

    fn apply(&self, queued: QueuedMessage) {
        let QueuedMessage {
            worker_id,
            received_at,
            message,
        } = queued;

        match self.store.apply(message) {
            Ok(identity) => {
                if self.logger.enabled(LogLevel::Verbose) {
                    let queued_for_ms = (Utc::now() - received_at).num_milliseconds();
                    self.logger.log(
                        LogLevel::Verbose,
                        Some("dispatcher::consumer"),
                        "Snapshot applied",
                        Some(json!({
                            "identity": identity,
                            "worker_id": worker_id,
                            "queued_for_ms": queued_for_ms
                        })),
                    );
                }
                self.emitter
                    .emit_logged(VALUES_UPDATED_EVENT, Some(updated_payload(&identity)));
            }
            Err(error) => {
                self.logger.warn(
                    Some("dispatcher::consumer"),
                    &format!("message from connection {worker_id} not applied: {error}"),
                );
                self.emitter.emit_logged(
                    COMMUNICATION_ERROR_EVENT,
                    Some(communication_error_payload(
                        CommunicationError::Malformed,
                        Some(worker_id),
                        &error.to_string(),
                    )),
                );
            }
        }
    }

    fn evict_stale(&mut self) {
        let Some(eviction) = self.eviction.as_mut() else {
            return;
        };
        if !eviction.due() {
            return;
        }

        let max_age = eviction.max_age;
        for identity in self.store.evict_older_than(max_age, Utc::now()) {
            self.logger.info(
                Some("dispatcher::consumer"),
                &format!("evicted '{identity}' after {} s without updates", max_age.num_seconds()),
            );
            self.emitter
                .emit_logged(VALUES_EVICTED_EVENT, Some(updated_payload(&identity)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::Duration;

    use serde_json::{Map, Value, json};

    use crate::config::AppConfig;
    use crate::events::{COMMUNICATION_ERROR_EVENT, EventEmitter, VALUES_UPDATED_EVENT};
    use crate::logging::Logger;
    use crate::producer::{send_raw, send_snapshot};
    use crate::wire::CommunicationError;
    use crate::wire::codec::{encode, frame_payload};
    use crate::wire::message::VariableSnapshot;

    use super::{RunningServer, VariableServer};

    const WAIT: Duration = Duration::from_secs(3);
    const SEND_TIMEOUT: Duration = Duration::from_secs(1);

    struct TestServer {
        running: RunningServer,
        updated: mpsc::Receiver<String>,
        errors: mpsc::Receiver<CommunicationError>,
    }

    fn start(configure: impl FnOnce(&mut AppConfig)) -> TestServer {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_owned();
        config.server.port = 0;
        configure(&mut config);

        let emitter = Arc::new(EventEmitter::new());
        let (updated_tx, updated) = mpsc::channel();
        let updated_tx = Mutex::new(updated_tx);
        emitter.on(VALUES_UPDATED_EVENT, move |event| {
            let identity = event.identity().unwrap_or_default().to_owned();
            updated_tx
                .lock()
                .expect("sender lock poisoned")
                .send(identity)
                .map_err(|error| error.to_string())
        });
        let (errors_tx, errors) = mpsc::channel();
        let errors_tx = Mutex::new(errors_tx);
        emitter.on(COMMUNICATION_ERROR_EVENT, move |event| {
            let kind = event
                .communication_error()
                .ok_or_else(|| "missing kind".to_owned())?;
            errors_tx
                .lock()
                .expect("sender lock poisoned")
                .send(kind)
                .map_err(|error| error.to_string())
        });

        let server = VariableServer::bind(&config, Arc::new(Logger::silent()), emitter)
            .expect("server should bind");
        let running = server.start().expect("server should start");

        TestServer {
            running,
            updated,
            errors,
        }
    }

    fn vars(value: Value) -> VariableSnapshot {
        match value {
            Value::Object(vars) => vars,
            other => panic!("test vars must be an object, got {other}"),
        }
    }

    fn assert_no_more_errors(server: &TestServer) {
        assert!(
            server.errors.recv_timeout(Duration::from_millis(150)).is_err(),
            "expected exactly one error event"
        );
    }

    #[test]
    fn valid_frame_round_trips_into_store() {
        let server = start(|_| {});
        let snapshot = vars(json!({
            "i": 42,
            "pi": 3.5,
            "flag": true,
            "label": "loop",
            "arr": [1, 2, 3],
            "nested": {"inner": [0.5, null]}
        }));

        send_snapshot(server.running.local_addr(), "a.out", &snapshot, SEND_TIMEOUT)
            .expect("send should succeed");

        assert_eq!(server.updated.recv_timeout(WAIT).expect("update event"), "a.out");
        let reader = server.running.reader();
        assert_eq!(reader.get("a.out"), Some(snapshot));
        assert!(reader.get_timestamp("a.out").is_some());
    }

    #[test]
    fn under_size_frame_is_reported_once_and_not_stored() {
        let server = start(|_| {});
        let frame = encode("a.out", &vars(json!({"x": 1}))).expect("frame should encode");

        send_raw(server.running.local_addr(), &frame[..frame.len() - 3], SEND_TIMEOUT)
            .expect("send should succeed");

        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::UnderSize
        );
        assert_no_more_errors(&server);
        assert!(server.running.reader().all_identities().is_empty());
    }

    #[test]
    fn over_size_frame_is_reported_once_and_not_stored() {
        let server = start(|_| {});
        let mut frame = encode("a.out", &vars(json!({"x": 1}))).expect("frame should encode");
        frame.extend_from_slice(b"trailing");

        send_raw(server.running.local_addr(), &frame, SEND_TIMEOUT).expect("send should succeed");

        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::OverSize
        );
        assert_no_more_errors(&server);
        assert!(server.running.reader().all_identities().is_empty());
    }

    #[test]
    fn short_connection_reports_no_size() {
        let server = start(|_| {});

        send_raw(server.running.local_addr(), &[0, 0, 1], SEND_TIMEOUT)
            .expect("send should succeed");

        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::NoSize
        );
        assert_no_more_errors(&server);
    }

    #[test]
    fn invalid_json_and_missing_fields_are_rejected() {
        let server = start(|_| {});
        let addr = server.running.local_addr();

        send_raw(addr, &frame_payload(b"not json").expect("frame"), SEND_TIMEOUT)
            .expect("send should succeed");
        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::DecodeError
        );

        let payload = serde_json::to_vec(&json!({"identity": "a.out"})).expect("json");
        send_raw(addr, &frame_payload(&payload).expect("frame"), SEND_TIMEOUT)
            .expect("send should succeed");
        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::Malformed
        );

        assert!(server.running.reader().all_identities().is_empty());
    }

    #[test]
    fn empty_identity_is_rejected_at_apply_time() {
        let server = start(|_| {});

        send_snapshot(server.running.local_addr(), "", &Map::new(), SEND_TIMEOUT)
            .expect("send should succeed");

        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::Malformed
        );
        assert!(server.updated.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(server.running.reader().all_identities().is_empty());
    }

    #[test]
    fn silent_connection_times_out_and_is_reaped() {
        let server = start(|config| {
            config.receiver.timeout_ms = 100;
            config.reaper.interval_ms = 100;
        });
        let mut client =
            TcpStream::connect(server.running.local_addr()).expect("client should connect");
        client
            .set_read_timeout(Some(WAIT))
            .expect("read timeout should apply");

        assert_eq!(
            server.errors.recv_timeout(WAIT).expect("error event"),
            CommunicationError::Timeout
        );

        let mut buf = [0_u8; 4];
        let read = client.read(&mut buf).expect("server should close the socket");
        assert_eq!(read, 0);

        // One reaper interval plus scheduling slack.
        thread::sleep(Duration::from_millis(350));
        assert_eq!(server.running.live_workers(), 0);
    }

    #[test]
    fn later_message_for_same_identity_replaces_earlier() {
        let server = start(|_| {});
        let addr = server.running.local_addr();
        let reader = server.running.reader();

        send_snapshot(addr, "gdb", &vars(json!({"a": 1, "b": 2})), SEND_TIMEOUT)
            .expect("send should succeed");
        server.updated.recv_timeout(WAIT).expect("first update");
        let first_at = reader.get_timestamp("gdb").expect("first timestamp");

        thread::sleep(Duration::from_millis(5));
        send_snapshot(addr, "gdb", &vars(json!({"c": 3})), SEND_TIMEOUT)
            .expect("send should succeed");
        server.updated.recv_timeout(WAIT).expect("second update");

        assert_eq!(reader.get("gdb"), Some(vars(json!({"c": 3}))));
        let second_at = reader.get_timestamp("gdb").expect("second timestamp");
        assert!(second_at > first_at);
        assert_eq!(reader.all_identities().len(), 1);
    }

    #[test]
    fn concurrent_producers_with_distinct_identities_all_land() {
        const PRODUCERS: usize = 24;
        let server = start(|_| {});
        let addr = server.running.local_addr();

        let senders: Vec<_> = (0..PRODUCERS)
            .map(|n| {
                thread::spawn(move || {
                    let snapshot = vars(json!({"n": n, "squares": [n * n, n * n * n]}));
                    send_snapshot(addr, &format!("producer-{n}"), &snapshot, SEND_TIMEOUT)
                        .expect("send should succeed");
                })
            })
            .collect();
        for sender in senders {
            sender.join().expect("sender should finish");
        }

        for _ in 0..PRODUCERS {
            server.updated.recv_timeout(WAIT).expect("update event");
        }

        let reader = server.running.reader();
        assert_eq!(reader.all_identities().len(), PRODUCERS);
        for n in 0..PRODUCERS {
            assert_eq!(
                reader.get(&format!("producer-{n}")),
                Some(vars(json!({"n": n, "squares": [n * n, n * n * n]})))
            );
        }
    }

    #[test]
    fn identities_only_appear_after_a_completed_frame() {
        let server = start(|config| config.receiver.timeout_ms = 2_000);
        let reader = server.running.reader();
        let frame = encode("pending", &vars(json!({"x": 1}))).expect("frame should encode");

        let mut client =
            TcpStream::connect(server.running.local_addr()).expect("client should connect");
        client.write_all(&frame).expect("write should succeed");
        thread::sleep(Duration::from_millis(100));
        assert!(reader.all_identities().is_empty());

        client.shutdown(Shutdown::Write).expect("shutdown should succeed");
        assert_eq!(server.updated.recv_timeout(WAIT).expect("update event"), "pending");
        assert!(reader.all_identities().contains("pending"));
    }

    #[test]
    fn shutdown_aborts_in_flight_connections() {
        let mut server = start(|config| config.receiver.timeout_ms = 10_000);
        let mut client =
            TcpStream::connect(server.running.local_addr()).expect("client should connect");
        client
            .set_read_timeout(Some(WAIT))
            .expect("read timeout should apply");
        client.write_all(&[0, 0, 0, 9]).expect("write should succeed");

        for _ in 0..100 {
            if server.running.live_workers() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.running.live_workers(), 1);

        let report = server.running.shutdown();
        assert_eq!(report.aborted_workers, 1);

        let mut buf = [0_u8; 4];
        assert_eq!(client.read(&mut buf).expect("socket should be closed"), 0);
        assert!(server.errors.recv_timeout(Duration::from_millis(150)).is_err());
        assert!(server.running.reader().all_identities().is_empty());
    }

    #[test]
    fn stale_identities_are_evicted_when_configured() {
        let server = start(|config| {
            config.store.evict_after_seconds = 1;
            config.reaper.interval_ms = 100;
        });
        let reader = server.running.reader();

        send_snapshot(server.running.local_addr(), "short-lived", &Map::new(), SEND_TIMEOUT)
            .expect("send should succeed");
        server.updated.recv_timeout(WAIT).expect("update event");
        assert!(reader.all_identities().contains("short-lived"));

        thread::sleep(Duration::from_millis(2_300));
        assert!(reader.all_identities().is_empty());
    }
}
