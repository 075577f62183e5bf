use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::ReceiverConfig;
use crate::events::{
    COMMUNICATION_ERROR_EVENT, EventEmitter, SOCKET_ERROR_EVENT, communication_error_payload,
    socket_error_payload,
};
use crate::logging::{LogLevel, Logger};
use crate::queue::IngestionSender;
use crate::utils::timing::Stopwatch;
use crate::wire::CommunicationError;
use crate::wire::codec::{self, FrameError};

const LOG_CONTEXT: &str = "receiver";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Open,
    ClosedValid,
    ClosedInvalid(CommunicationError),
    TimedOut,
    SocketError,
    Aborted,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ClosedValid => "closed-valid",
            Self::ClosedInvalid(_) => "closed-invalid",
            Self::TimedOut => "timed-out",
            Self::SocketError => "socket-error",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedInvalid(kind) => write!(f, "{} ({kind})", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// How a connection ended. Exactly one of these is produced per worker.
#[derive(Debug)]
pub enum WorkerOutcome {
    ClosedValid { identity: String, bytes: usize },
    ClosedInvalid(FrameError),
    TimedOut { bytes: usize },
    SocketError(io::Error),
    Aborted,
}

impl WorkerOutcome {
    pub fn state(&self) -> WorkerState {
        match self {
            Self::ClosedValid { .. } => WorkerState::ClosedValid,
            Self::ClosedInvalid(error) => WorkerState::ClosedInvalid(CommunicationError::from(error)),
            Self::TimedOut { .. } => WorkerState::TimedOut,
            Self::SocketError(_) => WorkerState::SocketError,
            Self::Aborted => WorkerState::Aborted,
        }
    }
}

/// Shared between a running worker and the live-worker table.
///
/// The table uses it to observe completion and to request cancellation; the
/// worker only ever moves it from `Open` to one terminal state.
#[derive(Clone, Debug)]
pub struct WorkerControl {
    state: Arc<Mutex<WorkerState>>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkerState::Open)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state lock poisoned")
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn finish(&self, terminal: WorkerState) {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        if !state.is_terminal() {
            *state = terminal;
        }
    }
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker needs besides its socket; cloned once per connection.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: ReceiverConfig,
    pub queue: IngestionSender,
    pub emitter: Arc<EventEmitter>,
    pub logger: Arc<Logger>,
}

/// Drives one accepted connection from accept to a terminal state.
pub struct ConnectionWorker {
    id: u64,
    peer_addr: SocketAddr,
    stream: TcpStream,
    timeout: Duration,
    read_chunk_bytes: usize,
    queue: IngestionSender,
    emitter: Arc<EventEmitter>,
    logger: Arc<Logger>,
    control: WorkerControl,
}

impl ConnectionWorker {
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        stream: TcpStream,
        context: WorkerContext,
        control: WorkerControl,
    ) -> Self {
        Self {
            id,
            peer_addr,
            stream,
            timeout: Duration::from_millis(context.config.timeout_ms),
            read_chunk_bytes: context.config.read_chunk_bytes.max(1),
            queue: context.queue,
            emitter: context.emitter,
            logger: context.logger,
            control,
        }
    }

    /// Runs to completion on the calling thread. Failures are reported as
    /// events and in the returned outcome, never as panics.
    pub fn run(mut self) -> WorkerOutcome {
        let stopwatch = Stopwatch::start();
        let outcome = self.receive();

        let _ = self.stream.shutdown(Shutdown::Both);
        self.report(&outcome, &stopwatch);
        self.control.finish(outcome.state());
        outcome
    }

    fn receive(&mut self) -> WorkerOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut buffer = Vec::new();
        let mut chunk = vec![0_u8; self.read_chunk_bytes];

        loop {
            if self.control.is_cancelled() {
                return WorkerOutcome::Aborted;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WorkerOutcome::TimedOut {
                    bytes: buffer.len(),
                };
            }
            if let Err(source) = self.stream.set_read_timeout(Some(remaining)) {
                return WorkerOutcome::SocketError(source);
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // A shutdown abort also surfaces as EOF; the partial
                    // buffer must not be decoded then.
                    if self.control.is_cancelled() {
                        return WorkerOutcome::Aborted;
                    }
                    return self.complete(&buffer);
                }
                Ok(size) => buffer.extend_from_slice(&chunk[..size]),
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(error) => {
                    if self.control.is_cancelled() {
                        return WorkerOutcome::Aborted;
                    }
                    return WorkerOutcome::SocketError(error);
                }
            }
        }
    }

    fn complete(&self, buffer: &[u8]) -> WorkerOutcome {
        match codec::decode(buffer) {
            Ok(message) => {
                let identity = message.identity.clone();
                match self.queue.enqueue(self.id, message) {
                    Ok(()) => WorkerOutcome::ClosedValid {
                        identity,
                        bytes: buffer.len(),
                    },
                    // Consumer already stopped: the server is shutting down.
                    Err(_) => WorkerOutcome::Aborted,
                }
            }
            Err(error) => WorkerOutcome::ClosedInvalid(error),
        }
    }

    fn report(&self, outcome: &WorkerOutcome, stopwatch: &Stopwatch) {
        let elapsed = stopwatch.elapsed_human_friendly();

        match outcome {
            WorkerOutcome::ClosedValid { identity, bytes } => {
                if self.logger.enabled(LogLevel::Debug) {
                    self.logger.log(
                        LogLevel::Debug,
                        Some(LOG_CONTEXT),
                        &format!("connection {} delivered a snapshot in {elapsed}", self.id),
                        Some(json!({
                            "worker_id": self.id,
                            "peer_addr": self.peer_addr.to_string(),
                            "identity": identity,
                            "bytes": bytes
                        })),
                    );
                }
            }
            WorkerOutcome::ClosedInvalid(error) => {
                let kind = CommunicationError::from(error);
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    &format!("connection {} rejected after {elapsed}: {error}", self.id),
                    Some(json!({
                        "worker_id": self.id,
                        "peer_addr": self.peer_addr.to_string(),
                        "kind": kind.as_str()
                    })),
                );
                self.emitter.emit_logged(
                    COMMUNICATION_ERROR_EVENT,
                    Some(communication_error_payload(kind, Some(self.id), &error.to_string())),
                );
            }
            WorkerOutcome::TimedOut { bytes } => {
                let detail = format!(
                    "no disconnect within {} ms ({bytes} bytes buffered)",
                    self.timeout.as_millis()
                );
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("connection {} from {} timed out: {detail}", self.id, self.peer_addr),
                );
                self.emitter.emit_logged(
                    COMMUNICATION_ERROR_EVENT,
                    Some(communication_error_payload(
                        CommunicationError::Timeout,
                        Some(self.id),
                        &detail,
                    )),
                );
            }
            WorkerOutcome::SocketError(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!(
                        "connection {} from {} failed after {elapsed}: {error}",
                        self.id, self.peer_addr
                    ),
                );
                self.emitter
                    .emit_logged(SOCKET_ERROR_EVENT, Some(socket_error_payload(self.id, error)));
            }
            WorkerOutcome::Aborted => {
                self.logger.debug(
                    Some(LOG_CONTEXT),
                    &format!("connection {} aborted after {elapsed}", self.id),
                );
            }
        }
    }
}
