use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use crate::config::ReaperConfig;
use crate::logging::{LogLevel, Logger};
use crate::pools::WorkerPool;
use crate::store::{StoreReader, describe_age};

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;

const LOG_CONTEXT: &str = "reaper";

#[derive(Debug)]
pub enum ReaperError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    Spawn(std::io::Error),
    JoinFailed,
}

impl fmt::Display for ReaperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "reaper interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "reaper is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn reaper thread: {source}"),
            Self::JoinFailed => write!(f, "reaper thread join failed"),
        }
    }
}

impl std::error::Error for ReaperError {}

/// Periodic sweep of the live-worker table.
///
/// Each tick drops finished workers and, at debug level, logs how long ago
/// every known identity last reported.
pub struct Reaper {
    interval: Duration,
    pool: Arc<WorkerPool>,
    reader: StoreReader,
    logger: Arc<Logger>,
    stop_signal: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn new(
        config: ReaperConfig,
        pool: Arc<WorkerPool>,
        reader: StoreReader,
        logger: Arc<Logger>,
    ) -> Result<Self, ReaperError> {
        Self::validate_interval(config.interval_ms)?;

        Ok(Self {
            interval: Duration::from_millis(config.interval_ms),
            pool,
            reader,
            logger,
            stop_signal: None,
            worker: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&mut self) -> Result<(), ReaperError> {
        if self.worker.is_some() {
            return Err(ReaperError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.interval;
        let pool = Arc::clone(&self.pool);
        let reader = self.reader.clone();
        let logger = Arc::clone(&self.logger);

        let worker = thread::Builder::new()
            .name("vizdebug-reaper".to_owned())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => sweep(&pool, &reader, &logger),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(ReaperError::Spawn)?;

        self.stop_signal = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ReaperError> {
        if let Some(stop_signal) = self.stop_signal.take() {
            let _ = stop_signal.send(());
        }

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| ReaperError::JoinFailed);
        }

        Ok(())
    }

    fn validate_interval(interval_ms: u64) -> Result<(), ReaperError> {
        if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            Ok(())
        } else {
            Err(ReaperError::InvalidInterval {
                provided_ms: interval_ms,
            })
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn sweep(pool: &WorkerPool, reader: &StoreReader, logger: &Logger) {
    let reaped = pool.reap_finished();
    let level = if reaped > 0 {
        LogLevel::Debug
    } else {
        LogLevel::Verbose
    };
    logger.log(
        level,
        Some(LOG_CONTEXT),
        &format!("Cleaned {reaped} workers"),
        Some(json!({ "live_workers": pool.count() })),
    );

    if logger.enabled(LogLevel::Debug) {
        logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Store status",
            Some(status_payload(reader)),
        );
    }
}

pub fn status_payload(reader: &StoreReader) -> Value {
    let now = Utc::now();
    let identities: serde_json::Map<String, Value> = reader
        .timestamps()
        .into_iter()
        .map(|(identity, updated_at)| (identity, Value::String(describe_age(updated_at, now))))
        .collect();

    json!({
        "identities": identities.len(),
        "last_update": identities
    })
}
