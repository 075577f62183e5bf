use std::collections::HashMap;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};

use crate::receiver::{WorkerControl, WorkerState};

#[derive(Debug)]
pub enum PoolError {
    DuplicateWorker { worker_id: u64 },
    WorkerNotFound { worker_id: u64 },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateWorker { worker_id } => {
                write!(f, "worker {worker_id} is already registered")
            }
            Self::WorkerNotFound { worker_id } => write!(f, "worker {worker_id} not found"),
        }
    }
}

impl std::error::Error for PoolError {}

pub struct WorkerRecord {
    pub worker_id: u64,
    pub peer_addr: SocketAddr,
    pub accepted_at: DateTime<Utc>,
    control: WorkerControl,
    // Second handle on the worker's socket, used only to break a blocked read.
    abort_handle: TcpStream,
    thread: JoinHandle<()>,
}

impl WorkerRecord {
    pub fn new(
        worker_id: u64,
        peer_addr: SocketAddr,
        control: WorkerControl,
        abort_handle: TcpStream,
        thread: JoinHandle<()>,
    ) -> Self {
        Self {
            worker_id,
            peer_addr,
            accepted_at: Utc::now(),
            control,
            abort_handle,
            thread,
        }
    }

    fn is_reapable(&self) -> bool {
        self.control.state().is_terminal() && self.thread.is_finished()
    }

    fn abort(&self) {
        self.control.cancel();
        let _ = self.abort_handle.shutdown(Shutdown::Both);
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    pub worker_id: u64,
    pub peer_addr: SocketAddr,
    pub accepted_at: DateTime<Utc>,
    pub state: WorkerState,
}

/// Live-worker table: filled by the accept loop, pruned by the reaper.
#[derive(Default)]
pub struct WorkerPool {
    records: Mutex<HashMap<u64, WorkerRecord>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: WorkerRecord) -> Result<(), PoolError> {
        let mut records = self.records.lock().expect("worker pool lock poisoned");
        let worker_id = record.worker_id;
        if records.contains_key(&worker_id) {
            record.abort();
            return Err(PoolError::DuplicateWorker { worker_id });
        }

        records.insert(worker_id, record);
        Ok(())
    }

    pub fn snapshot(&self, worker_id: u64) -> Result<WorkerSnapshot, PoolError> {
        self.records
            .lock()
            .expect("worker pool lock poisoned")
            .get(&worker_id)
            .map(|record| WorkerSnapshot {
                worker_id: record.worker_id,
                peer_addr: record.peer_addr,
                accepted_at: record.accepted_at,
                state: record.control.state(),
            })
            .ok_or(PoolError::WorkerNotFound { worker_id })
    }

    pub fn count(&self) -> usize {
        self.records.lock().expect("worker pool lock poisoned").len()
    }

    /// Removes every worker that reached a terminal state and whose thread
    /// has exited, returning how many were removed.
    pub fn reap_finished(&self) -> usize {
        let finished: Vec<WorkerRecord> = {
            let mut records = self.records.lock().expect("worker pool lock poisoned");
            let ids: Vec<u64> = records
                .values()
                .filter(|record| record.is_reapable())
                .map(|record| record.worker_id)
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };

        let reaped = finished.len();
        for record in finished {
            // Already finished, so this does not block.
            let _ = record.thread.join();
        }
        reaped
    }

    /// Cancels every live worker and breaks its pending read. Does not wait
    /// for the threads to exit.
    pub fn abort_all(&self) -> usize {
        let mut records = self.records.lock().expect("worker pool lock poisoned");
        for record in records.values() {
            record.abort();
        }
        let aborted = records.len();
        records.clear();
        aborted
    }
}
