use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::thread;

use serde_json::{Value, json};

use crate::logging::Logger;
use crate::wire::CommunicationError;

pub const VALUES_UPDATED_EVENT: &str = "values.updated";
pub const VALUES_EVICTED_EVENT: &str = "values.evicted";
pub const SOCKET_ERROR_EVENT: &str = "socket.error";
pub const COMMUNICATION_ERROR_EVENT: &str = "communication.error";

pub type ListenerResult = Result<(), String>;

type SyncListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Identity carried by `values.updated` / `values.evicted`.
    pub fn identity(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("identity"))
            .and_then(Value::as_str)
    }

    /// Kind carried by `communication.error`.
    pub fn communication_error(&self) -> Option<CommunicationError> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("kind"))
            .and_then(Value::as_str)
            .and_then(CommunicationError::from_name)
    }
}

pub fn updated_payload(identity: &str) -> Value {
    json!({ "identity": identity })
}

pub fn communication_error_payload(
    kind: CommunicationError,
    worker_id: Option<u64>,
    detail: &str,
) -> Value {
    json!({
        "kind": kind.as_str(),
        "worker_id": worker_id,
        "detail": detail
    })
}

pub fn socket_error_payload(worker_id: u64, error: &std::io::Error) -> Value {
    json!({
        "worker_id": worker_id,
        "io_kind": format!("{:?}", error.kind()),
        "detail": error.to_string()
    })
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "sync listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(
                f,
                "sync listener #{listener_index} panicked for event '{event}'"
            ),
        }
    }
}

impl Error for EmitError {}

/// Named notifications for subscribers of the store.
///
/// Sync listeners run on the emitting thread and their failures are returned
/// to the emitter. Async listeners each get a thread of their own; their
/// failures are only logged.
#[derive(Default)]
pub struct EventEmitter {
    sync_listeners: RwLock<HashMap<String, Vec<SyncListener>>>,
    async_listeners: RwLock<HashMap<String, Vec<AsyncListener>>>,
    logger: Option<Arc<Logger>>,
}

impl EventEmitter {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(logger: Arc<Logger>) -> Self {
        Self {
            logger: Some(logger),
            ..Self::default()
        }
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let mut listeners = self
            .sync_listeners
            .write()
            .expect("sync listener map lock poisoned");
        listeners
            .entry(event_name)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_async<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(Event) -> ListenerResult + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let mut listeners = self
            .async_listeners
            .write()
            .expect("async listener map lock poisoned");
        listeners
            .entry(event_name)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn emit(&self, event_name: impl Into<String>, payload: Option<Value>) -> Result<(), EmitError> {
        let event = Event::new(event_name, payload);
        self.run_sync(&event)?;
        self.dispatch_async(event);
        Ok(())
    }

    /// Emits and reports a listener failure through the logger instead of
    /// returning it. Used from the server loops, which must keep running.
    pub fn emit_logged(&self, event_name: &str, payload: Option<Value>) {
        if let Err(error) = self.emit(event_name, payload) {
            self.report(&error.to_string());
        }
    }

    fn run_sync(&self, event: &Event) -> Result<(), EmitError> {
        let listeners = self
            .sync_listeners
            .read()
            .expect("sync listener map lock poisoned");

        let Some(handlers) = listeners.get(&event.name) else {
            return Ok(());
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index: idx,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index: idx,
                    });
                }
            }
        }

        Ok(())
    }

    fn dispatch_async(&self, event: Event) {
        let listeners = self
            .async_listeners
            .read()
            .expect("async listener map lock poisoned");

        let Some(handlers) = listeners.get(&event.name) else {
            return;
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let listener = Arc::clone(handler);
            let event_for_listener = event.clone();
            let event_name = event.name.clone();
            let logger = self.logger.clone();
            thread::spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| listener(event_for_listener)));
                let failure = match result {
                    Ok(Ok(())) => return,
                    Ok(Err(message)) => {
                        format!("async listener #{idx} failed for event '{event_name}': {message}")
                    }
                    Err(_) => format!("async listener #{idx} panicked for event '{event_name}'"),
                };
                if let Some(logger) = logger {
                    logger.warn(Some("events"), &failure);
                }
            });
        }
    }

    fn report(&self, message: &str) {
        if let Some(logger) = &self.logger {
            logger.warn(Some("events"), message);
        }
    }
}
