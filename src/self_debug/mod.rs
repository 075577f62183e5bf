use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::producer::{ProducerError, send_raw, send_snapshot};
use crate::store::StoreReader;
use crate::wire::codec::{CodecError, encode, frame_payload};
use crate::wire::message::VariableSnapshot;

const COLOR_HEADER: &str = "\x1b[38;5;214m";
const COLOR_OUT: &str = "\x1b[38;5;81m";
const COLOR_IN: &str = "\x1b[38;5;120m";
const COLOR_DIM: &str = "\x1b[2;90m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

const SEND_TIMEOUT: Duration = Duration::from_secs(3);
const APPLY_WAIT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const BROKEN_SETTLE: Duration = Duration::from_millis(200);

const VALID_IDENTITY: &str = "vizdebug.self-debug";
const BROKEN_IDENTITY_PREFIX: &str = "vizdebug.self-debug.broken";

/// A deliberately invalid frame and the identity it would claim if it were
/// ever applied.
struct BrokenFrame {
    label: &'static str,
    identity: String,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum SelfDebugError {
    Producer(ProducerError),
    Encode(CodecError),
    NotApplied { identity: String },
    SnapshotMismatch { identity: String },
    BrokenFrameStored { label: &'static str },
    RunnerExited,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeFlags {
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfDebugReport {
    pub applied_identity: String,
    pub rejected_frames: usize,
}

impl fmt::Display for SelfDebugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer(source) => write!(f, "producer error: {source}"),
            Self::Encode(source) => write!(f, "encode error: {source}"),
            Self::NotApplied { identity } => {
                write!(f, "snapshot for '{identity}' never reached the store")
            }
            Self::SnapshotMismatch { identity } => {
                write!(f, "stored snapshot for '{identity}' differs from the one sent")
            }
            Self::BrokenFrameStored { label } => {
                write!(f, "broken frame '{label}' was applied to the store")
            }
            Self::RunnerExited => write!(f, "self debug runner exited without reporting"),
        }
    }
}

impl std::error::Error for SelfDebugError {}

impl From<ProducerError> for SelfDebugError {
    fn from(value: ProducerError) -> Self {
        Self::Producer(value)
    }
}

impl From<CodecError> for SelfDebugError {
    fn from(value: CodecError) -> Self {
        Self::Encode(value)
    }
}

pub fn extract_runtime_flags(args: Vec<String>) -> (RuntimeFlags, Vec<String>) {
    let mut flags = RuntimeFlags::default();
    let mut config_args = Vec::new();

    for arg in args {
        if arg == "--self-debug" {
            flags.enabled = true;
        } else {
            config_args.push(arg);
        }
    }

    (flags, config_args)
}

pub fn spawn_runner(
    addr: SocketAddr,
    reader: StoreReader,
) -> Receiver<Result<SelfDebugReport, SelfDebugError>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = run_self_debug(addr, &reader);
        let _ = tx.send(result);
    });
    rx
}

/// Pushes one valid snapshot and a batch of broken frames at a running server
/// and checks the store only ever reflects the valid one.
pub fn run_self_debug(
    addr: SocketAddr,
    reader: &StoreReader,
) -> Result<SelfDebugReport, SelfDebugError> {
    println!("{COLOR_HEADER}========== SELF DEBUG MODE =========={RESET}");
    println!("{COLOR_DIM}pushing frames to local vizdebug server at {addr}{RESET}");

    let snapshot = sample_snapshot();
    let previous = reader.get_timestamp(VALID_IDENTITY);
    let written = send_snapshot(addr, VALID_IDENTITY, &snapshot, SEND_TIMEOUT)?;
    print_sent("valid", written, &json!({"identity": VALID_IDENTITY, "vars": snapshot}));

    let stored = wait_for_update(reader, VALID_IDENTITY, previous)?;
    if stored != snapshot {
        return Err(SelfDebugError::SnapshotMismatch {
            identity: VALID_IDENTITY.to_owned(),
        });
    }
    print_received("store", &json!({"identity": VALID_IDENTITY, "vars": stored}));

    let broken = broken_frames()?;
    for frame in &broken {
        send_raw(addr, &frame.bytes, SEND_TIMEOUT)?;
        print_sent(
            frame.label,
            frame.bytes.len(),
            &json!({"expected": frame.label, "identity": frame.identity}),
        );
    }

    thread::sleep(BROKEN_SETTLE);
    if let Some(label) = stored_broken_frame(reader, &broken) {
        return Err(SelfDebugError::BrokenFrameStored { label });
    }
    print_received(
        "store",
        &json!({"identities": reader.all_identities().into_iter().collect::<Vec<_>>()}),
    );

    println!("{COLOR_HEADER}====== SELF DEBUG MODE COMPLETE ======{RESET}");
    Ok(SelfDebugReport {
        applied_identity: VALID_IDENTITY.to_owned(),
        rejected_frames: broken.len(),
    })
}

fn sample_snapshot() -> VariableSnapshot {
    let mut vars = VariableSnapshot::new();
    vars.insert("counter".to_owned(), json!(42));
    vars.insert("ratio".to_owned(), json!(0.75));
    vars.insert("running".to_owned(), json!(true));
    vars.insert("label".to_owned(), json!("self-debug"));
    vars.insert("samples".to_owned(), json!([1.0, 2.5, -3.25]));
    vars.insert("nested".to_owned(), json!({"depth": 2, "empty": null}));
    vars
}

fn broken_frames() -> Result<Vec<BrokenFrame>, SelfDebugError> {
    let identity = |label: &str| format!("{BROKEN_IDENTITY_PREFIX}.{label}");
    let mut vars = VariableSnapshot::new();
    vars.insert("x".to_owned(), json!(1));

    let no_size = encode(&identity("NoSize"), &vars)?;
    let under_size = encode(&identity("UnderSize"), &vars)?;
    let mut over_size = encode(&identity("OverSize"), &vars)?;
    over_size.extend_from_slice(b"trailing");
    let decode_error = format!("{{\"identity\": \"{}\", ", identity("DecodeError"));
    let missing_vars = serde_json::to_vec(&json!({"identity": identity("Malformed")}))
        .map_err(CodecError::Serialize)?;

    let frames = [
        ("NoSize", no_size[..2].to_vec()),
        ("UnderSize", under_size[..under_size.len() - 1].to_vec()),
        ("OverSize", over_size),
        ("DecodeError", frame_payload(decode_error.as_bytes())?),
        ("Malformed", frame_payload(&missing_vars)?),
    ];
    Ok(frames
        .into_iter()
        .map(|(label, bytes)| BrokenFrame {
            label,
            identity: identity(label),
            bytes,
        })
        .collect())
}

fn stored_broken_frame(reader: &StoreReader, broken: &[BrokenFrame]) -> Option<&'static str> {
    broken
        .iter()
        .find(|frame| reader.get(&frame.identity).is_some())
        .map(|frame| frame.label)
}

fn wait_for_update(
    reader: &StoreReader,
    identity: &str,
    previous: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<VariableSnapshot, SelfDebugError> {
    let deadline = Instant::now() + APPLY_WAIT;
    while Instant::now() < deadline {
        if let Some(entry) = reader.entry(identity) {
            if Some(entry.updated_at) != previous {
                return Ok(entry.vars);
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err(SelfDebugError::NotApplied {
        identity: identity.to_owned(),
    })
}

fn print_sent(label: &str, bytes: usize, body: &Value) {
    println!("{COLOR_OUT}[OUT] {BOLD}{label}{RESET} {COLOR_DIM}({bytes} bytes){RESET} {body}");
}

fn print_received(label: &str, body: &Value) {
    println!("{COLOR_IN}[IN] {BOLD}{label}{RESET} {body}");
}
