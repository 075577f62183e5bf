use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::wire::message::{MessageViolation, RawMessage, VariableSnapshot};

#[derive(Clone, Debug, PartialEq)]
pub struct StoreEntry {
    pub vars: VariableSnapshot,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    Malformed(MessageViolation),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(violation) => write!(f, "rejected malformed message: {violation}"),
        }
    }
}

impl std::error::Error for StoreError {}

type Entries = Arc<RwLock<HashMap<String, StoreEntry>>>;

/// Write side of the variable store.
///
/// There is exactly one of these, owned by the consumer loop, so every
/// mutation is serialized without further coordination. Readers get a
/// [`StoreReader`].
#[derive(Default)]
pub struct VariableStore {
    entries: Entries,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader {
            entries: Arc::clone(&self.entries),
        }
    }

    /// Replaces the entry for the message's identity, never merging with the
    /// previous snapshot.
    pub fn apply(&self, message: RawMessage) -> Result<String, StoreError> {
        self.apply_at(message, Utc::now())
    }

    fn apply_at(&self, message: RawMessage, received_at: DateTime<Utc>) -> Result<String, StoreError> {
        let (identity, vars) = message.into_validated().map_err(StoreError::Malformed)?;

        self.entries
            .write()
            .expect("variable store lock poisoned")
            .insert(
                identity.clone(),
                StoreEntry {
                    vars,
                    updated_at: received_at,
                },
            );

        Ok(identity)
    }

    /// Drops every identity not updated within `max_age` of `now`.
    pub fn evict_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.write().expect("variable store lock poisoned");
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now - entry.updated_at > max_age)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &stale {
            entries.remove(identity);
        }
        stale
    }
}

/// Cloneable read handle for subscribers. A reader never sees a partially
/// written entry.
#[derive(Clone)]
pub struct StoreReader {
    entries: Entries,
}

impl StoreReader {
    pub fn get(&self, identity: &str) -> Option<VariableSnapshot> {
        self.entries
            .read()
            .expect("variable store lock poisoned")
            .get(identity)
            .map(|entry| entry.vars.clone())
    }

    pub fn get_timestamp(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .expect("variable store lock poisoned")
            .get(identity)
            .map(|entry| entry.updated_at)
    }

    pub fn entry(&self, identity: &str) -> Option<StoreEntry> {
        self.entries
            .read()
            .expect("variable store lock poisoned")
            .get(identity)
            .cloned()
    }

    pub fn all_identities(&self) -> BTreeSet<String> {
        self.entries
            .read()
            .expect("variable store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn timestamps(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut stamps: Vec<(String, DateTime<Utc>)> = self
            .entries
            .read()
            .expect("variable store lock poisoned")
            .iter()
            .map(|(identity, entry)| (identity.clone(), entry.updated_at))
            .collect();
        stamps.sort();
        stamps
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("variable store lock poisoned")
            .len()
    }
}

/// Renders how long ago an identity last reported, e.g. "3 seconds ago".
pub fn describe_age(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - updated_at).num_seconds().max(0);
    if seconds < 60 {
        let plural = if seconds == 1 { "" } else { "s" };
        return format!("{seconds} second{plural} ago");
    }
    if seconds < 60 * 60 {
        let minutes = seconds / 60;
        let plural = if minutes == 1 { "" } else { "s" };
        return format!("{minutes} minute{plural} ago");
    }
    "a long time ago".to_owned()
}
