use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const IDENTITY_KEY: &str = "identity";
pub const VARS_KEY: &str = "vars";

/// Variable name to JSON value, exactly as the producer reported it.
pub type VariableSnapshot = Map<String, Value>;

/// A decoded payload awaiting application to the store.
///
/// `vars` stays an untyped [`Value`] so the store can re-check its shape; the
/// codec only ever produces objects here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub identity: String,
    pub vars: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageViolation {
    MissingIdentity,
    IdentityNotString,
    EmptyIdentity,
    MissingVars,
    VarsNotObject,
    PayloadNotObject,
}

impl fmt::Display for MessageViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIdentity => write!(f, "message has no '{IDENTITY_KEY}' field"),
            Self::IdentityNotString => write!(f, "'{IDENTITY_KEY}' must be a string"),
            Self::EmptyIdentity => write!(f, "'{IDENTITY_KEY}' must not be empty"),
            Self::MissingVars => write!(f, "message has no '{VARS_KEY}' field"),
            Self::VarsNotObject => write!(f, "'{VARS_KEY}' must be an object"),
            Self::PayloadNotObject => write!(f, "message payload must be a JSON object"),
        }
    }
}

impl std::error::Error for MessageViolation {}

impl RawMessage {
    #[cfg(test)]
    pub fn new(identity: impl Into<String>, vars: VariableSnapshot) -> Self {
        Self {
            identity: identity.into(),
            vars: Value::Object(vars),
        }
    }

    /// Pulls `identity` and `vars` out of a decoded JSON document. Extra keys
    /// are ignored.
    pub fn from_json(value: Value) -> Result<Self, MessageViolation> {
        let Value::Object(mut fields) = value else {
            return Err(MessageViolation::PayloadNotObject);
        };

        let identity = match fields.remove(IDENTITY_KEY) {
            Some(Value::String(identity)) => identity,
            Some(_) => return Err(MessageViolation::IdentityNotString),
            None => return Err(MessageViolation::MissingIdentity),
        };
        let vars = fields.remove(VARS_KEY).ok_or(MessageViolation::MissingVars)?;
        // Stricter than key presence: null or scalar `vars` is rejected too.
        if !vars.is_object() {
            return Err(MessageViolation::VarsNotObject);
        }

        Ok(Self { identity, vars })
    }

    /// Checks the invariants the store relies on and hands back the snapshot.
    pub fn into_validated(self) -> Result<(String, VariableSnapshot), MessageViolation> {
        if self.identity.is_empty() {
            return Err(MessageViolation::EmptyIdentity);
        }

        match self.vars {
            Value::Object(vars) => Ok((self.identity, vars)),
            Value::Null => Err(MessageViolation::MissingVars),
            _ => Err(MessageViolation::VarsNotObject),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{MessageViolation, RawMessage};

    #[test]
    fn extracts_identity_and_vars_ignoring_extra_keys() {
        let message = RawMessage::from_json(json!({
            "identity": "a.out",
            "vars": {"i": 3},
            "extra": true
        }))
        .expect("message should parse");

        assert_eq!(message.identity, "a.out");
        assert_eq!(message.vars, json!({"i": 3}));
    }

    #[test]
    fn rejects_missing_or_non_string_identity() {
        let missing = RawMessage::from_json(json!({"vars": {}}));
        let numeric = RawMessage::from_json(json!({"identity": 7, "vars": {}}));

        assert_eq!(missing, Err(MessageViolation::MissingIdentity));
        assert_eq!(numeric, Err(MessageViolation::IdentityNotString));
    }

    #[test]
    fn rejects_absent_vars_and_non_object_payloads() {
        assert_eq!(
            RawMessage::from_json(json!({"identity": "x"})),
            Err(MessageViolation::MissingVars)
        );
        assert_eq!(
            RawMessage::from_json(json!({"identity": "x", "vars": [1, 2]})),
            Err(MessageViolation::VarsNotObject)
        );
        assert_eq!(
            RawMessage::from_json(json!({"identity": "x", "vars": null})),
            Err(MessageViolation::VarsNotObject)
        );
        assert_eq!(
            RawMessage::from_json(json!({"identity": "x", "vars": 3})),
            Err(MessageViolation::VarsNotObject)
        );
        assert_eq!(
            RawMessage::from_json(json!([1, 2, 3])),
            Err(MessageViolation::PayloadNotObject)
        );
    }

    #[test]
    fn validation_rejects_empty_identity_and_null_vars() {
        let empty = RawMessage {
            identity: String::new(),
            vars: json!({}),
        };
        let null_vars = RawMessage {
            identity: "gdb".to_owned(),
            vars: Value::Null,
        };

        assert_eq!(empty.into_validated(), Err(MessageViolation::EmptyIdentity));
        assert_eq!(null_vars.into_validated(), Err(MessageViolation::MissingVars));
    }
}
