use std::fmt;

use serde_json::{Value, json};

use super::message::{MessageViolation, RawMessage, VariableSnapshot};

pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

/// Why an accumulated connection buffer could not be turned into a message.
///
/// The first three variants are decided from lengths alone; decoding never
/// starts for them.
#[derive(Debug)]
pub enum FrameError {
    NoSize { received: usize },
    UnderSize { declared: usize, actual_payload: usize },
    OverSize { declared: usize, actual_payload: usize },
    DecodeError(serde_json::Error),
    Malformed(MessageViolation),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSize { received } => write!(
                f,
                "received {received} bytes, smaller than the {FRAME_HEADER_SIZE_BYTES}-byte length header"
            ),
            Self::UnderSize {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame declares {declared} payload bytes but only {actual_payload} arrived"
            ),
            Self::OverSize {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame declares {declared} payload bytes but {actual_payload} arrived"
            ),
            Self::DecodeError(source) => write!(f, "payload is not valid JSON: {source}"),
            Self::Malformed(violation) => write!(f, "malformed message: {violation}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Debug)]
pub enum CodecError {
    Serialize(serde_json::Error),
    PayloadTooLarge { size: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(source) => write!(f, "failed to serialize message: {source}"),
            Self::PayloadTooLarge { size } => write!(
                f,
                "payload size {size} does not fit in a {FRAME_HEADER_SIZE_BYTES}-byte length header"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn encode(identity: &str, vars: &VariableSnapshot) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(&json!({
        "identity": identity,
        "vars": vars,
    }))
    .map_err(CodecError::Serialize)?;

    frame_payload(&payload)
}

/// Prefixes an arbitrary payload with its big-endian length.
pub fn frame_payload(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::PayloadTooLarge { size: payload.len() })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Classifies everything a connection delivered before it closed.
///
/// The declared length must match the received payload exactly; trailing
/// bytes are rejected as `OverSize` rather than ignored.
pub fn decode(buffer: &[u8]) -> Result<RawMessage, FrameError> {
    if buffer.len() < FRAME_HEADER_SIZE_BYTES {
        return Err(FrameError::NoSize {
            received: buffer.len(),
        });
    }

    let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    let payload = &buffer[FRAME_HEADER_SIZE_BYTES..];

    if declared > payload.len() {
        return Err(FrameError::UnderSize {
            declared,
            actual_payload: payload.len(),
        });
    }
    if declared < payload.len() {
        return Err(FrameError::OverSize {
            declared,
            actual_payload: payload.len(),
        });
    }

    let value: Value = serde_json::from_slice(payload).map_err(FrameError::DecodeError)?;
    RawMessage::from_json(value).map_err(FrameError::Malformed)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use crate::wire::message::{MessageViolation, VariableSnapshot};

    use super::{FRAME_HEADER_SIZE_BYTES, FrameError, decode, encode, frame_payload};

    fn sample_vars() -> VariableSnapshot {
        let Value::Object(vars) = json!({
            "counter": 12,
            "ratio": 0.25,
            "done": false,
            "name": "loop",
            "samples": [1.0, 2.5, -3.0],
            "self": {"buffer": [0, 1, 2], "label": null}
        }) else {
            unreachable!("literal is an object");
        };
        vars
    }

    #[test]
    fn encoded_frame_carries_big_endian_payload_length() {
        let frame = encode("a.out", &sample_vars()).expect("frame should encode");
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

        assert_eq!(declared, frame.len() - FRAME_HEADER_SIZE_BYTES);
    }

    #[test]
    fn decodes_what_encode_produced() {
        let vars = sample_vars();
        let frame = encode("a.out", &vars).expect("frame should encode");
        let message = decode(&frame).expect("frame should decode");

        assert_eq!(message.identity, "a.out");
        assert_eq!(message.vars, Value::Object(vars));
    }

    #[test]
    fn fewer_than_four_bytes_is_no_size() {
        for buffer in [&[][..], &[0_u8][..], &[0_u8, 0, 1][..]] {
            let error = decode(buffer).expect_err("short buffer should fail");
            assert!(matches!(error, FrameError::NoSize { received } if received == buffer.len()));
        }
    }

    #[test]
    fn declared_length_beyond_payload_is_under_size() {
        let mut frame = encode("a.out", &sample_vars()).expect("frame should encode");
        frame.truncate(frame.len() - 5);

        let error = decode(&frame).expect_err("truncated frame should fail");
        assert!(matches!(error, FrameError::UnderSize { .. }));
    }

    #[test]
    fn header_only_with_nonzero_length_is_under_size() {
        let error = decode(&10_u32.to_be_bytes()).expect_err("header only should fail");
        assert!(matches!(
            error,
            FrameError::UnderSize {
                declared: 10,
                actual_payload: 0
            }
        ));
    }

    #[test]
    fn trailing_bytes_are_over_size() {
        let mut frame = encode("a.out", &sample_vars()).expect("frame should encode");
        frame.extend_from_slice(b"{}");

        let error = decode(&frame).expect_err("trailing bytes should fail");
        assert!(matches!(error, FrameError::OverSize { .. }));
    }

    #[test]
    fn invalid_json_of_exact_length_is_decode_error() {
        let frame = frame_payload(b"{\"identity\": ").expect("payload should frame");

        let error = decode(&frame).expect_err("invalid json should fail");
        assert!(matches!(error, FrameError::DecodeError(_)));
    }

    #[test]
    fn zero_length_payload_is_decode_error() {
        let error = decode(&0_u32.to_be_bytes()).expect_err("empty payload should fail");
        assert!(matches!(error, FrameError::DecodeError(_)));
    }

    #[test]
    fn valid_json_without_identity_is_malformed() {
        let payload = serde_json::to_vec(&json!({"vars": {"x": 1}})).expect("json should encode");
        let frame = frame_payload(&payload).expect("payload should frame");

        let error = decode(&frame).expect_err("missing identity should fail");
        assert!(matches!(
            error,
            FrameError::Malformed(MessageViolation::MissingIdentity)
        ));
    }
}
