use std::fmt;

pub mod codec;
pub mod message;

use codec::FrameError;

/// Kinds reported on the `communication.error` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommunicationError {
    NoSize,
    UnderSize,
    OverSize,
    Timeout,
    DecodeError,
    Malformed,
}

impl CommunicationError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSize => "NoSize",
            Self::UnderSize => "UnderSize",
            Self::OverSize => "OverSize",
            Self::Timeout => "Timeout",
            Self::DecodeError => "DecodeError",
            Self::Malformed => "Malformed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NoSize" => Some(Self::NoSize),
            "UnderSize" => Some(Self::UnderSize),
            "OverSize" => Some(Self::OverSize),
            "Timeout" => Some(Self::Timeout),
            "DecodeError" => Some(Self::DecodeError),
            "Malformed" => Some(Self::Malformed),
            _ => None,
        }
    }
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&FrameError> for CommunicationError {
    fn from(value: &FrameError) -> Self {
        match value {
            FrameError::NoSize { .. } => Self::NoSize,
            FrameError::UnderSize { .. } => Self::UnderSize,
            FrameError::OverSize { .. } => Self::OverSize,
            FrameError::DecodeError(_) => Self::DecodeError,
            FrameError::Malformed(_) => Self::Malformed,
        }
    }
}
