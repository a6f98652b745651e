use crate::protocol::{PhaseKind, TransferKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("session storage error: {0}")]
    Session(#[from] SessionError),

    #[error("progress channel closed")]
    ChannelClosed,
}

/// Why a worker message could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The outer (`scope = "message"`) or the phase (`scope = "phase"`)
    /// discriminator is absent or not a recognized variant.
    #[error("unknown {scope} type: {}", tag.as_deref().unwrap_or("<missing>"))]
    UnknownType {
        scope: &'static str,
        tag: Option<String>,
    },

    #[error("missing field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("malformed message: {message}")]
    Malformed { message: String },
}

impl DecodeError {
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType { .. })
    }
}

/// An event that does not fit the per-item transfer lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderingViolation {
    #[error("{kind} {uuid}: {phase} after terminal {terminal}")]
    AfterTerminal {
        kind: TransferKind,
        uuid: String,
        phase: PhaseKind,
        terminal: &'static str,
    },

    #[error("{kind} {uuid}: {phase} for an item that was never queued or started")]
    UnknownItem {
        kind: TransferKind,
        uuid: String,
        phase: PhaseKind,
    },

    #[error("{kind} {uuid}: {phase} not allowed in state {from}")]
    InvalidTransition {
        kind: TransferKind,
        uuid: String,
        phase: PhaseKind,
        from: &'static str,
    },
}

impl OrderingViolation {
    pub fn uuid(&self) -> &str {
        match self {
            Self::AfterTerminal { uuid, .. }
            | Self::UnknownItem { uuid, .. }
            | Self::InvalidTransition { uuid, .. } => uuid,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid session store: {message}")]
    InvalidFormat { message: String },
}
