use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsernameError {
    #[error("Username must be between 1 and {max} characters")]
    InvalidLength { max: usize },

    #[error("Username can only contain letters, numbers, and underscores")]
    InvalidCharacter(char),
}

/// Failure to turn an inbound frame into a [`crate::protocol::ClientEnvelope`].
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown envelope kind: {0}")]
    UnknownKind(String),

    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Frame is not valid UTF-8")]
    NotUtf8,
}
