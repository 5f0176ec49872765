use thiserror::Error;

/// Error kinds surfaced by the core. Most are logged and swallowed at the
/// pump boundary per the propagation policy; only [`CoreError::Deserialization`]
/// and [`CoreError::InvariantViolation`] are meant to reach a caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("port not available: {0}")]
    PortUnavailable(String),

    #[error("send queue full on port {0}")]
    SendQueueFull(String),

    #[error("malformed MIDI message: {0}")]
    MalformedMessage(String),

    #[error("sampler protocol error: {0}")]
    SamplerProtocolError(String),

    #[error("sampler process failed to start: {0}")]
    SamplerSpawnFailed(String),

    #[error("cannot deserialize document: {0}")]
    DeserializationError(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
