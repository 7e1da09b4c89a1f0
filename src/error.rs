//! Error types for the tunnel engine.

use thiserror::Error;

/// Engine errors.
///
/// Every variant maps to one failure kind of the C interface; see
/// [`EngineError::code`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration string is malformed or fails validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The instance is not stopped.
    #[error("Network instance is already running")]
    AlreadyRunning,

    /// The operation needs a starting or running instance.
    #[error("Network instance is not running")]
    NotRunning,

    /// Runtime or transport initialisation failed.
    #[error("Initialisation failed: {0}")]
    InitFailure(String),

    /// A null function pointer was passed as callback.
    #[error("Callback is null")]
    NullCallback,

    /// The rendezvous service (or local validation) rejected the room name.
    #[error("Room name rejected: {0}")]
    NameRejected(String),

    /// No room with this code exists.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room existed but is closed or too old.
    #[error("Room expired: {0}")]
    RoomExpired(String),

    /// Network or protocol failure talking to the rendezvous service or peers.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation exceeded its latency bound.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The TUN descriptor is negative or not open.
    #[error("Invalid TUN descriptor: {0}")]
    InvalidDescriptor(String),

    /// Nothing has been recorded in the requested slot yet.
    #[error("No data recorded")]
    NoData,

    /// Unexpected internal fault, including fatal TUN I/O errors.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Status code returned across the C interface.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Config(_) => -1,
            EngineError::AlreadyRunning => -2,
            EngineError::NotRunning => -3,
            EngineError::InitFailure(_) => -4,
            EngineError::NullCallback => -5,
            EngineError::NameRejected(_) => -6,
            EngineError::RoomNotFound(_) => -7,
            EngineError::RoomExpired(_) => -8,
            EngineError::Transport(_) => -9,
            EngineError::Timeout(_) => -10,
            EngineError::InvalidDescriptor(_) => -11,
            EngineError::NoData => -12,
            EngineError::Fatal(_) => -13,
        }
    }

    /// Returns true if a rendezvous attempt failing with this error may be
    /// retried. Only transport-level failures are transient; everything the
    /// server answers explicitly is final.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_nonzero() {
        let errors = [
            EngineError::Config(String::new()),
            EngineError::AlreadyRunning,
            EngineError::NotRunning,
            EngineError::InitFailure(String::new()),
            EngineError::NullCallback,
            EngineError::NameRejected(String::new()),
            EngineError::RoomNotFound(String::new()),
            EngineError::RoomExpired(String::new()),
            EngineError::Transport(String::new()),
            EngineError::Timeout(String::new()),
            EngineError::InvalidDescriptor(String::new()),
            EngineError::NoData,
            EngineError::Fatal(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_only_transport_is_retriable() {
        assert!(EngineError::Transport("reset".into()).is_retriable());
        assert!(!EngineError::Timeout("slow".into()).is_retriable());
        assert!(!EngineError::RoomNotFound("U/AAAA".into()).is_retriable());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let err: EngineError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(err.code(), -9);
        assert!(err.to_string().contains("refused"));
    }
}
