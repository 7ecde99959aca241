use thiserror::Error;

pub type Result<T> = std::result::Result<T, DroneErr>;

#[derive(Debug, Error)]
pub enum DroneErr {
    /// Malformed or missing configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A received message is missing a field or has the wrong shape.
    /// Recovered locally: the message is logged and dropped.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The broker connection failed; the current round terminates and the
    /// external supervisor may restart the agent.
    #[error("transport error: {0}")]
    Transport(String),

    /// The configured private utility has no implementation.
    #[error("utility '{0}' is not supported")]
    UtilityNotSupported(String),

    /// Programming error: an operation referenced an unknown connection.
    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    /// Programming error: at most one timed connection may exist.
    #[error("a timed connection already exists")]
    DuplicateTimedConnection,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
