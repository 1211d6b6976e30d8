use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Declaration of '{name}' conflicts with the existing one: {reason}")]
    BindingConflict { name: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Delivery {0} was already acknowledged or rejected")]
    AlreadyResolved(u64),

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Name too long")]
    NameTooLong,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(String),

    #[error("Failed to deserialize message: {0}")]
    Deserialization(String),

    #[error("Failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
}

impl Error {
    /// Whether the error invalidates the connection it happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
