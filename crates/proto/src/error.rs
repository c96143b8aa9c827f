use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Message type registration error.
    #[error("Register error: {0}")]
    Register(#[from] RegisterError),

    /// Wire-format processing error.
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// Transport connection error.
    #[error("Connection error: {0}")]
    Conn(#[from] ConnError),

    /// Cross-task dispatch error.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Gate lifecycle error.
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Startup registration errors. These are configuration mistakes and abort startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The wire tag is already taken by another registration.
    #[error("message {0} is already registered")]
    Duplicate(String),

    /// The same Rust type was registered under a second tag.
    #[error("message type already registered as {existing}, cannot register as {requested}")]
    DuplicateType {
        existing: &'static str,
        requested: &'static str,
    },

    /// The wire tag is empty.
    #[error("unnamed message type")]
    EmptyName,

    /// A router was attached to a tag that was never registered.
    #[error("message {0} not registered")]
    NotRegistered(String),
}

/// Errors raised while decoding, encoding or routing a message.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Envelope is not an object with exactly one key.
    #[error("invalid data")]
    InvalidData,

    /// Envelope tag has no registration.
    #[error("message {0} not registered")]
    NotRegistered(String),

    /// Runtime type of an outbound or routed message has no registration.
    #[error("message type {0} not registered")]
    UnknownType(&'static str),

    /// Payload did not match the registered type's structure.
    #[error("decode error: {0}")]
    Decode(String),

    /// Message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// The router refused the hand-off.
    #[error("route error: {0}")]
    Route(#[from] DispatchError),
}

/// Transport connection errors
#[derive(Debug, Error)]
pub enum ConnError {
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(String),

    /// Connection has already been closed or destroyed.
    #[error("connection closed")]
    Closed,

    /// Too many frames are waiting to be written.
    #[error("pending write queue full")]
    WriteQueueFull,

    /// Frame exceeds the configured maximum length, carried here.
    #[error("message too long (limit {0} bytes)")]
    MessageTooLong(usize),

    /// Frame is shorter than the minimum length.
    #[error("message too short")]
    MessageTooShort,

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl From<std::io::Error> for ConnError {
    fn from(err: std::io::Error) -> Self {
        ConnError::Io(err.to_string())
    }
}

/// Cross-task dispatch errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Receiver queue has no free slot.
    #[error("dispatch queue full")]
    QueueFull,

    /// Receiver has stopped.
    #[error("dispatch target closed")]
    Closed,

    /// Handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),
}

/// Gate lifecycle errors
#[derive(Debug, Error)]
pub enum GateError {
    /// A listener could not be started.
    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },
}
