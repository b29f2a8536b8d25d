use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// A ring cannot be built from an empty peer list.
    #[error("no peers available to build the hash ring")]
    NoPeers,

    #[error("peer discovery failed: {0}")]
    Discovery(String),

    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    #[error("peer {peer} rejected forwarded batch with status {status}")]
    Status { peer: String, status: u16 },

    #[error("request to {peer} timed out")]
    Timeout { peer: String },

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("wire codec error: {0}")]
    Codec(String),

    #[error("forwarding to {peer} failed after {attempts} attempts")]
    RetriesExhausted { peer: String, attempts: u32 },

    #[error("peer forwarder is shut down")]
    ShutDown,

    #[error("invalid forwarder configuration: {0}")]
    Config(String),

    #[error("buffer error: {0}")]
    Buffer(#[from] ferry_buffer::BufferError),
}

pub type ForwardResult<T> = std::result::Result<T, ForwardError>;
