/// Errors surfaced by a [`ResilientSocket`](crate::ResilientSocket).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket is not connected")]
    NotConnected,

    #[error("a connection attempt is already in progress")]
    Connecting,

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid handshake header: {0}")]
    InvalidHeader(String),

    #[error("socket has been closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
