/// Errors returned by [`CqClient`](crate::CqClient) calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend socket is not connected")]
    NotConnected,

    #[error("push channel is not configured")]
    PushDisabled,

    #[error("socket error: {0}")]
    Socket(cqlink_socket::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned retcode {0}")]
    Backend(i32),
}

impl From<cqlink_socket::Error> for Error {
    fn from(err: cqlink_socket::Error) -> Self {
        match err {
            cqlink_socket::Error::NotConnected => Self::NotConnected,
            other => Self::Socket(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
