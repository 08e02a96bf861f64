use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnPoolError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no connection for endpoint")]
    NotFound,

    #[error("connection resource busy")]
    Busy,

    #[error("all paths down")]
    AllPathsDown,

    #[error("timed out waiting for an idle connection")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ConnPoolError>;
