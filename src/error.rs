use thiserror::Error;

use crate::codec::EncodeError;

#[derive(Debug, Error)]
pub enum FixlineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session already started: {0}")]
    AlreadyStarted(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is not logged on")]
    NotLoggedOn,

    #[error("missing logon credential: {0}")]
    MissingCredential(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, FixlineError>;
