use thiserror::Error;

pub type CtrvResult<T> = Result<T, CtrvError>;

#[derive(Debug, Error)]
pub enum CtrvError {
    /// Misuse: missing key or nonce, engine used before `init`, range write not allowed
    #[error("security error: {0}")]
    Security(String),

    /// Nonce or counter space exhausted. Never retried: the same nonce cannot be reused.
    #[error("range exceeded: {0}")]
    RangeExceeded(String),

    /// Chunk verification failed; the data read so far must not be trusted
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("config error: {0}")]
    Config(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CtrvError {
    /// True when the caller should re-run the device authorization flow
    /// instead of retrying the operation.
    pub fn requires_authorization(&self) -> bool {
        matches!(
            self,
            CtrvError::Sequence(SequenceError::NotAuthorized | SequenceError::Revoked)
        )
    }

    /// True for errors that mean the nonce or counter space is used up.
    pub fn is_range_exceeded(&self) -> bool {
        matches!(self, CtrvError::RangeExceeded(_))
    }
}

/// Precondition violations reported by the nonce sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence does not exist")]
    NotFound,

    #[error("sequence already exists")]
    AlreadyExists,

    #[error("cannot reinitialize sequence")]
    AlreadyInitialized,

    #[error("corrupt sequence config: more than one active sequence for drive")]
    Corrupt,

    #[error("device not authorized")]
    NotAuthorized,

    #[error("max nonce cannot be increased")]
    MaxNonceCannotIncrease,

    #[error("sequence already revoked")]
    Revoked,

    #[error("sequencer is closed")]
    Closed,

    #[error("sequence store: {0}")]
    Store(String),
}
