use thiserror::Error;

use crate::identity::WireCryptoError;
use crate::session::SessionError;
use crate::wire::{DecodeError, EncodeError};

/// Errors returned by `ParleyCore` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid address")]
    InvalidAddress,

    #[error("already friends with this key")]
    AlreadyFriends,

    #[error("cannot add own key as a friend")]
    OwnKey,

    #[error("message is empty")]
    NoMessage,

    #[error("payload too long (max {max} bytes)")]
    TooLong { max: usize },

    #[error("unknown friend")]
    UnknownFriend,

    #[error("unknown public key")]
    UnknownKey,

    #[error("friend is not online")]
    FriendOffline,

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] DecodeError),

    #[error("all file slots in use")]
    TooManySlots,

    #[error("transfer is not in a state that allows this operation")]
    InvalidState,

    #[error("unknown file transfer slot")]
    UnknownTransfer,

    /// Flow control: too many chunks outstanding. Retry on a later tick.
    #[error("would block")]
    WouldBlock,

    #[error("corrupt saved state: {0}")]
    CorruptState(String),

    #[error("engine not initialized")]
    EngineNotInitialized,

    #[error("event handler failed: {0}")]
    HandlerFault(#[source] anyhow::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] WireCryptoError),
}

impl EngineError {
    /// True for conditions the caller should simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WouldBlock)
    }
}

impl From<SessionError> for EngineError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotOnline => EngineError::FriendOffline,
            SessionError::Replayed => EngineError::Crypto(WireCryptoError::Decrypt),
            SessionError::Encode(EncodeError::TooLong { max, .. }) => EngineError::TooLong { max },
            SessionError::Decode(e) => EngineError::MalformedMessage(e),
            SessionError::Crypto(e) => EngineError::Crypto(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
