use thiserror::Error;

/// Error identities the protocol engine distinguishes. These are stable: tests
///  and callers match on them through `anyhow::Error::downcast_ref`, while the
///  surrounding `anyhow` context carries the protocol step that failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too large for ndt5 frame")]
    MessageTooLarge,

    #[error("got invalid kickoff bytes")]
    InvalidKickoff,

    #[error("server is busy")]
    ServerBusy,

    #[error("unexpected message type")]
    UnexpectedMessage,

    #[error("expected non-empty message")]
    ExpectedNonEmptyMessage,

    #[error("too many results")]
    TooManyResults,
}
