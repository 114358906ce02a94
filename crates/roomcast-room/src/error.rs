//! Error types for the relay core.

/// Errors surfaced to the control plane and the attach path.
///
/// Variants mirror the status codes the outer gRPC façade maps them to,
/// so a caller can translate without string matching.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// Malformed input, e.g. undecodable property blobs on create.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The room exists but refuses the operation (not joinable/watchable).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The sender already participates in a conflicting role.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The room is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unknown room, client, or target.
    #[error("not found: {0}")]
    NotFound(String),

    /// A control-plane call ran out of time before the room answered.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The room shut down mid-operation.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// A write to a peer socket failed.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PeerError {
    #[error("peer already closed")]
    Closed,

    #[error("write timed out")]
    Timeout,

    #[error("write failed: {0}")]
    Write(String),
}
