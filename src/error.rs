use thiserror::Error;

/// Errors surfaced to embedders of the replication engine.
///
/// Everything that retransmission can repair is dropped silently inside
/// the engine; a broken protocol invariant or a failed durability write
/// aborts the replica instead of producing an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    /// The dispatcher queue is above the busy threshold; the proposal
    /// was refused to keep the queue from growing without bound.
    #[error("replica is busy: dispatcher queue is over the admission threshold")]
    Busy,

    /// The replica shut down; its dispatcher no longer accepts work.
    #[error("replica is shut down")]
    Shutdown,

    /// An inbound byte sequence did not parse as a protocol message.
    #[error("malformed message: {0}")]
    Codec(&'static str),
}
