//! Update-engine error kinds.

use thiserror::Error;

use crate::update::UpdateRequest;

/// Why a single page-table operation was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    /// The frame number is at or beyond `max_page`.
    #[error("page frame number out of range")]
    OutOfRange,

    /// The frame is not owned by the requesting domain.
    #[error("frame not owned by the requesting domain")]
    WrongDomain,

    /// The frame's committed type does not match the operation.
    #[error("frame type does not match the operation")]
    WrongType,

    /// The frame is still referenced under a conflicting type.
    #[error("frame is referenced under a conflicting type")]
    TypeConflict,

    /// The entry carries attribute bits guests may not set.
    #[error("entry carries forbidden attribute bits")]
    ForbiddenBits,

    /// Pinning a frame that is already pinned.
    #[error("frame is already pinned")]
    AlreadyPinned,

    /// Unpinning a frame that is not pinned.
    #[error("frame is not pinned")]
    NotPinned,

    /// The update targets the hypervisor-reserved portion of a directory.
    #[error("update targets the hypervisor-reserved region")]
    HypervisorArea,

    /// The request is restricted to the privileged control domain.
    #[error("request requires the privileged control domain")]
    PrivilegeRequired,

    /// Unrecognised request kind or extended command.
    #[error("unrecognised update command")]
    UnknownCommand,
}

/// A fatal per-request failure.
///
/// The dispatcher stops at the first failed request; the embedder must
/// destroy the offending domain. Nothing about the batch is retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("update request {index} ({request:?}) rejected: {reason}")]
pub struct DomainFault {
    /// Position of the failing request within the batch.
    pub index: usize,
    /// The request as submitted.
    pub request: UpdateRequest,
    /// What was wrong with it.
    #[source]
    pub reason: UpdateError,
}
