use thiserror::Error;

use crate::types::{PageId, SectId, VolId};

/// Errors surfaced by the volume manager, the free-space cache, and the
/// allocation router.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Formatting was asked for something it cannot do.
    #[error("bad format parameters for volume {volid}: {reason}")]
    FormatBadParams { volid: VolId, reason: &'static str },
    /// The OS layer refused to create or size the volume file.
    #[error("creating or sizing the volume file failed")]
    FormatIo(#[source] std::io::Error),
    /// Couldn't open the volume file.
    #[error("opening the volume file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the volume file.
    #[error("failed to lock the volume file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize the volume file.
    #[error("synchronizing the volume file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the volume file.
    #[error("can't resize the volume file. Have {size:#x} bytes, wanted {requested:#x} bytes")]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// The volume is not mounted.
    #[error("volume {0} is unknown or not mounted")]
    UnknownVolume(VolId),
    /// A sector id out of the volume's range.
    #[error("sector {sectid} is unknown on volume {volid}")]
    UnknownSector { volid: VolId, sectid: SectId },
    /// A page id out of the volume's range.
    #[error("page {pageid} is unknown on volume {volid}")]
    UnknownPage { volid: VolId, pageid: PageId },
    /// Attempt to deallocate a system page.
    #[error("page {pageid} of volume {volid} belongs to the volume system area")]
    SystemPage { volid: VolId, pageid: PageId },
    /// A page latch could not be acquired within the configured timeout.
    #[error("latch on page {pageid} of volume {volid} timed out")]
    PageLatchTimedOut { volid: VolId, pageid: PageId },
    /// A page latch was abandoned after the bounded retries.
    #[error("latch on page {pageid} of volume {volid} aborted after retries")]
    PageLatchAborted { volid: VolId, pageid: PageId },
    /// No volume can satisfy the request, even after auto-extension.
    #[error("not enough free pages in the database to allocate {0} pages")]
    NotEnoughPagesInDatabase(i32),
    /// I/O failure on a volume that may require media recovery.
    #[error("volume {volid} may need media recovery")]
    MayNeedMediaRecovery { volid: VolId },
    /// The volume header violates a structural invariant.
    #[error("volume header of volume {0} violates an invariant")]
    BadVolumeHeader(VolId),
    /// Expansion was requested on a volume whose purpose forbids it.
    #[error("volume {volid} with purpose {purpose} cannot be expanded")]
    CannotExpandPermVols { volid: VolId, purpose: i32 },
    /// The volume cannot grow by the requested amount.
    #[error("volume {volid} cannot be expanded by {npages} pages")]
    UnableToExpand { volid: VolId, npages: i32 },
    /// The cooperative interrupt flag was raised.
    #[error("operation interrupted")]
    Interrupted,
}

/// Errors surfaced by the serialized-plan restorer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlanError {
    /// Malformed offset, unknown node tag, or truncated stream.
    #[error("invalid plan stream: {0}")]
    InvalidXaslNode(&'static str),
    /// An offset points outside the stream body.
    #[error("plan offset {offset:#x} is outside the stream body of {body_size:#x} bytes")]
    OffsetOutOfRange { offset: u32, body_size: u32 },
    /// The restore arena cannot hold the plan.
    #[error("plan restore arena exhausted")]
    ArenaExhausted,
}
