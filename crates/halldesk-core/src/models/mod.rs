//! Data models for halldesk

mod message;
mod numbering;
mod outbox;
mod snapshot;

pub use message::{
    HistoryStatus, MailAccount, MessageHistoryEntry, MessageId, MessageStatus, NewOutboundMessage,
    OutboundMessage,
};
pub use numbering::{
    is_temporary, temporary_identifier, DeviceId, PendingOfferNumber, ReconcileFailure,
    ReconcileReport, Renumbered, SequenceKey, TEMPORARY_MARKER,
};
pub use outbox::{OperationType, OutboxRecord, OutboxRecordId, DEFAULT_MAX_RETRIES};
pub use snapshot::{CachedSnapshot, RemoteSnapshot, SnapshotMetadata};
