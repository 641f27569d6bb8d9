//! Local store for halldesk

mod connection;
mod message_repository;
mod migrations;
mod outbox_repository;
mod sequence_repository;
mod settings_repository;
mod snapshot_repository;

pub use connection::Database;
pub use message_repository::{LibSqlMessageRepository, MessageRepository};
pub use outbox_repository::{LibSqlOutboxRepository, OutboxRepository, MAX_RETRIES_EXCEEDED};
pub use sequence_repository::LibSqlSequenceRepository;
pub use settings_repository::{LibSqlSettingsRepository, SettingsRepository};
pub use snapshot_repository::LibSqlSnapshotRepository;
