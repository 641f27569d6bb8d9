//! halldesk-core - Core library for halldesk
//!
//! Offline-first plumbing for the sales desk: the local store, the
//! operation outbox, the outbound mail worker, reference-data snapshot
//! sync and offer numbering with temporary-id reconciliation.

pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod mail;
pub mod models;
pub mod numbering;
pub mod outbox;
pub mod scheduler;
pub mod services;
pub mod snapshot;
pub mod util;

pub use error::{Error, Result};
pub use services::StoreService;
