pub mod common;
pub mod mail;
pub mod number;
pub mod outbox;
pub mod run;
pub mod snapshot;
