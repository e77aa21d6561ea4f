// Mailroom - mailbox synchronization and dispatch engine
//
// Ingests a user's mailbox incrementally, keeps a durable sync cursor, and
// fans each new message out into asynchronous enrichment work (classification,
// summarization, attachment OCR) through a named-queue job system.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod scheduler;
pub mod server;
pub mod store;

pub use config::Config;
