//! Mailbox synchronization: cursor state, preferences, and the dispatcher.

mod dispatcher;
mod models;

pub use dispatcher::{run_sync, SyncDispatcher, SyncOutcome, FULL_SYNC_MESSAGE_LIMIT};
pub use models::{MailMessage, SyncCursor, SyncPreference, SyncStatus, SyncStrategy};
