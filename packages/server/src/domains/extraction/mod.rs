//! Attachment text extraction via a provider-side batch OCR operation.

mod models;
mod poller;

pub use models::{DocumentRecord, ExtractionStatus};
pub use poller::{ExtractionPoller, POLL_INTERVAL, POLL_MAX_ATTEMPTS};
