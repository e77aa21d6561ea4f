//! Push notification watch lifecycle: registration, renewal, and teardown.

mod manager;
mod models;

pub use manager::{WatchManager, WatchStatusReport, RENEWAL_WINDOW_HOURS};
pub use models::{WatchState, WatchSubscription};
