pub mod health;
pub mod queues;
pub mod sync;
pub mod watch;
pub mod webhook;

pub use health::health_handler;
pub use queues::queue_stats_handler;
pub use sync::sync_trigger_handler;
pub use watch::{watch_start_handler, watch_status_handler, watch_stop_handler};
pub use webhook::{webhook_handler, webhook_probe};
