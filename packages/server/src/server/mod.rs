pub mod app;
pub mod routes;
pub mod verify;

pub use app::{build_app, AppState};
pub use verify::NotificationVerifier;
