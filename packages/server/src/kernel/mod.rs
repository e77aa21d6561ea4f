//! Engine plumbing shared by every domain: dependency container, provider
//! traits and their production clients, retry, and the job infrastructure.

pub mod deps;
pub mod jobs;
pub mod mailbox;
pub mod model;
pub mod retry;
pub mod test_dependencies;
pub mod traits;
pub mod vision;

pub use deps::{EngineDeps, EngineSettings};
