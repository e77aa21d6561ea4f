// Common types shared across the engine

pub mod error;

pub use error::{ApiError, ProviderError};
