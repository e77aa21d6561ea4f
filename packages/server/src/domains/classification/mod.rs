//! Two-stage email classification: a free pattern pre-classifier backed by an
//! expensive model stage with a fallback model.

mod classifier;
mod models;
mod patterns;

pub use classifier::{ClassificationPipeline, PATTERN_CONFIDENCE, PROMPT_BODY_BUDGET};
pub use models::{Category, ClassificationResult, Priority, Sentiment};
pub use patterns::pre_classify;
