// Domain modules - one per area of engine behavior.

pub mod agents;
pub mod classification;
pub mod extraction;
pub mod sync;
pub mod watch;
