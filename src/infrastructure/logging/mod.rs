//! Logging setup and secret scrubbing.

pub mod logger;
pub mod scrub;

pub use logger::Logger;
pub use scrub::redact;
