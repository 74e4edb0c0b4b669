//! Retry analytics adapters.

pub mod sqlite;

pub use sqlite::SqliteAnalyticsStore;
