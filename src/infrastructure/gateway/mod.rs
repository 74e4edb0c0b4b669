//! Model gateway HTTP client.

pub mod client;
pub mod rate_limiter;
pub mod streaming;
pub mod types;

pub use client::HttpModelGateway;
