//! Infrastructure: adapters behind the domain ports plus config and
//! logging setup.

pub mod analytics;
pub mod config;
pub mod gateway;
pub mod jobstore;
pub mod logging;
pub mod memory;
