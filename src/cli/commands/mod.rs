//! CLI command implementations

pub mod cache_key;
pub mod config;
pub mod horizon;

pub use cache_key::execute as cache_key;
pub use config::execute as config;
pub use horizon::execute as horizon;
