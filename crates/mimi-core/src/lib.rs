pub mod error;
pub mod types;
pub mod config;
pub mod store;
pub mod agent;
pub mod provider;
pub mod channel;
pub mod service;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
