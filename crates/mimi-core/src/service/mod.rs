#[cfg(feature = "http-api")]
pub mod http;
