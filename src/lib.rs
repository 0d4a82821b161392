pub mod agent;
pub mod commands;
pub mod device;
pub mod error;
pub mod mirror;
pub mod utils;

pub use error::{Diagnostics, ErrorCode};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
