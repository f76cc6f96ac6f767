// Public modules
pub mod auth;
pub mod dependency;
pub mod error;
pub mod installer;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod stages;
pub mod workspace;

// Public modules for CLI access
pub mod defaults;
pub mod paths;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
