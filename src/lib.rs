pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `divoc::pipeline` instead of `divoc::core::pipeline`
pub use core::*;
pub use utils::*;
