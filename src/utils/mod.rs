//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Child output capture
//! - `shell` - Shell quoting for logged command lines
//! - `validation` - Input validation helpers

pub mod command;
pub mod shell;
pub mod validation;
