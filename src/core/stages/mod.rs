//! Tool-specific argument composition on top of the process runner.

pub mod azcopy;
pub mod git;
pub mod synthea;
