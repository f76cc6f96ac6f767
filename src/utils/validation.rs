//! Input validation primitives.
//!
//! Checks run before any workspace exists, so a typo in a flag never costs a
//! clone and a Synthea run.

use regex::Regex;

use crate::error::{Error, Result};

/// Require a string to be non-empty after trimming.
///
/// Returns a reference to the trimmed string on success.
pub fn require_non_empty<'a>(value: &'a str, field: &str, message: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::validation_invalid_argument(field, message, None))
    } else {
        Ok(trimmed)
    }
}

/// Either every value is present or none is. Returns whether all were given.
pub fn all_or_none(fields: &[(&str, Option<&str>)]) -> Result<bool> {
    let missing: Vec<String> = fields
        .iter()
        .filter(|(_, value)| value.map(|v| v.trim().is_empty()).unwrap_or(true))
        .map(|(name, _)| name.to_string())
        .collect();

    if missing.is_empty() {
        return Ok(true);
    }
    if missing.len() == fields.len() {
        return Ok(false);
    }
    Err(Error::validation_missing_argument(missing))
}

/// Azure storage account: 3-24 lowercase letters and digits.
pub fn storage_account(name: &str) -> Result<&str> {
    let re = Regex::new(r"^[a-z0-9]{3,24}$")
        .map_err(|e| Error::internal_unexpected(format!("storage account pattern: {}", e)))?;
    if re.is_match(name) {
        Ok(name)
    } else {
        Err(Error::validation_invalid_argument(
            "storage-account",
            "must be 3-24 characters of lowercase letters and digits",
            Some(name.to_string()),
        ))
    }
}

/// Azure blob container: 3-63 characters, lowercase letters, digits and
/// single hyphens, starting and ending with a letter or digit.
pub fn storage_container(name: &str) -> Result<&str> {
    let re = Regex::new(r"^[a-z0-9](?:[a-z0-9]|-[a-z0-9])*$")
        .map_err(|e| Error::internal_unexpected(format!("storage container pattern: {}", e)))?;
    if (3..=63).contains(&name.len()) && re.is_match(name) {
        Ok(name)
    } else {
        Err(Error::validation_invalid_argument(
            "storage-container",
            "must be 3-63 characters of lowercase letters, digits and single hyphens",
            Some(name.to_string()),
        ))
    }
}
