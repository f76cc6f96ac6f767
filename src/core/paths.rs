use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base divoc config directory (~/.config/divoc/ on Unix, %APPDATA%\divoc on Windows)
pub fn divoc() -> Result<PathBuf> {
    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("divoc"))
    }

    #[cfg(not(windows))]
    {
        Ok(home()?.join(".config").join("divoc"))
    }
}

/// Global divoc.json config file path
pub fn divoc_json() -> Result<PathBuf> {
    Ok(divoc()?.join("divoc.json"))
}

/// The invoking user's home directory.
///
/// azcopy keeps its login state relative to its working directory, so both
/// `login` and `copy` are run from here.
pub fn home() -> Result<PathBuf> {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";

    match env::var_os(var) {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(home)),
        _ => Err(Error::internal_unexpected(format!(
            "{} environment variable not set",
            var
        ))),
    }
}

/// Root under which ephemeral workspaces are allocated.
pub fn workspace_base(configured: Option<&str>) -> PathBuf {
    match configured {
        Some(dir) if !dir.trim().is_empty() => {
            PathBuf::from(shellexpand::tilde(dir.trim()).to_string())
        }
        _ => env::temp_dir(),
    }
}
