use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Host platforms divoc can install tools for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Linux, Platform::MacOs, Platform::Windows];

    /// Map a `std::env::consts::OS` value onto a supported platform.
    pub fn from_os(os: &str) -> Option<Platform> {
        match os {
            "linux" => Some(Platform::Linux),
            "macos" => Some(Platform::MacOs),
            "windows" => Some(Platform::Windows),
            _ => None,
        }
    }

    pub fn detect() -> Result<Platform> {
        let os = std::env::consts::OS;
        Self::from_os(os).ok_or_else(|| Error::unsupported_platform(os))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
        }
    }

    /// Slug used by the azcopy download endpoints.
    pub fn download_slug(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "mac",
            Platform::Windows => "windows",
        }
    }

    pub fn exe_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            Platform::Linux | Platform::MacOs => "",
        }
    }

    pub fn binary_name(&self, tool: &str) -> String {
        format!("{}{}", tool, self.exe_suffix())
    }

    /// Interpreter used to launch a repository shell script, plus its leading args.
    pub fn script_launcher(&self, script: &str) -> (String, Vec<String>) {
        match self {
            Platform::Windows => (
                "cmd".to_string(),
                vec!["/C".to_string(), format!("{}.bat", script)],
            ),
            Platform::Linux | Platform::MacOs => ("sh".to_string(), vec![script.to_string()]),
        }
    }
}

/// `tool` as it appears on PATH. Hosts outside [`Platform::ALL`] use the bare name.
pub fn binary_name_on(platform: Option<Platform>, tool: &str) -> String {
    match platform {
        Some(platform) => platform.binary_name(tool),
        None => tool.to_string(),
    }
}

/// Script launcher for a host that may be outside [`Platform::ALL`]. Windows is
/// always detected, so an unknown host is a Unix-like one and gets `sh`.
pub fn script_launcher_on(platform: Option<Platform>, script: &str) -> (String, Vec<String>) {
    match platform {
        Some(platform) => platform.script_launcher(script),
        None => ("sh".to_string(), vec![script.to_string()]),
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
