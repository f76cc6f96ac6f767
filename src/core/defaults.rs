use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths;

/// Root configuration structure for divoc.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DivocConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

/// All configurable defaults that can be overridden via divoc.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_generator")]
    pub generator: GeneratorConfig,

    #[serde(default = "default_transfer")]
    pub transfer: TransferConfig,

    /// Tools that must already be on PATH before anything is cloned.
    #[serde(default = "default_preflight")]
    pub preflight: Vec<String>,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    /// Directory under which ephemeral workspaces are created. Supports `~`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            transfer: default_transfer(),
            preflight: default_preflight(),
            timeouts: StageTimeouts::default(),
            workspace_root: None,
        }
    }
}

/// Where Synthea comes from and how its checkout is laid out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_repo_url")]
    pub repo_url: String,

    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,

    #[serde(default = "default_properties_path")]
    pub properties_path: String,

    #[serde(default = "default_run_script")]
    pub run_script: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

/// azcopy lookup and on-demand install settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_transfer_tool")]
    pub tool: String,

    /// `{platform}` is replaced with the platform's download slug.
    #[serde(default = "default_download_url_template")]
    pub download_url_template: String,

    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

/// Per-stage limits in seconds. Unset means the stage may run indefinitely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_secs: Option<u64>,
}

impl StageTimeouts {
    /// Same limit for every stage.
    pub fn uniform(secs: u64) -> Self {
        Self {
            clone_secs: Some(secs),
            generate_secs: Some(secs),
            transfer_secs: Some(secs),
        }
    }

    pub fn clone_timeout(&self) -> Option<Duration> {
        self.clone_secs.map(Duration::from_secs)
    }

    pub fn generate_timeout(&self) -> Option<Duration> {
        self.generate_secs.map(Duration::from_secs)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_secs.map(Duration::from_secs)
    }
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_generator() -> GeneratorConfig {
    GeneratorConfig {
        repo_url: default_repo_url(),
        clone_depth: default_clone_depth(),
        properties_path: default_properties_path(),
        run_script: default_run_script(),
        output_dir: default_output_dir(),
    }
}

fn default_repo_url() -> String {
    "https://github.com/synthetichealth/synthea".to_string()
}

// The Synthea history is large; a shallow clone is enough to build and run it.
fn default_clone_depth() -> u32 {
    1
}

fn default_properties_path() -> String {
    "src/main/resources/synthea.properties".to_string()
}

fn default_run_script() -> String {
    "run_synthea".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_transfer() -> TransferConfig {
    TransferConfig {
        tool: default_transfer_tool(),
        download_url_template: default_download_url_template(),
        secret_env: default_secret_env(),
        download_timeout_secs: default_download_timeout_secs(),
    }
}

fn default_transfer_tool() -> String {
    "azcopy".to_string()
}

fn default_download_url_template() -> String {
    "https://aka.ms/downloadazcopy-v10-{platform}".to_string()
}

fn default_secret_env() -> String {
    "AZCOPY_SPA_CLIENT_SECRET".to_string()
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_preflight() -> Vec<String> {
    vec!["git".to_string(), "java".to_string()]
}

// =============================================================================
// Loading functions
// =============================================================================

/// Load the effective config. An explicit path must exist; the default
/// divoc.json is optional and falls back to built-in defaults when absent.
pub fn load_config(explicit: Option<&Path>) -> Result<DivocConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::config_invalid_value(
                    "config",
                    Some(path.display().to_string()),
                    "config file does not exist",
                ));
            }
            path.to_path_buf()
        }
        None => {
            let path = paths::divoc_json()?;
            if !path.exists() {
                return Ok(DivocConfig::default());
            }
            path
        }
    };

    load_config_from_file(&path)
}

fn load_config_from_file(path: &Path) -> Result<DivocConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;

    let config: DivocConfig = serde_json::from_str(&content)
        .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))?;

    validate(&config.defaults)?;
    Ok(config)
}

fn validate(defaults: &Defaults) -> Result<()> {
    if !defaults
        .transfer
        .download_url_template
        .contains("{platform}")
    {
        return Err(Error::config_invalid_value(
            "defaults.transfer.download_url_template",
            Some(defaults.transfer.download_url_template.clone()),
            "template must contain the {platform} placeholder",
        ));
    }

    if Path::new(&defaults.generator.output_dir).is_absolute() {
        return Err(Error::config_invalid_value(
            "defaults.generator.output_dir",
            Some(defaults.generator.output_dir.clone()),
            "output directory must be relative to the Synthea checkout",
        ));
    }

    Ok(())
}

/// Path divoc.json would be read from (for display purposes)
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => paths::divoc_json(),
    }
}

/// Get built-in defaults (ignoring any file config)
pub fn builtin_defaults() -> Defaults {
    Defaults::default()
}
