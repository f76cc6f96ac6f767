use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use divoc::defaults::{self, Defaults};
use divoc::dependency::SearchPath;
use divoc::platform::{self, Platform};
use divoc::ErrorCode;

use super::CmdResult;

#[derive(Args, Debug)]
pub struct CheckArgs {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub found: bool,
    /// Missing, but downloaded automatically when a run needs it.
    pub installable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutput {
    pub command: String,
    /// Detected platform, or the raw OS name when it is not one divoc installs for.
    pub platform: String,
    pub platform_supported: bool,
    pub tools: Vec<ToolStatus>,
    pub missing: Vec<String>,
}

pub fn run(_args: CheckArgs, global: &super::GlobalArgs) -> CmdResult<CheckOutput> {
    let defaults = defaults::load_config(global.config.as_deref())?.defaults;
    let output = inspect(&defaults, Platform::detect().ok(), &SearchPath::from_env());

    let exit_code = if output.missing.is_empty() {
        0
    } else {
        crate::output::exit_code_for_error(ErrorCode::DependencyMissing)
    };
    Ok((output, exit_code))
}

fn inspect(defaults: &Defaults, platform: Option<Platform>, search_path: &SearchPath) -> CheckOutput {
    let mut tools: Vec<ToolStatus> = defaults
        .preflight
        .iter()
        .map(|name| {
            let path = search_path.resolve(&platform::binary_name_on(platform, name));
            ToolStatus {
                name: name.clone(),
                found: path.is_some(),
                path,
                installable: false,
            }
        })
        .collect();

    let transfer = &defaults.transfer.tool;
    let path = search_path.resolve(&platform::binary_name_on(platform, transfer));
    tools.push(ToolStatus {
        name: transfer.clone(),
        found: path.is_some(),
        installable: path.is_none() && platform.is_some(),
        path,
    });

    let missing: Vec<String> = tools
        .iter()
        .filter(|t| !t.found && !t.installable)
        .map(|t| t.name.clone())
        .collect();

    CheckOutput {
        command: "check".to_string(),
        platform: platform
            .map(|p| p.as_str())
            .unwrap_or(std::env::consts::OS)
            .to_string(),
        platform_supported: platform.is_some(),
        tools,
        missing,
    }
}
