use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info};

use crate::error::Result;
use crate::process::{Invocation, ProcessRunner};

pub const STAGE: &str = "clone";

#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub repo: String,
    pub dir: Option<PathBuf>,
    /// Zero means full history.
    pub depth: u32,
}

/// `clone <repo> [<dir>] [--depth <n>]`
pub fn clone_args(options: &CloneOptions) -> Vec<String> {
    let mut args = vec!["clone".to_string(), options.repo.clone()];
    if let Some(dir) = &options.dir {
        args.push(dir.to_string_lossy().to_string());
    }
    if options.depth > 0 {
        args.push("--depth".to_string());
        args.push(options.depth.to_string());
    }
    args
}

/// Clone a repository, streaming git's progress to the console.
pub fn clone(
    runner: &dyn ProcessRunner,
    git: &Path,
    options: &CloneOptions,
    timeout: Option<Duration>,
) -> Result<()> {
    let target = options
        .dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| ".".to_string());
    info!(repo = %options.repo, dir = %target, "Cloning repository");

    let invocation = Invocation::new(STAGE, git)
        .args(clone_args(options))
        .timeout(timeout);

    runner.run(&invocation).map(|_| ()).map_err(|err| {
        error!(repo = %options.repo, dir = %target, error = %err, "Failed cloning git repository");
        err.with_hint(format!(
            "Check that {} is reachable and {} is writable",
            options.repo, target
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_clone_into_dir() {
        let args = clone_args(&CloneOptions {
            repo: "https://github.com/synthetichealth/synthea".to_string(),
            dir: Some(PathBuf::from("/tmp/ws")),
            depth: 1,
        });
        assert_eq!(
            args,
            vec![
                "clone",
                "https://github.com/synthetichealth/synthea",
                "/tmp/ws",
                "--depth",
                "1"
            ]
        );
    }

    #[test]
    fn full_clone_without_dir() {
        let args = clone_args(&CloneOptions {
            repo: "https://example.com/repo.git".to_string(),
            dir: None,
            depth: 0,
        });
        assert_eq!(args, vec!["clone", "https://example.com/repo.git"]);
    }
}
