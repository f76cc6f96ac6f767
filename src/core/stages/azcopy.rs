//! azcopy login and copy.
//!
//! azcopy keeps its login state under the directory it runs from, so both
//! calls run from the user's home regardless of where the pipeline is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::auth::ServicePrincipal;
use crate::error::{Error, Result};
use crate::process::{Invocation, ProcessRunner};

pub const STAGE: &str = "transfer";

/// Whether a location is a URL rather than a local filesystem path.
pub fn is_remote(location: &str) -> bool {
    let lower = location.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Absolute form of a local source; URLs pass through unchanged.
pub fn normalize_source(from: &str) -> Result<String> {
    if is_remote(from) {
        return Ok(from.to_string());
    }

    let expanded = shellexpand::tilde(from).to_string();
    let absolute = std::path::absolute(&expanded).map_err(|e| {
        Error::validation_invalid_argument(
            "source",
            format!("failed to calculate absolute path: {}", e),
            Some(from.to_string()),
        )
    })?;
    Ok(absolute.to_string_lossy().to_string())
}

/// `https://<account>.blob.core.windows.net/<container>`
pub fn blob_container_url(account: &str, container: &str) -> String {
    format!("https://{}.blob.core.windows.net/{}", account, container)
}

/// Everything inside `dir`, in the form azcopy expects for a recursive copy.
pub fn contents_of(dir: &Path) -> String {
    dir.join("*").to_string_lossy().to_string()
}

pub fn login_args(principal: &ServicePrincipal) -> Vec<String> {
    vec![
        "login".to_string(),
        "--service-principal".to_string(),
        "--application-id".to_string(),
        principal.application_id.clone(),
        "--tenant-id".to_string(),
        principal.tenant_id.clone(),
    ]
}

pub fn copy_args(from: &str, to: &str) -> Vec<String> {
    vec![
        "copy".to_string(),
        from.to_string(),
        to.to_string(),
        "--recursive".to_string(),
    ]
}

pub struct Transfer<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub binary: &'a Path,
    pub home: PathBuf,
    /// Env var azcopy reads the service principal secret from.
    pub secret_env: &'a str,
    pub timeout: Option<Duration>,
}

impl Transfer<'_> {
    /// Log in with a service principal. Output is captured and logged.
    pub fn login(&self, principal: &ServicePrincipal) -> Result<()> {
        info!(
            application_id = %principal.application_id,
            tenant_id = %principal.tenant_id,
            "Logging in to azcopy with service principal"
        );
        let invocation = Invocation::new(STAGE, self.binary)
            .args(login_args(principal))
            .env(self.secret_env, principal.secret.clone())
            .current_dir(&self.home)
            .capture()
            .timeout(self.timeout);
        self.runner.run(&invocation)?;
        Ok(())
    }

    /// Recursively copy `from` to `to`. Returns the source actually used.
    pub fn copy(&self, from: &str, to: &str) -> Result<String> {
        let source = normalize_source(from)?;
        info!(from = %source, to = %to, "Beginning data migration");
        let invocation = Invocation::new(STAGE, self.binary)
            .args(copy_args(&source, to))
            .current_dir(&self.home)
            .timeout(self.timeout);
        self.runner.run(&invocation)?;
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{OutputMode, ProcessOutput};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<Invocation>>,
    }

    impl ProcessRunner for Recorder {
        fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
            self.calls.borrow_mut().push(invocation.clone());
            Ok(ProcessOutput::default())
        }
    }

    fn transfer<'a>(runner: &'a Recorder, binary: &'a Path) -> Transfer<'a> {
        Transfer {
            runner,
            binary,
            home: PathBuf::from("/home/operator"),
            secret_env: "AZCOPY_SPA_CLIENT_SECRET",
            timeout: None,
        }
    }

    #[test]
    fn relative_source_becomes_absolute() {
        let normalized = normalize_source("relative/out").unwrap();
        let expected = std::env::current_dir().unwrap().join("relative/out");
        assert_eq!(normalized, expected.to_string_lossy());
    }

    #[test]
    fn remote_source_passes_through() {
        assert_eq!(
            normalize_source("http://example.com/data").unwrap(),
            "http://example.com/data"
        );
        assert_eq!(
            normalize_source("HTTPS://acct.blob.core.windows.net/c").unwrap(),
            "HTTPS://acct.blob.core.windows.net/c"
        );
    }

    #[test]
    #[cfg(unix)]
    fn copy_records_exact_arguments() {
        let runner = Recorder::default();
        let binary = PathBuf::from("/usr/local/bin/azcopy");
        let t = transfer(&runner, &binary);

        t.copy(
            "/tmp/ws123/output/*",
            "https://acct.blob.core.windows.net/container",
        )
        .unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(
            calls[0].args,
            vec![
                "copy",
                "/tmp/ws123/output/*",
                "https://acct.blob.core.windows.net/container",
                "--recursive",
            ]
        );
        assert_eq!(
            calls[0].args_line(),
            "copy '/tmp/ws123/output/*' https://acct.blob.core.windows.net/container --recursive"
        );
        assert_eq!(calls[0].working_dir, Some(PathBuf::from("/home/operator")));
        assert_eq!(calls[0].output, OutputMode::Inherit);
    }

    #[test]
    fn login_passes_secret_only_through_env() {
        let runner = Recorder::default();
        let binary = PathBuf::from("azcopy");
        let t = transfer(&runner, &binary);

        t.login(&ServicePrincipal::new("app", "hunter2", "tenant"))
            .unwrap();

        let calls = runner.calls.borrow();
        let login = &calls[0];
        assert!(login.args.iter().all(|a| a != "hunter2"));
        assert_eq!(login.env.get("AZCOPY_SPA_CLIENT_SECRET"), Some("hunter2"));
        assert_eq!(login.output, OutputMode::Capture);
        assert_eq!(login.working_dir, Some(PathBuf::from("/home/operator")));
        assert_eq!(
            login.args,
            vec![
                "login",
                "--service-principal",
                "--application-id",
                "app",
                "--tenant-id",
                "tenant"
            ]
        );
    }

    #[test]
    fn container_url_format() {
        assert_eq!(
            blob_container_url("acct", "container"),
            "https://acct.blob.core.windows.net/container"
        );
    }
}
