//! External process execution.
//!
//! Every stage talks to its tool through [`ProcessRunner`], so the pipeline can
//! be exercised against a recording fake instead of real binaries.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ProcessFailedDetails, Result, StageTimeoutDetails};
use crate::utils::command::{join_reader, spawn_reader, CapturedOutput};
use crate::utils::shell;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Stream to the console as the process runs.
    Inherit,
    /// Collect stdout/stderr and surface them through the log.
    Capture,
}

/// Variables added on top of the inherited environment.
///
/// `Debug` prints keys only; values may be secrets.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides(BTreeMap<String, String>);

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The environment a child starts with: `base` with `overrides` applied on top.
pub fn merged_env<I>(base: I, overrides: &EnvOverrides) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = base.into_iter().collect();
    for (key, value) in overrides.iter() {
        env.insert(OsString::from(key), OsString::from(value));
    }
    env
}

impl std::fmt::Debug for EnvOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// One external process call. Arguments are passed literally, never through a shell.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Stage name, used in logs and timeout errors.
    pub stage: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: EnvOverrides,
    pub output: OutputMode,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(stage: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: EnvOverrides::new(),
            output: OutputMode::Inherit,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key, value);
        self
    }

    pub fn capture(mut self) -> Self {
        self.output = OutputMode::Capture;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments, shell-quoted for display. Env values are never included.
    pub fn command_line(&self) -> String {
        let program = self.program.to_string_lossy();
        if self.args.is_empty() {
            shell::quote_arg(&program)
        } else {
            format!("{} {}", shell::quote_arg(&program), shell::quote_args(&self.args))
        }
    }

    /// Arguments only, space-joined and quoted.
    pub fn args_line(&self) -> String {
        shell::quote_args(&self.args)
    }
}

/// Result of a successful process run. Output is empty in [`OutputMode::Inherit`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    pub exit_code: i32,
    #[serde(flatten)]
    pub output: CapturedOutput,
}

pub trait ProcessRunner {
    /// Run to completion. Non-zero exit, spawn failure and timeout are errors.
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

/// Runs invocations as real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        let command_line = invocation.command_line();
        debug!(
            stage = %invocation.stage,
            command = %command_line,
            cwd = ?invocation.working_dir,
            env = ?invocation.env,
            "Running"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env_clear()
            .envs(merged_env(std::env::vars_os(), &invocation.env));
        if invocation.timeout.is_some() {
            own_process_group(&mut cmd);
        }

        match invocation.output {
            OutputMode::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            OutputMode::Capture => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&command_line, &invocation.program, e))?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = wait_with_timeout(&mut child, invocation.timeout).map_err(|e| {
            Error::process_execution(ProcessFailedDetails {
                command: command_line.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("wait failed: {}", e)),
            })
        })?;

        let Some(status) = status else {
            // Grandchildren may still hold the pipes; leave the reader threads behind.
            let limit = invocation.timeout.unwrap_or_default();
            warn!(
                stage = %invocation.stage,
                command = %command_line,
                timeout_secs = limit.as_secs(),
                "Process timed out and was terminated"
            );
            return Err(Error::stage_timeout(StageTimeoutDetails {
                stage: invocation.stage.clone(),
                command: command_line,
                timeout_secs: limit.as_secs(),
            }));
        };

        let output = CapturedOutput::new(join_reader(stdout), join_reader(stderr));
        if invocation.output == OutputMode::Capture {
            log_captured(&invocation.stage, &output);
        }

        if status.success() {
            return Ok(ProcessOutput {
                exit_code: 0,
                output,
            });
        }

        if output.is_empty() {
            error!(stage = %invocation.stage, command = %command_line, exit_code = ?status.code(), "Process failed");
        } else {
            error!(
                stage = %invocation.stage,
                command = %command_line,
                exit_code = ?status.code(),
                output = %output.error_text(),
                "Process failed"
            );
        }

        Err(Error::process_execution(ProcessFailedDetails {
            command: command_line,
            exit_code: status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            error: None,
        }))
    }
}

fn spawn_error(command_line: &str, program: &Path, err: std::io::Error) -> Error {
    let error = Error::process_execution(ProcessFailedDetails {
        command: command_line.to_string(),
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        error: Some(err.to_string()),
    });
    if err.kind() == std::io::ErrorKind::NotFound {
        error.with_hint(format!("Check that {} is installed", program.display()))
    } else {
        error
    }
}

/// `Ok(None)` means the limit expired and the child was killed.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(limit) = timeout else {
        return child.wait().map(Some);
    };

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= limit {
            kill_tree(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Start the child as leader of a new process group so a timeout can reach
/// everything it spawns.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        warn!(
            pid = pgid,
            error = %std::io::Error::last_os_error(),
            "Failed to kill process group, killing the direct child only"
        );
        let _ = child.kill();
    }
}

#[cfg(windows)]
fn kill_tree(child: &mut Child) {
    let pid = child.id().to_string();
    let killed = Command::new("taskkill")
        .args(["/T", "/F", "/PID", pid.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !killed {
        warn!(pid = %pid, "taskkill failed, killing the direct child only");
        let _ = child.kill();
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn log_captured(stage: &str, output: &CapturedOutput) {
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        info!(stage, "{}", line);
    }
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        info!(stage, stream = "stderr", "{}", line);
    }
}
