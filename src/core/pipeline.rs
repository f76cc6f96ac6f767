//! Clone → configure → generate → transfer, with cleanup on every exit path.
//!
//! Each run owns its workspaces through [`WorkspaceGuard`]s held for the
//! duration of [`Pipeline::run`]; nothing about the run is stored globally.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::ServicePrincipal;
use crate::defaults::Defaults;
use crate::dependency::SearchPath;
use crate::error::{Error, Result};
use crate::installer::{ArchiveFetcher, Installer, ToolSpec};
use crate::platform::Platform;
use crate::process::ProcessRunner;
use crate::stages::azcopy::{self, Transfer};
use crate::stages::git::{self, CloneOptions};
use crate::stages::synthea::{self, GenerateArgs, GeneratorOptions};
use crate::workspace::{Workspace, WorkspaceAllocator, WorkspaceGuard};

pub const CLONE_PURPOSE: &str = "synthea";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Provisioning,
    Cloning,
    Configuring,
    Generating,
    Transferring,
    Cleaning,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub generated_path: PathBuf,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_during: Option<PipelineState>,
    pub stages: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineOutput>,
    /// Clone workspace left on disk by `no_clean`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept_workspace: Option<Workspace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_warnings: Vec<Error>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }
}

/// What to generate and where to send it.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub generate: GenerateArgs,
    pub options: GeneratorOptions,
    /// `None` reuses an existing azcopy login.
    pub credentials: Option<ServicePrincipal>,
    pub destination: String,
    /// Defaults to everything inside the generated output directory.
    pub source: Option<String>,
    /// Leave the clone workspace on disk. The tool-install workspace is removed regardless.
    pub no_clean: bool,
}

pub struct Pipeline<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub workspaces: &'a dyn WorkspaceAllocator,
    pub fetcher: &'a dyn ArchiveFetcher,
    pub search_path: SearchPath,
    /// `None` on hosts outside [`Platform::ALL`]. Only an on-demand install
    /// needs a platform, and it fails then with `platform.unsupported`.
    pub platform: Option<Platform>,
    /// Working directory for azcopy, which keeps its login state there.
    pub home: PathBuf,
    pub defaults: Defaults,
}

/// Workspaces owned by one run.
#[derive(Default)]
struct Held<'w> {
    clone: Option<WorkspaceGuard<'w>>,
    tool: Option<WorkspaceGuard<'w>>,
}

struct RunLog {
    id: Uuid,
    state: PipelineState,
    stages: Vec<StageRecord>,
}

impl RunLog {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: PipelineState::Idle,
            stages: Vec::new(),
        }
    }

    fn enter(&mut self, state: PipelineState) {
        info!(run_id = %self.id, from = ?self.state, to = ?state, "Pipeline transition");
        self.state = state;
    }

    fn stage<T>(&mut self, stage: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            status: if result.is_ok() {
                StageStatus::Succeeded
            } else {
                StageStatus::Failed
            },
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            path: None,
        });
        result
    }

    /// Attach the path the last stage produced.
    fn produced(&mut self, path: &Path) {
        if let Some(record) = self.stages.last_mut() {
            record.path = Some(path.to_path_buf());
        }
    }
}

impl<'a> Pipeline<'a> {
    pub fn run(&self, request: &PipelineRequest) -> PipelineReport {
        let mut log = RunLog::new();
        let mut held = Held::default();
        info!(run_id = %log.id, destination = %request.destination, "Starting pipeline");

        let result = self.execute(request, &mut log, &mut held);
        let failed_during = result.as_ref().err().map(|err| {
            error!(run_id = %log.id, state = ?log.state, error = %err, "Pipeline stage failed");
            log.state
        });

        log.enter(PipelineState::Cleaning);
        let (kept_workspace, mut cleanup_errors) = self.clean(held, request.no_clean);

        let (output, error, failed_during) = match result {
            Ok(output) if cleanup_errors.is_empty() => (Some(output), None, None),
            Ok(_) => {
                let primary = cleanup_errors.remove(0);
                (None, Some(primary), Some(PipelineState::Cleaning))
            }
            Err(mut err) => {
                let mut warnings = err.take_cleanup_errors();
                warnings.append(&mut cleanup_errors);
                cleanup_errors = warnings;
                for warning in &cleanup_errors {
                    warn!(run_id = %log.id, error = %warning, "Cleanup failed after an earlier failure");
                }
                (None, Some(err), failed_during)
            }
        };

        let state = if error.is_some() {
            PipelineState::Failed
        } else {
            PipelineState::Done
        };
        log.enter(state);

        PipelineReport {
            run_id: log.id,
            state,
            failed_during,
            stages: log.stages,
            output,
            kept_workspace,
            error,
            cleanup_warnings: cleanup_errors,
        }
    }

    fn execute(
        &self,
        request: &PipelineRequest,
        log: &mut RunLog,
        held: &mut Held<'a>,
    ) -> Result<PipelineOutput> {
        let mut installer = Installer::new(&self.search_path, self.fetcher, self.workspaces);
        if let Some(platform) = self.platform {
            installer = installer.with_platform(platform);
        }
        let timeouts = &self.defaults.timeouts;

        log.enter(PipelineState::Provisioning);
        log.stage("preflight", || {
            self.search_path
                .check_available(self.defaults.preflight.as_slice())
        })?;
        let git_tool = installer.ensure_available(&ToolSpec::on_path("git"))?;

        log.enter(PipelineState::Cloning);
        let guard = WorkspaceGuard::create(self.workspaces, CLONE_PURPOSE)?;
        let install_dir = guard
            .root()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::internal_unexpected("clone workspace missing"))?;
        held.clone = Some(guard);

        let generator = &self.defaults.generator;
        let clone_options = CloneOptions {
            repo: generator.repo_url.clone(),
            dir: Some(install_dir.clone()),
            depth: generator.clone_depth,
        };
        log.stage(git::STAGE, || {
            git::clone(
                self.runner,
                &git_tool.binary_path,
                &clone_options,
                timeouts.clone_timeout(),
            )
        })?;
        log.produced(&install_dir);

        log.enter(PipelineState::Configuring);
        let properties = synthea::properties_path(&install_dir, generator);
        log.stage("configure", || synthea::set_options(&properties, &request.options))?;
        log.produced(&properties);

        log.enter(PipelineState::Generating);
        let generated = log.stage(synthea::STAGE, || {
            synthea::generate(
                self.runner,
                self.platform,
                &install_dir,
                generator,
                &request.generate,
                timeouts.generate_timeout(),
            )
        })?;
        log.produced(&generated);

        log.enter(PipelineState::Transferring);
        let transfer_config = &self.defaults.transfer;
        let spec = ToolSpec::installable(&transfer_config.tool, &transfer_config.download_url_template);
        let tool = log.stage("install", || installer.ensure_available(&spec))?;
        if let Some(workspace) = tool.workspace.clone() {
            held.tool = Some(WorkspaceGuard::adopt(self.workspaces, workspace));
        }
        log.produced(&tool.binary_path);

        let transfer = Transfer {
            runner: self.runner,
            binary: &tool.binary_path,
            home: self.home.clone(),
            secret_env: &transfer_config.secret_env,
            timeout: timeouts.transfer_timeout(),
        };

        match &request.credentials {
            Some(principal) => log.stage("login", || transfer.login(principal))?,
            None => info!("No service principal given, reusing existing azcopy login"),
        }

        let source = request
            .source
            .clone()
            .unwrap_or_else(|| azcopy::contents_of(&generated));
        let source = log.stage(azcopy::STAGE, || transfer.copy(&source, &request.destination))?;

        info!(
            run_id = %log.id,
            destination = %request.destination,
            "Data migration finished"
        );
        Ok(PipelineOutput {
            generated_path: generated,
            source,
            destination: request.destination.clone(),
        })
    }

    /// Tool workspace first, then the clone unless it is being kept.
    fn clean(&self, held: Held<'a>, no_clean: bool) -> (Option<Workspace>, Vec<Error>) {
        let mut errors = Vec::new();

        if let Some(tool) = held.tool {
            if let Err(err) = tool.finish() {
                errors.push(err);
            }
        }

        let mut kept = None;
        if let Some(clone) = held.clone {
            if no_clean {
                kept = clone.keep();
            } else if let Err(err) = clone.finish() {
                errors.push(err);
            }
        }

        (kept, errors)
    }
}
