#![cfg(unix)]

use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use divoc::auth::ServicePrincipal;
use divoc::defaults;
use divoc::dependency::SearchPath;
use divoc::error::{ProcessFailedDetails, StageTimeoutDetails};
use divoc::installer::ArchiveFetcher;
use divoc::pipeline::{Pipeline, PipelineRequest, PipelineState, StageStatus};
use divoc::platform::Platform;
use divoc::process::{Invocation, ProcessOutput, ProcessRunner};
use divoc::stages::synthea::{exporter_options, GenerateArgs};
use divoc::workspace::{TempWorkspaces, Workspace, WorkspaceAllocator};
use divoc::{Error, ErrorCode, Result};
use tempfile::TempDir;

const DESTINATION: &str = "https://acct.blob.core.windows.net/container";

/// Pretends to be git, Synthea and azcopy by creating the files they would.
#[derive(Default)]
struct FakeRunner {
    calls: RefCell<Vec<Invocation>>,
    fail_stage: Option<&'static str>,
    /// Fail only the call with this stage and first argument.
    fail_call: Option<(&'static str, &'static str)>,
    time_out_stage: Option<&'static str>,
}

impl ProcessRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.calls.borrow_mut().push(invocation.clone());
        let stage = invocation.stage.as_str();
        let first_arg = invocation.args.first().map(String::as_str);

        if self.time_out_stage == Some(stage) {
            return Err(Error::stage_timeout(StageTimeoutDetails {
                stage: stage.to_string(),
                command: invocation.command_line(),
                timeout_secs: 1,
            }));
        }

        let fails_call = self
            .fail_call
            .is_some_and(|(s, arg)| s == stage && first_arg == Some(arg));
        if self.fail_stage == Some(stage) || fails_call {
            return Err(Error::process_execution(ProcessFailedDetails {
                command: invocation.command_line(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "boom".to_string(),
                error: None,
            }));
        }

        match invocation.stage.as_str() {
            "clone" => {
                let dir = PathBuf::from(&invocation.args[2]);
                let resources = dir.join("src/main/resources");
                fs::create_dir_all(&resources).unwrap();
                fs::write(resources.join("synthea.properties"), "exporter.baseDirectory = ./output/\n")
                    .unwrap();
            }
            "generate" => {
                let dir = invocation.working_dir.clone().unwrap();
                let fhir = dir.join("output/fhir");
                fs::create_dir_all(&fhir).unwrap();
                fs::write(fhir.join("patient.json"), "{}").unwrap();
            }
            _ => {}
        }
        Ok(ProcessOutput::default())
    }
}

impl FakeRunner {
    fn stages(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.stage.clone()).collect()
    }

    fn call(&self, stage: &str, first_arg: &str) -> Option<Invocation> {
        self.calls
            .borrow()
            .iter()
            .find(|c| c.stage == stage && c.args.first().map(String::as_str) == Some(first_arg))
            .cloned()
    }
}

struct CountingWorkspaces {
    inner: TempWorkspaces,
    created: Cell<usize>,
    removed: Cell<usize>,
    fail_remove: bool,
}

impl WorkspaceAllocator for CountingWorkspaces {
    fn create(&self, purpose: &str) -> Result<Workspace> {
        self.created.set(self.created.get() + 1);
        self.inner.create(purpose)
    }

    fn remove(&self, workspace: &Workspace) -> Result<()> {
        self.removed.set(self.removed.get() + 1);
        if self.fail_remove {
            return Err(Error::workspace_cleanup(
                &workspace.purpose,
                workspace.root.display().to_string(),
                "device busy",
            ));
        }
        self.inner.remove(workspace)
    }
}

/// Serves a zip holding `azcopy` inside a versioned folder.
#[derive(Default)]
struct FakeFetcher {
    urls: RefCell<Vec<String>>,
    /// Leave the binary out of the archive.
    without_binary: bool,
}

impl ArchiveFetcher for FakeFetcher {
    fn fetch(&self, _tool: &str, url: &str) -> Result<Vec<u8>> {
        self.urls.borrow_mut().push(url.to_string());
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        writer.add_directory("azcopy_linux_amd64_10.21.0/", options).unwrap();
        let name = if self.without_binary {
            "azcopy_linux_amd64_10.21.0/NOTICE.txt"
        } else {
            "azcopy_linux_amd64_10.21.0/azcopy"
        };
        writer.start_file(name, options).unwrap();
        writer.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        Ok(writer.finish().unwrap().into_inner())
    }
}

struct Fixture {
    _base: TempDir,
    bin: TempDir,
    home: TempDir,
    runner: FakeRunner,
    workspaces: CountingWorkspaces,
    fetcher: FakeFetcher,
}

impl Fixture {
    fn new(tools: &[&str]) -> Self {
        let base = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        for tool in tools {
            let path = bin.path().join(tool);
            fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let workspaces = CountingWorkspaces {
            inner: TempWorkspaces::new(base.path()),
            created: Cell::new(0),
            removed: Cell::new(0),
            fail_remove: false,
        };
        Self {
            _base: base,
            bin,
            home: tempfile::tempdir().unwrap(),
            runner: FakeRunner::default(),
            workspaces,
            fetcher: FakeFetcher::default(),
        }
    }

    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            runner: &self.runner,
            workspaces: &self.workspaces,
            fetcher: &self.fetcher,
            search_path: SearchPath::from_dirs([self.bin.path()]),
            platform: Some(Platform::Linux),
            home: self.home.path().to_path_buf(),
            defaults: defaults::builtin_defaults(),
        }
    }

    fn clone_dir(&self) -> PathBuf {
        let clone = self.runner.call("clone", "clone").unwrap();
        PathBuf::from(&clone.args[2])
    }
}

fn request() -> PipelineRequest {
    PipelineRequest {
        generate: GenerateArgs {
            seed: Some(7),
            population: Some(5),
            module_filter: None,
            region: "Ohio".to_string(),
            locality: "Columbus".to_string(),
        },
        options: exporter_options(false, true),
        credentials: Some(ServicePrincipal::new("app", "s3cret", "tenant")),
        destination: DESTINATION.to_string(),
        source: None,
        no_clean: false,
    }
}

#[test]
fn successful_run_transfers_generated_output_and_cleans_up() {
    let fx = Fixture::new(&["git", "java", "azcopy"]);

    let report = fx.pipeline().run(&request());

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.state, PipelineState::Done);
    assert!(report.failed_during.is_none());
    assert_eq!(fx.runner.stages(), vec!["clone", "generate", "transfer", "transfer"]);

    let stages: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec!["preflight", "clone", "configure", "generate", "install", "login", "transfer"]
    );
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Succeeded));

    let clone_dir = fx.clone_dir();
    let expected_source = format!("{}/output/*", clone_dir.display());
    let copy = fx.runner.call("transfer", "copy").unwrap();
    assert_eq!(
        copy.args,
        vec!["copy", expected_source.as_str(), DESTINATION, "--recursive"]
    );
    assert_eq!(copy.working_dir.as_deref(), Some(fx.home.path()));

    let login = fx.runner.call("transfer", "login").unwrap();
    assert_eq!(login.env.get("AZCOPY_SPA_CLIENT_SECRET"), Some("s3cret"));
    assert!(login.args.iter().all(|a| a != "s3cret"));

    let output = report.output.as_ref().unwrap();
    assert_eq!(output.generated_path, clone_dir.join("output"));
    assert_eq!(output.destination, DESTINATION);

    assert_eq!(fx.workspaces.created.get(), 1);
    assert_eq!(fx.workspaces.removed.get(), 1);
    assert!(!clone_dir.exists());
    assert!(fx.fetcher.urls.borrow().is_empty());
}

#[test]
fn generation_failure_skips_transfer_and_still_cleans_once() {
    let mut fx = Fixture::new(&["git", "java", "azcopy"]);
    fx.runner.fail_stage = Some("generate");

    let report = fx.pipeline().run(&request());

    assert_eq!(report.state, PipelineState::Failed);
    assert_eq!(report.failed_during, Some(PipelineState::Generating));
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::ProcessExecutionFailed);
    assert_eq!(error.details["exitCode"], 1);
    assert!(!fx.runner.stages().iter().any(|s| s == "transfer"));
    assert_eq!(fx.workspaces.removed.get(), 1);
    assert!(!fx.clone_dir().exists());
    assert!(report.output.is_none());
}

#[test]
fn generation_timeout_fails_generating_and_still_cleans() {
    let mut fx = Fixture::new(&["git", "java", "azcopy"]);
    fx.runner.time_out_stage = Some("generate");

    let report = fx.pipeline().run(&request());

    assert_eq!(report.state, PipelineState::Failed);
    assert_eq!(report.failed_during, Some(PipelineState::Generating));
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::StageTimeout);
    assert_eq!(error.details["stage"], "generate");
    assert!(!fx.runner.stages().iter().any(|s| s == "transfer"));
    assert_eq!(fx.workspaces.created.get(), 1);
    assert_eq!(fx.workspaces.removed.get(), 1);
    assert!(!fx.clone_dir().exists());
}

#[test]
fn copy_failure_after_an_install_removes_both_workspaces() {
    let mut fx = Fixture::new(&["git", "java"]);
    fx.runner.fail_call = Some(("transfer", "copy"));

    let report = fx.pipeline().run(&request());

    assert_eq!(report.failed_during, Some(PipelineState::Transferring));
    assert_eq!(
        report.error.as_ref().unwrap().code,
        ErrorCode::ProcessExecutionFailed
    );
    assert!(fx.runner.call("transfer", "login").is_some());
    let last = report.stages.last().unwrap();
    assert_eq!(last.stage, "transfer");
    assert_eq!(last.status, StageStatus::Failed);

    assert_eq!(fx.workspaces.created.get(), 2);
    assert_eq!(fx.workspaces.removed.get(), 2);
    assert!(report.cleanup_warnings.is_empty());
    assert!(!fx.clone_dir().exists());
    let copy = fx.runner.call("transfer", "copy").unwrap();
    assert!(!copy.program.exists(), "temporary azcopy should be gone");
}

#[test]
fn login_failure_skips_the_copy_and_removes_both_workspaces() {
    let mut fx = Fixture::new(&["git", "java"]);
    fx.runner.fail_call = Some(("transfer", "login"));

    let report = fx.pipeline().run(&request());

    assert_eq!(report.failed_during, Some(PipelineState::Transferring));
    assert_eq!(report.error.as_ref().unwrap().details["stderr"], "boom");
    assert!(fx.runner.call("transfer", "copy").is_none());
    let last = report.stages.last().unwrap();
    assert_eq!(last.stage, "login");
    assert_eq!(last.status, StageStatus::Failed);

    assert_eq!(fx.workspaces.created.get(), 2);
    assert_eq!(fx.workspaces.removed.get(), 2);
    assert!(!fx.clone_dir().exists());
}

#[test]
fn broken_install_reports_its_own_cleanup_failure_as_a_warning() {
    let mut fx = Fixture::new(&["git", "java"]);
    fx.fetcher.without_binary = true;
    fx.workspaces.fail_remove = true;

    let report = fx.pipeline().run(&request());

    assert_eq!(report.failed_during, Some(PipelineState::Transferring));
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::InstallBinaryNotFound);
    assert!(error.cleanup.is_empty());

    let purposes: Vec<&str> = report
        .cleanup_warnings
        .iter()
        .map(|w| w.details["purpose"].as_str().unwrap())
        .collect();
    assert_eq!(purposes, vec!["tool-install", "synthea"]);
    assert!(report
        .cleanup_warnings
        .iter()
        .all(|w| w.code == ErrorCode::WorkspaceCleanupFailed));
    assert_eq!(fx.workspaces.created.get(), 2);
    assert_eq!(fx.workspaces.removed.get(), 2);
}

#[test]
fn unknown_platform_is_fine_while_every_tool_is_on_path() {
    let fx = Fixture::new(&["git", "java", "azcopy"]);
    let mut pipeline = fx.pipeline();
    pipeline.platform = None;

    let report = pipeline.run(&request());

    assert!(report.succeeded(), "{:?}", report.error);
    let generate = fx.runner.call("generate", "run_synthea").unwrap();
    assert_eq!(generate.program, PathBuf::from("sh"));
    assert!(fx.fetcher.urls.borrow().is_empty());
}

#[test]
fn unknown_platform_fails_only_when_an_install_is_needed() {
    let fx = Fixture::new(&["git", "java"]);
    let mut pipeline = fx.pipeline();
    pipeline.platform = None;

    let report = pipeline.run(&request());

    if Platform::detect().is_ok() {
        // This host is a known platform, so the lazy detection installs as usual.
        assert!(report.succeeded(), "{:?}", report.error);
    } else {
        assert_eq!(report.failed_during, Some(PipelineState::Transferring));
        assert_eq!(
            report.error.as_ref().unwrap().code,
            ErrorCode::PlatformUnsupported
        );
    }
    assert!(fx.runner.call("generate", "run_synthea").is_some());
}

#[test]
fn missing_preflight_tool_fails_before_any_workspace_exists() {
    let fx = Fixture::new(&["git"]);

    let report = fx.pipeline().run(&request());

    assert_eq!(report.failed_during, Some(PipelineState::Provisioning));
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::DependencyMissing);
    assert_eq!(error.details["missing"], serde_json::json!(["java"]));
    assert_eq!(fx.workspaces.created.get(), 0);
    assert_eq!(fx.workspaces.removed.get(), 0);
    assert!(fx.runner.calls.borrow().is_empty());
}

#[test]
fn no_clean_keeps_the_checkout_but_removes_the_installed_tool() {
    let fx = Fixture::new(&["git", "java"]);
    let mut req = request();
    req.no_clean = true;

    let report = fx.pipeline().run(&req);

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        fx.fetcher.urls.borrow().as_slice(),
        ["https://aka.ms/downloadazcopy-v10-linux"]
    );
    assert_eq!(fx.workspaces.created.get(), 2);
    assert_eq!(fx.workspaces.removed.get(), 1);

    let kept = report.kept_workspace.as_ref().unwrap();
    assert_eq!(kept.root, fx.clone_dir());
    assert!(kept.root.join("output/fhir/patient.json").is_file());

    let properties =
        fs::read_to_string(kept.root.join("src/main/resources/synthea.properties")).unwrap();
    assert!(properties.contains("exporter.fhir.bulk_data = true"));
    assert!(properties.contains("exporter.csv.export = false"));

    let copy = fx.runner.call("transfer", "copy").unwrap();
    assert!(!copy.program.starts_with(fx.bin.path()));
    assert!(!copy.program.exists(), "temporary azcopy should be gone");
}

#[test]
fn cleanup_failure_after_success_becomes_the_error() {
    let mut fx = Fixture::new(&["git", "java", "azcopy"]);
    fx.workspaces.fail_remove = true;

    let report = fx.pipeline().run(&request());

    assert_eq!(report.state, PipelineState::Failed);
    assert_eq!(report.failed_during, Some(PipelineState::Cleaning));
    assert_eq!(
        report.error.as_ref().unwrap().code,
        ErrorCode::WorkspaceCleanupFailed
    );
    assert!(report.cleanup_warnings.is_empty());
    assert!(report.output.is_none());
}

#[test]
fn cleanup_failure_after_stage_failure_is_only_a_warning() {
    let mut fx = Fixture::new(&["git", "java", "azcopy"]);
    fx.workspaces.fail_remove = true;
    fx.runner.fail_stage = Some("clone");

    let report = fx.pipeline().run(&request());

    assert_eq!(report.failed_during, Some(PipelineState::Cloning));
    assert_eq!(
        report.error.as_ref().unwrap().code,
        ErrorCode::ProcessExecutionFailed
    );
    assert_eq!(report.cleanup_warnings.len(), 1);
    assert_eq!(report.cleanup_warnings[0].code, ErrorCode::WorkspaceCleanupFailed);
}

#[test]
fn without_credentials_the_existing_login_is_reused() {
    let fx = Fixture::new(&["git", "java", "azcopy"]);
    let mut req = request();
    req.credentials = None;

    let report = fx.pipeline().run(&req);

    assert!(report.succeeded());
    assert!(fx.runner.call("transfer", "login").is_none());
    assert!(fx.runner.call("transfer", "copy").is_some());
}

#[test]
fn report_serializes_with_camel_case_keys() {
    let fx = Fixture::new(&["git"]);
    let report = fx.pipeline().run(&request());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["state"], "failed");
    assert_eq!(json["failedDuring"], "provisioning");
    assert_eq!(json["error"]["code"], "dependency.missing");
    assert!(json["runId"].is_string());
    assert_eq!(json["stages"][0]["status"], "failed");
}
