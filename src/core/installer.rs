//! On-demand tool installation.
//!
//! A tool found on the search path is used in place. Otherwise its
//! platform-specific archive is downloaded into memory, flattened into a
//! fresh `tool-install` workspace, and the returned [`InstalledTool`] owns
//! that workspace until the pipeline cleans it up.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::dependency::SearchPath;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::workspace::{Workspace, WorkspaceAllocator, WorkspaceGuard};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const TOOL_INSTALL_PURPOSE: &str = "tool-install";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStrategy {
    /// Must already be installed; never downloaded.
    OnPath,
    /// Downloaded into a temporary workspace when missing from PATH.
    OnDemandInstall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformArtifact {
    pub platform: Platform,
    pub url: String,
    pub binary: String,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub lookup: LookupStrategy,
    pub artifacts: Vec<PlatformArtifact>,
}

impl ToolSpec {
    pub fn on_path(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lookup: LookupStrategy::OnPath,
            artifacts: Vec::new(),
        }
    }

    /// An installable tool whose download URL is `url_template` with
    /// `{platform}` replaced by each platform's download slug.
    pub fn installable(name: impl Into<String>, url_template: &str) -> Self {
        let name = name.into();
        let artifacts = Platform::ALL
            .iter()
            .map(|platform| PlatformArtifact {
                platform: *platform,
                url: url_template.replace("{platform}", platform.download_slug()),
                binary: platform.binary_name(&name),
            })
            .collect();
        Self {
            name,
            lookup: LookupStrategy::OnDemandInstall,
            artifacts,
        }
    }

    pub fn artifact(&self, platform: Platform) -> Option<&PlatformArtifact> {
        self.artifacts.iter().find(|a| a.platform == platform)
    }

    pub fn binary_name(&self, platform: Platform) -> String {
        self.artifact(platform)
            .map(|a| a.binary.clone())
            .unwrap_or_else(|| platform.binary_name(&self.name))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledTool {
    pub name: String,
    pub binary_path: PathBuf,
    /// Installed by this run; its workspace is removed at cleanup.
    pub temporary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,
}

pub trait ArchiveFetcher {
    fn fetch(&self, tool: &str, url: &str) -> Result<Vec<u8>>;
}

/// Downloads archives over HTTPS with a blocking client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("divoc/{}", VERSION))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, tool: &str, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::download_failed(tool, url, None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::download_failed(
                tool,
                url,
                Some(status.as_u16()),
                format!("HTTP {}", status),
            ));
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::download_failed(tool, url, Some(status.as_u16()), e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

pub struct Installer<'a> {
    search_path: &'a SearchPath,
    fetcher: &'a dyn ArchiveFetcher,
    workspaces: &'a dyn WorkspaceAllocator,
    platform: Option<Platform>,
}

impl<'a> Installer<'a> {
    pub fn new(
        search_path: &'a SearchPath,
        fetcher: &'a dyn ArchiveFetcher,
        workspaces: &'a dyn WorkspaceAllocator,
    ) -> Self {
        Self {
            search_path,
            fetcher,
            workspaces,
            platform: None,
        }
    }

    /// Pin the host platform instead of detecting it.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    fn host(&self) -> Result<Platform> {
        match self.platform {
            Some(platform) => Ok(platform),
            None => Platform::detect(),
        }
    }

    /// Resolve `spec` on the search path, installing it when allowed.
    ///
    /// Each call re-downloads; callers keep the result for the run.
    pub fn ensure_available(&self, spec: &ToolSpec) -> Result<InstalledTool> {
        let lookup_name = match self.host() {
            Ok(platform) => spec.binary_name(platform),
            Err(_) => spec.name.clone(),
        };

        if let Some(found) = self.search_path.resolve(&lookup_name) {
            info!(tool = %spec.name, path = %found.display(), "Binary found on host PATH");
            return Ok(InstalledTool {
                name: spec.name.clone(),
                binary_path: found,
                temporary: false,
                workspace: None,
            });
        }

        if spec.lookup == LookupStrategy::OnPath {
            return Err(Error::missing_dependencies(vec![spec.name.clone()]));
        }

        info!(tool = %spec.name, "Binary not found on host PATH, installing to temporary directory");
        self.install(spec)
    }

    fn install(&self, spec: &ToolSpec) -> Result<InstalledTool> {
        let platform = self.host()?;
        debug!(platform = %platform, "Detected host platform");
        let artifact = spec
            .artifact(platform)
            .ok_or_else(|| Error::unsupported_platform(platform.as_str()))?;

        info!(tool = %spec.name, url = %artifact.url, "Downloading");
        let payload = self.fetcher.fetch(&spec.name, &artifact.url)?;
        debug!(
            tool = %spec.name,
            bytes = payload.len(),
            sha256 = %format!("{:x}", Sha256::digest(&payload)),
            "Downloaded archive"
        );

        let mut archive = zip::ZipArchive::new(Cursor::new(payload))
            .map_err(|e| Error::corrupt_archive(&spec.name, e.to_string()))?;

        let guard = WorkspaceGuard::create(self.workspaces, TOOL_INSTALL_PURPOSE)?;
        let root = guard
            .root()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::internal_unexpected("tool-install workspace missing"))?;

        if let Err(err) = extract_flat(&mut archive, &root, &spec.name) {
            return Err(abandon(guard, err));
        }

        let binary_path = root.join(&artifact.binary);
        if !binary_path.is_file() {
            let err = Error::binary_not_found_after_extraction(
                &spec.name,
                binary_path.display().to_string(),
            );
            return Err(abandon(guard, err));
        }

        info!(tool = %spec.name, path = %binary_path.display(), "Installed temporary binary");
        Ok(InstalledTool {
            name: spec.name.clone(),
            binary_path,
            temporary: true,
            workspace: guard.release(),
        })
    }
}

/// Remove a half-populated install workspace, keeping a removal failure with `err`.
fn abandon(guard: WorkspaceGuard<'_>, err: Error) -> Error {
    match guard.finish() {
        Ok(()) => err,
        Err(cleanup) => {
            warn!(error = %cleanup, "Failed to remove tool-install workspace");
            err.with_cleanup_error(cleanup)
        }
    }
}

/// Write every regular file in `archive` directly into `dest`, dropping any
/// folder structure. Later entries with the same file name overwrite earlier ones.
pub fn extract_flat<R>(
    archive: &mut zip::ZipArchive<R>,
    dest: &Path,
    tool: &str,
) -> Result<Vec<PathBuf>>
where
    R: io::Read + io::Seek,
{
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| Error::corrupt_archive(tool, e.to_string()))?;

        if entry.is_dir() || is_symlink(entry.unix_mode()) {
            continue;
        }

        let Some(file_name) = Path::new(entry.name()).file_name().map(|n| n.to_owned()) else {
            continue;
        };

        let target = dest.join(&file_name);
        debug!(entry = %entry.name(), target = %target.display(), "Decompressing");

        let extraction_error =
            |e: io::Error| Error::extraction_failed(tool, target.display().to_string(), e.to_string());

        let mut out = fs::File::create(&target).map_err(extraction_error)?;
        io::copy(&mut entry, &mut out).map_err(extraction_error)?;
        drop(out);
        make_executable(&target).map_err(extraction_error)?;

        extracted.push(target);
    }

    Ok(extracted)
}

fn is_symlink(mode: Option<u32>) -> bool {
    mode.map(|m| m & 0o170000 == 0o120000).unwrap_or(false)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
