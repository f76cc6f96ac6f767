use clap::Args;
use tracing::warn;

use divoc::auth::ServicePrincipal;
use divoc::defaults::{self, StageTimeouts};
use divoc::dependency::SearchPath;
use divoc::installer::HttpFetcher;
use divoc::paths;
use divoc::pipeline::{Pipeline, PipelineReport, PipelineRequest};
use divoc::platform::Platform;
use divoc::process::SystemRunner;
use divoc::stages::azcopy;
use divoc::stages::synthea::{self, GenerateArgs as SyntheaArgs};
use divoc::validation;
use divoc::workspace::TempWorkspaces;
use divoc::{Error, Result};

use super::CmdResult;

#[derive(Args)]
pub struct GenerateArgs {
    /// Number of living patients to generate
    #[arg(long, default_value_t = 100)]
    pub population: u32,

    /// State to generate patients in
    #[arg(long, default_value = "California")]
    pub state: String,

    /// City to generate patients in
    #[arg(long, default_value = "San Francisco")]
    pub city: String,

    /// Random seed for reproducible populations
    #[arg(long, allow_negative_numbers = true)]
    pub seed: Option<i64>,

    /// Only load Synthea modules matching this pattern
    #[arg(long)]
    pub module_filter: Option<String>,

    /// Generate CSV output in addition to FHIR
    #[arg(long)]
    pub csv: bool,

    /// Generate bulk FHIR dumps in NDJSON format
    #[arg(long)]
    pub ndjson: bool,

    /// Keep the Synthea checkout and its output after the run
    #[arg(long)]
    pub no_clean: bool,

    /// Service principal client ID to log azcopy in with
    #[arg(long)]
    pub sp_client_id: Option<String>,

    /// Service principal client secret
    #[arg(long, env = "DIVOC_SP_CLIENT_SECRET", hide_env_values = true)]
    pub sp_client_secret: Option<String>,

    /// Service principal tenant ID
    #[arg(long)]
    pub sp_tenant_id: Option<String>,

    /// Azure storage account name to push data to
    #[arg(long)]
    pub storage_account: Option<String>,

    /// Azure blob container name to push data to
    #[arg(long)]
    pub storage_container: Option<String>,

    /// Transfer this location instead of the generated output
    #[arg(long)]
    pub source: Option<String>,

    /// Limit for each external stage, overriding configured timeouts
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

pub fn run(args: GenerateArgs, global: &super::GlobalArgs) -> CmdResult<PipelineReport> {
    let request = build_request(&args)?;

    let mut defaults = defaults::load_config(global.config.as_deref())?.defaults;
    if let Some(secs) = args.timeout_secs {
        defaults.timeouts = StageTimeouts::uniform(secs);
    }

    let platform = match Platform::detect() {
        Ok(platform) => Some(platform),
        Err(err) => {
            warn!(error = %err, "Unknown host platform, tools must already be on PATH");
            None
        }
    };
    let workspaces = TempWorkspaces::new(paths::workspace_base(defaults.workspace_root.as_deref()));
    let fetcher = HttpFetcher::new(std::time::Duration::from_secs(
        defaults.transfer.download_timeout_secs,
    ))?;

    let pipeline = Pipeline {
        runner: &SystemRunner,
        workspaces: &workspaces,
        fetcher: &fetcher,
        search_path: SearchPath::from_env(),
        platform,
        home: paths::home()?,
        defaults,
    };

    let report = pipeline.run(&request);
    let exit_code = report
        .error
        .as_ref()
        .map(|err| crate::output::exit_code_for_error(err.code))
        .unwrap_or(0);
    Ok((report, exit_code))
}

/// Validate flags into a pipeline request. Nothing touches the filesystem here.
fn build_request(args: &GenerateArgs) -> Result<PipelineRequest> {
    let (account, container) = match (&args.storage_account, &args.storage_container) {
        (Some(account), Some(container)) => (account.as_str(), container.as_str()),
        (account, container) => {
            let mut missing = Vec::new();
            if account.is_none() {
                missing.push("storage-account".to_string());
            }
            if container.is_none() {
                missing.push("storage-container".to_string());
            }
            return Err(Error::validation_missing_argument(missing));
        }
    };
    let account = validation::storage_account(account)?;
    let container = validation::storage_container(container)?;

    let state = validation::require_non_empty(&args.state, "state", "state must not be empty")?;
    let city = validation::require_non_empty(&args.city, "city", "city must not be empty")?;

    let has_credentials = validation::all_or_none(&[
        ("sp-client-id", args.sp_client_id.as_deref()),
        ("sp-client-secret", args.sp_client_secret.as_deref()),
        ("sp-tenant-id", args.sp_tenant_id.as_deref()),
    ])?;
    let credentials = match (&args.sp_client_id, &args.sp_client_secret, &args.sp_tenant_id) {
        (Some(id), Some(secret), Some(tenant)) if has_credentials => {
            Some(ServicePrincipal::new(id, secret, tenant))
        }
        _ => None,
    };

    Ok(PipelineRequest {
        generate: SyntheaArgs {
            seed: args.seed,
            population: Some(args.population),
            module_filter: args.module_filter.clone(),
            region: state.to_string(),
            locality: city.to_string(),
        },
        options: synthea::exporter_options(args.csv, args.ndjson),
        credentials,
        destination: azcopy::blob_container_url(account, container),
        source: args.source.clone(),
        no_clean: args.no_clean,
    })
}
