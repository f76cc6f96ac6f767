use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::defaults::GeneratorConfig;
use crate::error::{Error, Result};
use crate::platform::{self, Platform};
use crate::process::{Invocation, ProcessRunner};

pub const STAGE: &str = "generate";

pub const BULK_DATA_KEY: &str = "exporter.fhir.bulk_data";
pub const CSV_EXPORT_KEY: &str = "exporter.csv.export";

/// Properties appended to the Synthea config, applied in key order.
pub type GeneratorOptions = BTreeMap<String, String>;

/// Exporter switches for the requested output formats.
pub fn exporter_options(csv: bool, ndjson: bool) -> GeneratorOptions {
    let mut options = GeneratorOptions::new();
    options.insert(BULK_DATA_KEY.to_string(), ndjson.to_string());
    options.insert(CSV_EXPORT_KEY.to_string(), csv.to_string());
    options
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_filter: Option<String>,
    pub region: String,
    pub locality: String,
}

/// `[-s <seed>] [-p <population>] [-m <filter>] <region> <locality>`
pub fn run_args(args: &GenerateArgs) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(seed) = args.seed {
        out.push("-s".to_string());
        out.push(seed.to_string());
    }
    if let Some(population) = args.population {
        out.push("-p".to_string());
        out.push(population.to_string());
    }
    if let Some(filter) = args.module_filter.as_deref().filter(|f| !f.is_empty()) {
        out.push("-m".to_string());
        out.push(filter.to_string());
    }
    out.push(args.region.clone());
    out.push(args.locality.clone());
    out
}

pub fn properties_path(install_dir: &Path, config: &GeneratorConfig) -> PathBuf {
    install_dir.join(&config.properties_path)
}

pub fn output_path(install_dir: &Path, config: &GeneratorConfig) -> PathBuf {
    install_dir.join(&config.output_dir)
}

/// Append `key = value` lines to the properties file.
///
/// Existing lines are left alone and repeated calls append again; the last
/// occurrence of a key is the one Synthea reads.
pub fn set_options(properties: &Path, options: &GeneratorOptions) -> Result<()> {
    let existing = fs::read(properties).map_err(|e| {
        Error::internal_io(
            e.to_string(),
            Some(format!("read Synthea properties file {}", properties.display())),
        )
    })?;

    let mut file = OpenOptions::new()
        .append(true)
        .open(properties)
        .map_err(|e| {
            Error::internal_io(
                e.to_string(),
                Some(format!("open Synthea properties file {}", properties.display())),
            )
        })?;

    let write_error = |e: std::io::Error| {
        Error::internal_io(
            e.to_string(),
            Some(format!("update Synthea properties file {}", properties.display())),
        )
    };

    if !existing.is_empty() && !existing.ends_with(b"\n") {
        file.write_all(b"\n").map_err(write_error)?;
    }

    for (property, value) in options {
        info!(property = %property, value = %value, "Setting Synthea option");
        writeln!(file, "{} = {}", property, value).map_err(write_error)?;
    }
    Ok(())
}

/// Run Synthea from its checkout and return the directory it wrote to.
pub fn generate(
    runner: &dyn ProcessRunner,
    platform: Option<Platform>,
    install_dir: &Path,
    config: &GeneratorConfig,
    args: &GenerateArgs,
    timeout: Option<Duration>,
) -> Result<PathBuf> {
    if install_dir.as_os_str().is_empty() || !install_dir.is_dir() {
        return Err(Error::internal_unexpected(format!(
            "Synthea checkout not found at '{}'",
            install_dir.display()
        )));
    }

    let (program, mut launcher_args) = platform::script_launcher_on(platform, &config.run_script);
    launcher_args.extend(run_args(args));

    info!(
        population = ?args.population,
        region = %args.region,
        locality = %args.locality,
        "Generating synthetic data"
    );

    let invocation = Invocation::new(STAGE, program)
        .args(launcher_args)
        .current_dir(install_dir)
        .timeout(timeout);
    runner.run(&invocation)?;

    let output = output_path(install_dir, config);
    if !output.is_dir() {
        warn!(path = %output.display(), "Synthea finished but its output directory is missing");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn run_args_in_documented_order() {
        let args = GenerateArgs {
            seed: Some(42),
            population: Some(100),
            module_filter: Some("covid19*".to_string()),
            region: "California".to_string(),
            locality: "San Francisco".to_string(),
        };
        assert_eq!(
            run_args(&args),
            vec!["-s", "42", "-p", "100", "-m", "covid19*", "California", "San Francisco"]
        );
    }

    #[test]
    fn run_args_omit_unset_flags() {
        let args = GenerateArgs {
            region: "Ohio".to_string(),
            locality: "Columbus".to_string(),
            ..Default::default()
        };
        assert_eq!(run_args(&args), vec!["Ohio", "Columbus"]);
    }

    #[test]
    fn exporter_options_reflect_flags() {
        let options = exporter_options(true, false);
        assert_eq!(options[CSV_EXPORT_KEY], "true");
        assert_eq!(options[BULK_DATA_KEY], "false");
    }

    #[test]
    fn appended_options_follow_existing_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("synthea.properties");
        fs::write(&path, "exporter.baseDirectory = ./output/\ngenerate.default_population = 1\n")
            .unwrap();

        let mut options = GeneratorOptions::new();
        options.insert("k1".to_string(), "v1".to_string());
        options.insert("k2".to_string(), "v2".to_string());
        set_options(&path, &options).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "exporter.baseDirectory = ./output/",
                "generate.default_population = 1",
                "k1 = v1",
                "k2 = v2",
            ]
        );
    }

    #[test]
    fn missing_trailing_newline_does_not_merge_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("synthea.properties");
        fs::write(&path, "a = 1").unwrap();

        set_options(&path, &exporter_options(false, true)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "a = 1\nexporter.csv.export = false\nexporter.fhir.bulk_data = true\n"
        );
    }

    #[test]
    fn repeated_configuration_appends_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("synthea.properties");
        fs::write(&path, "").unwrap();

        let options = exporter_options(true, true);
        set_options(&path, &options).unwrap();
        set_options(&path, &options).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("exporter.csv.export = true").count(), 2);
    }

    #[test]
    fn missing_properties_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = set_options(&dir.path().join("nope.properties"), &GeneratorOptions::new())
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InternalIoError);
    }
}
