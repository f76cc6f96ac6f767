use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationMissingArgument,
    ValidationInvalidArgument,

    DependencyMissing,
    PlatformUnsupported,

    InstallDownloadFailed,
    InstallCorruptArchive,
    InstallExtractionFailed,
    InstallBinaryNotFound,

    WorkspaceAllocationFailed,
    WorkspaceCleanupFailed,

    ProcessExecutionFailed,
    StageTimeout,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::DependencyMissing => "dependency.missing",
            ErrorCode::PlatformUnsupported => "platform.unsupported",

            ErrorCode::InstallDownloadFailed => "install.download_failed",
            ErrorCode::InstallCorruptArchive => "install.corrupt_archive",
            ErrorCode::InstallExtractionFailed => "install.extraction_failed",
            ErrorCode::InstallBinaryNotFound => "install.binary_not_found",

            ErrorCode::WorkspaceAllocationFailed => "workspace.allocation_failed",
            ErrorCode::WorkspaceCleanupFailed => "workspace.cleanup_failed",

            ErrorCode::ProcessExecutionFailed => "process.execution_failed",
            ErrorCode::StageTimeout => "stage.timeout",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    pub fn all() -> &'static [ErrorCode] {
        &[
            ErrorCode::ConfigInvalidJson,
            ErrorCode::ConfigInvalidValue,
            ErrorCode::ValidationMissingArgument,
            ErrorCode::ValidationInvalidArgument,
            ErrorCode::DependencyMissing,
            ErrorCode::PlatformUnsupported,
            ErrorCode::InstallDownloadFailed,
            ErrorCode::InstallCorruptArchive,
            ErrorCode::InstallExtractionFailed,
            ErrorCode::InstallBinaryNotFound,
            ErrorCode::WorkspaceAllocationFailed,
            ErrorCode::WorkspaceCleanupFailed,
            ErrorCode::ProcessExecutionFailed,
            ErrorCode::StageTimeout,
            ErrorCode::InternalIoError,
            ErrorCode::InternalJsonError,
            ErrorCode::InternalUnexpected,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
    /// Cleanup that failed while unwinding from this error.
    pub cleanup: Vec<Error>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

/// Same shape as the error half of the CLI envelope.
impl Serialize for Error {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Error", 6)?;
        state.serialize_field("code", self.code.as_str())?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("details", &self.details)?;
        if self.hints.is_empty() {
            state.skip_field("hints")?;
        } else {
            state.serialize_field("hints", &self.hints)?;
        }
        match self.retryable {
            Some(retryable) => state.serialize_field("retryable", &retryable)?,
            None => state.skip_field("retryable")?,
        }
        if self.cleanup.is_empty() {
            state.skip_field("cleanupErrors")?;
        } else {
            state.serialize_field("cleanupErrors", &self.cleanup)?;
        }
        state.end()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidJsonDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingDependenciesDetails {
    pub missing: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFailedDetails {
    pub tool: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallDetails {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDetails {
    pub purpose: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub error: String,
}

/// Failure of an external process. `exit_code` is absent when the process
/// could not be started or was terminated by a signal.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFailedDetails {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimeoutDetails {
    pub stage: String,
    pub command: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
            cleanup: Vec::new(),
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        let message = format!("Missing required argument: {}", args.join(", "));
        Self::new(
            ErrorCode::ValidationMissingArgument,
            message,
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        let field = field.into();
        let problem = problem.into();
        let message = format!("Invalid argument '{}': {}", field, problem);
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            message,
            to_details(InvalidArgumentDetails {
                field,
                problem,
                value,
            }),
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            to_details(ConfigInvalidJsonDetails {
                path: path.into(),
                error: err.to_string(),
            }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let problem = problem.into();
        let message = format!("Invalid configuration value for '{}': {}", key, problem);
        Self::new(
            ErrorCode::ConfigInvalidValue,
            message,
            to_details(ConfigInvalidValueDetails {
                key,
                value,
                problem,
            }),
        )
    }

    pub fn missing_dependencies(missing: Vec<String>) -> Self {
        let message = format!("Missing host dependencies: {}", missing.join(", "));
        let hint = format!(
            "Install {} and make sure it is on PATH",
            missing.join(", ")
        );
        Self::new(
            ErrorCode::DependencyMissing,
            message,
            to_details(MissingDependenciesDetails { missing }),
        )
        .with_hint(hint)
    }

    pub fn unsupported_platform(os: impl Into<String>) -> Self {
        let os = os.into();
        Self::new(
            ErrorCode::PlatformUnsupported,
            format!("Unsupported platform: {}", os),
            serde_json::json!({ "os": os }),
        )
    }

    pub fn download_failed(
        tool: impl Into<String>,
        url: impl Into<String>,
        status: Option<u16>,
        error: impl Into<String>,
    ) -> Self {
        let tool = tool.into();
        let url = url.into();
        let message = format!("Failed to download {} from {}", tool, url);
        Self::new(
            ErrorCode::InstallDownloadFailed,
            message,
            to_details(DownloadFailedDetails {
                tool,
                url,
                status,
                error: error.into(),
            }),
        )
        .retryable(true)
    }

    pub fn corrupt_archive(tool: impl Into<String>, error: impl Into<String>) -> Self {
        let tool = tool.into();
        Self::new(
            ErrorCode::InstallCorruptArchive,
            format!("Downloaded {} archive could not be read", tool),
            to_details(InstallDetails {
                tool,
                path: None,
                error: error.into(),
            }),
        )
    }

    pub fn extraction_failed(
        tool: impl Into<String>,
        path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let tool = tool.into();
        let path = path.into();
        let message = format!("Failed to extract {} to {}", tool, path);
        Self::new(
            ErrorCode::InstallExtractionFailed,
            message,
            to_details(InstallDetails {
                tool,
                path: Some(path),
                error: error.into(),
            }),
        )
    }

    pub fn binary_not_found_after_extraction(
        tool: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let tool = tool.into();
        let path = path.into();
        let message = format!("{} binary not found at {} after extraction", tool, path);
        Self::new(
            ErrorCode::InstallBinaryNotFound,
            message,
            to_details(InstallDetails {
                tool,
                path: Some(path),
                error: "binary missing from archive".to_string(),
            }),
        )
    }

    pub fn workspace_allocation(purpose: impl Into<String>, error: impl Into<String>) -> Self {
        let purpose = purpose.into();
        Self::new(
            ErrorCode::WorkspaceAllocationFailed,
            format!("Failed to allocate {} workspace", purpose),
            to_details(WorkspaceDetails {
                purpose,
                path: None,
                error: error.into(),
            }),
        )
    }

    pub fn workspace_cleanup(
        purpose: impl Into<String>,
        path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let purpose = purpose.into();
        let path = path.into();
        let message = format!("Failed to remove {} workspace {}", purpose, path);
        Self::new(
            ErrorCode::WorkspaceCleanupFailed,
            message,
            to_details(WorkspaceDetails {
                purpose,
                path: Some(path),
                error: error.into(),
            }),
        )
    }

    pub fn process_execution(details: ProcessFailedDetails) -> Self {
        let message = match details.exit_code {
            Some(code) => format!("`{}` exited with code {}", details.command, code),
            None => match &details.error {
                Some(error) => format!("`{}` could not be run: {}", details.command, error),
                None => format!("`{}` was terminated by a signal", details.command),
            },
        };
        Self::new(
            ErrorCode::ProcessExecutionFailed,
            message,
            to_details(details),
        )
    }

    pub fn stage_timeout(details: StageTimeoutDetails) -> Self {
        let message = format!(
            "{} stage timed out after {}s",
            details.stage, details.timeout_secs
        );
        Self::new(ErrorCode::StageTimeout, message, to_details(details))
            .with_hint("Raise the stage timeout with --timeout-secs or in divoc.json")
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(context) => format!("IO error ({}): {}", context, error),
            None => format!("IO error: {}", error),
        };
        Self::new(
            ErrorCode::InternalIoError,
            message,
            to_details(InternalIoErrorDetails { error, context }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            to_details(InternalJsonErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            format!("Unexpected error: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_cleanup_error(mut self, cleanup: Error) -> Self {
        self.cleanup.push(cleanup);
        self
    }

    /// Detach cleanup failures so they can be reported on their own.
    pub fn take_cleanup_errors(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.cleanup)
    }
}
