//! Error types for tillsync-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tillsync-core
#[derive(Error, Debug)]
pub enum Error {
    /// Local ledger store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote mirror errors
    #[error("Mirror error: {0}")]
    Mirror(#[from] MirrorError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, closed channels)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Mirror(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Status", "tillsync status")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Local ledger store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("ledger I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Io { path, .. } => {
                Remediation::new(format!("Ledger file {path} could not be read or written."))
                    .command("Inspect", format!("ls -la \"{path}\""))
                    .alternative("Ensure the data directory is writable and not full.")
            }
            Self::Encode { .. } => Remediation::new(
                "A record could not be serialized. This is a bug; please report it.",
            ),
            Self::InvalidRecord(_) => Remediation::new("Fix the record fields and retry.")
                .command("List records", "tillsync list sale"),
        }
    }
}

/// Remote mirror errors
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Mirror not configured (no spreadsheet id or credentials)
    #[error("remote mirror is disabled")]
    Disabled,

    /// Service answered with a non-success HTTP status
    #[error("remote service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Credentials rejected
    #[error("remote service rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Connection, DNS, TLS or timeout failures
    #[error("remote transport failed: {0}")]
    Transport(String),

    /// Response body did not have the expected shape
    #[error("unexpected remote response: {0}")]
    InvalidResponse(String),
}

impl MirrorError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Disabled | Self::Unauthorized { .. } | Self::InvalidResponse(_) => false,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Disabled => Remediation::new(
                "Enable the mirror and set a spreadsheet id to synchronize.",
            )
            .command("Check status", "tillsync status")
            .alternative("Set TILLSYNC_SHEETS_ENABLED=true and TILLSYNC_SPREADSHEET_ID."),
            Self::Http { status, .. } => Remediation::new(format!(
                "The spreadsheet service returned HTTP {status}. Retry later."
            ))
            .command("Check status", "tillsync status"),
            Self::Unauthorized { .. } => Remediation::new(
                "Refresh the access token and make sure the spreadsheet is shared with it.",
            )
            .alternative("Set TILLSYNC_SHEETS_TOKEN to a valid OAuth access token."),
            Self::Transport(_) => Remediation::new(
                "The spreadsheet service is unreachable. Check network connectivity.",
            )
            .command("Check status", "tillsync status")
            .alternative("Local writes continue; the next sync pass catches up."),
            Self::InvalidResponse(_) => Remediation::new(
                "The spreadsheet service returned an unexpected payload.",
            )
            .alternative("Verify the api_base setting points at the Sheets v4 API."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { path, .. } => {
                Remediation::new(format!("Make sure {path} exists and is readable."))
                    .alternative("Omit --config to run with defaults.")
            }
            Self::Parse(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Compare against the sample in README.md."),
            Self::InvalidValue { field, .. } => {
                Remediation::new(format!("Correct the value of `{field}` and retry."))
            }
        }
    }
}
