//! CFH-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CfhError>;

/// Top-level error type for the fleet helper.
#[derive(Debug, Error)]
pub enum CfhError {
    #[error("[CFH-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CFH-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CFH-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CFH-1004] malformed env file {path} at line {line}: {details}")]
    EnvParse {
        path: PathBuf,
        line: usize,
        details: String,
    },

    #[error("[CFH-1005] missing environment variable(s): {}", names.join(", "))]
    MissingEnv { names: Vec<String> },

    #[error("[CFH-2001] {service} unreachable: {details}")]
    DependencyUnreachable {
        service: &'static str,
        details: String,
    },

    #[error("[CFH-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CFH-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[CFH-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CFH-3900] runtime failure: {details}")]
    Runtime { details: String },

    #[error("[CFH-4002] {name} exited during startup; see {log}")]
    StartupFailed { name: String, log: PathBuf },

    #[error("[CFH-4003] failed to signal pid {pid}: {details}")]
    Signal { pid: i32, details: String },

    #[error("[CFH-4004] external command `{command}` failed: {details}")]
    ExternalCommand { command: String, details: String },

    #[error("[CFH-4005] unknown managed process: {name}")]
    UnknownProcess { name: String },
}

impl CfhError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CFH-1001",
            Self::MissingConfig { .. } => "CFH-1002",
            Self::ConfigParse { .. } => "CFH-1003",
            Self::EnvParse { .. } => "CFH-1004",
            Self::MissingEnv { .. } => "CFH-1005",
            Self::DependencyUnreachable { .. } => "CFH-2001",
            Self::Serialization { .. } => "CFH-2101",
            Self::PermissionDenied { .. } => "CFH-3001",
            Self::Io { .. } => "CFH-3002",
            Self::Runtime { .. } => "CFH-3900",
            Self::StartupFailed { .. } => "CFH-4002",
            Self::Signal { .. } => "CFH-4003",
            Self::ExternalCommand { .. } => "CFH-4004",
            Self::UnknownProcess { .. } => "CFH-4005",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::DependencyUnreachable { .. }
                | Self::ExternalCommand { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied { path };
        }
        Self::Io { path, source }
    }
}

impl From<serde_json::Error> for CfhError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CfhError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(unix)]
impl From<nix::Error> for CfhError {
    fn from(value: nix::Error) -> Self {
        Self::Runtime {
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CfhError;

    #[test]
    fn missing_env_lists_every_name() {
        let err = CfhError::MissingEnv {
            names: vec!["REDIS_URL".to_string(), "DATABASE_URL".to_string()],
        };
        let text = err.to_string();
        assert!(text.starts_with("[CFH-1005]"));
        assert!(text.contains("REDIS_URL, DATABASE_URL"));
        assert_eq!(err.code(), "CFH-1005");
    }

    #[test]
    fn permission_denied_io_maps_to_dedicated_variant() {
        let err = CfhError::io(
            "/root/pids",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.code(), "CFH-3001");
        assert!(!err.is_retryable());
    }
}
