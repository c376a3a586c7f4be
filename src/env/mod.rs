//! Environment loading: the process environment overlaid on the project's
//! `.env` file, handed to every launched process.

pub mod dotenv;
pub mod settings;

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::core::errors::{CfhError, Result};

/// Snapshot of environment variables passed to child processes.
///
/// The supervisor never mutates its own process environment; launched
/// processes receive exactly this set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSet {
    vars: BTreeMap<String, String>,
    /// Process variables that are not valid UTF-8; passed through untouched.
    non_utf8: Vec<(OsString, OsString)>,
    source: Option<PathBuf>,
    from_file: usize,
}

impl EnvSet {
    /// Variables of the current process.
    #[must_use]
    pub fn from_process() -> Self {
        Self::from_os_pairs(std::env::vars_os())
    }

    /// Entries that are not valid UTF-8 cannot be looked up, but are still
    /// handed to launched processes.
    pub fn from_os_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut vars = BTreeMap::new();
        let mut non_utf8 = Vec::new();
        for (key, value) in pairs {
            if let (Some(k), Some(v)) = (key.to_str(), value.to_str()) {
                vars.insert(k.to_string(), v.to_string());
                continue;
            }
            tracing::debug!(key = %key.to_string_lossy(), "environment variable is not valid UTF-8, passing it through as is");
            non_utf8.push((key, value));
        }
        Self {
            vars,
            non_utf8,
            source: None,
            from_file: 0,
        }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            non_utf8: Vec::new(),
            source: None,
            from_file: 0,
        }
    }

    /// Parse `path` and overlay `process` on top of it; values already present
    /// in the process environment win. A missing file leaves `process` as is.
    pub fn load(path: &Path, process: Self) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "env file not found, using process environment only");
                return Ok(process);
            }
            Err(err) => return Err(CfhError::io(path, err)),
        };

        let parsed = dotenv::parse_dotenv(&text, |name| process.vars.get(name).cloned())
            .map_err(|err| CfhError::EnvParse {
                path: path.to_path_buf(),
                line: err.line,
                details: err.details,
            })?;

        let mut vars: BTreeMap<String, String> = BTreeMap::new();
        let mut from_file = 0usize;
        for (key, value) in parsed {
            if process.non_utf8.iter().any(|(k, _)| k.as_os_str() == OsStr::new(&key)) {
                continue;
            }
            if !process.vars.contains_key(&key) {
                from_file += 1;
            }
            vars.insert(key, value);
        }
        vars.extend(process.vars);

        tracing::debug!(path = %path.display(), from_file, "loaded env file");
        Ok(Self {
            vars,
            non_utf8: process.non_utf8,
            source: Some(path.to_path_buf()),
            from_file,
        })
    }

    /// Raw value, including empty strings.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Value when present and not blank.
    #[must_use]
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.trim().is_empty())
    }

    #[must_use]
    pub fn is_set(&self, key: &str) -> bool {
        self.non_empty(key).is_some()
    }

    /// Fail with every key that is absent or blank.
    pub fn require(&self, keys: &[&str]) -> Result<()> {
        let missing: Vec<String> = keys
            .iter()
            .filter(|key| !self.is_set(key))
            .map(|key| (*key).to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CfhError::MissingEnv { names: missing })
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Variables that [`Self::get`] cannot return because they are not UTF-8.
    pub fn non_utf8(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.non_utf8.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// The env file this set was loaded from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Number of variables that came from the env file only.
    #[must_use]
    pub fn from_file_count(&self) -> usize {
        self.from_file
    }
}
