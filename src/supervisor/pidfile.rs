//! PID files: `<pid_dir>/<name>.pid` holding a decimal process id.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::core::errors::{CfhError, Result};

const EXTENSION: &str = "pid";

/// Contents of a PID file as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidRead {
    Missing,
    Valid(i32),
    /// Present but not a positive integer; carries the raw text.
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    name: String,
    path: PathBuf,
}

/// Whether `name` is usable as a managed-process name (and thus a file stem).
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl PidFile {
    pub fn new(pid_dir: &Path, name: &str) -> Result<Self> {
        if !is_valid_name(name) {
            return Err(CfhError::UnknownProcess {
                name: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            path: pid_dir.join(format!("{name}.{EXTENSION}")),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<PidRead> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(PidRead::Missing),
            Err(err) => return Err(CfhError::io(&self.path, err)),
        };
        Ok(match raw.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => PidRead::Valid(pid),
            _ => PidRead::Corrupt(raw.trim().to_string()),
        })
    }

    /// Write via a temporary sibling and rename so readers never see a partial id.
    pub fn write(&self, pid: u32) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|err| CfhError::io(dir, err))?;

        let tmp = self.path.with_extension(format!("{EXTENSION}.tmp"));
        let mut file = fs::File::create(&tmp).map_err(|err| CfhError::io(&tmp, err))?;
        writeln!(file, "{pid}").map_err(|err| CfhError::io(&tmp, err))?;
        file.sync_all().map_err(|err| CfhError::io(&tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| CfhError::io(&self.path, err))
    }

    /// Returns whether a file was actually removed.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CfhError::io(&self.path, err)),
        }
    }

    /// Last write time, used as the process start time.
    #[must_use]
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Every `*.pid` file in `pid_dir`, sorted by name. A missing directory is empty.
pub fn list(pid_dir: &Path) -> Result<Vec<PidFile>> {
    let entries = match fs::read_dir(pid_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CfhError::io(pid_dir, err)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| CfhError::io(pid_dir, err))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if is_valid_name(stem) {
            files.push(PidFile {
                name: stem.to_string(),
                path,
            });
        } else {
            tracing::warn!(path = %path.display(), "ignoring PID file with unusable name");
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_dir = dir.path().join("pids");
        let file = PidFile::new(&pid_dir, "fillout").expect("name");
        assert_eq!(file.read().expect("read"), PidRead::Missing);

        file.write(4242).expect("write");
        assert_eq!(file.path(), pid_dir.join("fillout.pid"));
        assert_eq!(std::fs::read_to_string(file.path()).expect("raw"), "4242\n");
        assert_eq!(file.read().expect("read"), PidRead::Valid(4242));
        assert!(file.modified().is_some());

        assert!(file.remove().expect("remove"));
        assert!(!file.remove().expect("second remove"));
    }

    #[test]
    fn garbage_and_non_positive_ids_are_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = PidFile::new(dir.path(), "beat").expect("name");
        for raw in ["", "abc", "0", "-12", "12 13"] {
            std::fs::write(file.path(), raw).expect("write");
            assert!(
                matches!(file.read().expect("read"), PidRead::Corrupt(_)),
                "{raw:?} should be corrupt"
            );
        }
    }

    #[test]
    fn names_cannot_escape_the_pid_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["", "../etc/passwd", "a/b", "..", "with space"] {
            assert!(PidFile::new(dir.path(), name).is_err(), "{name:?} accepted");
        }
        assert!(PidFile::new(dir.path(), "embeddings_cpu").is_ok());
        assert!(PidFile::new(dir.path(), "hr-flower").is_ok());
    }

    #[test]
    fn list_returns_sorted_pid_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["scoring_cpu.pid", "default.pid", "notes.txt", "beat.pid.tmp"] {
            std::fs::write(dir.path().join(name), "1\n").expect("write");
        }
        let names: Vec<String> = list(dir.path())
            .expect("list")
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["default", "scoring_cpu"]);
        assert!(list(&dir.path().join("missing")).expect("missing dir").is_empty());
    }
}
