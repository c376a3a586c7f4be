//! Host resource sampling: filesystem capacity and memory usage.

#![allow(missing_docs)]

use std::path::Path;

use crate::core::errors::{CfhError, Result};

/// Capacity of the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    /// Bytes available to unprivileged users.
    pub available_bytes: u64,
}

impl FsStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn free_pct(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.available_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemoryInfo {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_pct(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Source of host resource figures; swapped out in tests.
pub trait SystemProbe: Send + Sync {
    fn fs_stats(&self, path: &Path) -> Result<FsStats>;

    /// `Ok(None)` where memory figures are unavailable on this platform.
    fn memory_info(&self) -> Result<Option<MemoryInfo>>;
}

/// The real host: `statvfs(3)` and `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl SystemProbe for HostProbe {
    fn fs_stats(&self, path: &Path) -> Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|errno| CfhError::io(path, std::io::Error::from(errno)))?;
        let fragment = u64::from(stat.fragment_size());
        Ok(FsStats {
            total_bytes: u64::from(stat.blocks()).saturating_mul(fragment),
            available_bytes: u64::from(stat.blocks_available()).saturating_mul(fragment),
        })
    }

    #[cfg(target_os = "linux")]
    fn memory_info(&self) -> Result<Option<MemoryInfo>> {
        let path = Path::new("/proc/meminfo");
        let text = std::fs::read_to_string(path).map_err(|err| CfhError::io(path, err))?;
        parse_meminfo(&text).map(Some).ok_or_else(|| CfhError::Runtime {
            details: "MemTotal/MemAvailable missing from /proc/meminfo".to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn memory_info(&self) -> Result<Option<MemoryInfo>> {
        Ok(None)
    }
}

/// Extract `MemTotal` and `MemAvailable` (kB) from `/proc/meminfo` text.
#[must_use]
pub fn parse_meminfo(text: &str) -> Option<MemoryInfo> {
    let field = |name: &str| {
        text.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kb.saturating_mul(1024))
        })
    };
    Some(MemoryInfo {
        total_bytes: field("MemTotal")?,
        available_bytes: field("MemAvailable")?,
    })
}
