//! CPU/GPU architecture switch: which server role this host plays, which
//! processes it runs and where tasks are routed.

pub mod plan;
pub mod routing;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::core::errors::CfhError;
use crate::env::EnvSet;

/// Variable whose presence means a dedicated GPU instance exists.
pub const GPU_INSTANCE_VAR: &str = "GPU_INSTANCE_NAME";

/// Variable consulted when `--server-type` is not given.
pub const SERVER_TYPE_VAR: &str = "SERVER_TYPE";

/// Role of the host running the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Cpu,
    Gpu,
}

impl ServerType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }

    /// Explicit flag first, then `SERVER_TYPE`, then CPU.
    pub fn resolve(flag: Option<Self>, env: &EnvSet) -> Result<Self, CfhError> {
        if let Some(server) = flag {
            return Ok(server);
        }
        env.non_empty(SERVER_TYPE_VAR)
            .map_or(Ok(Self::Cpu), str::parse)
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerType {
    type Err = CfhError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(CfhError::InvalidConfig {
                details: format!("server type must be `cpu` or `gpu`, got {other:?}"),
            }),
        }
    }
}

/// Name of the dedicated GPU instance, when one is configured.
#[must_use]
pub fn gpu_instance(env: &EnvSet) -> Option<&str> {
    env.non_empty(GPU_INSTANCE_VAR).map(str::trim)
}

/// Server role plus GPU flag: everything the plan and routing depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Architecture {
    pub server: ServerType,
    pub gpu_enabled: bool,
}

impl Architecture {
    #[must_use]
    pub const fn new(server: ServerType, gpu_enabled: bool) -> Self {
        Self {
            server,
            gpu_enabled,
        }
    }

    pub fn detect(flag: Option<ServerType>, env: &EnvSet) -> Result<Self, CfhError> {
        let server = ServerType::resolve(flag, env)?;
        Ok(Self::new(server, gpu_instance(env).is_some()))
    }
}
