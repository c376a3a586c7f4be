//! Compute Engine instance control through the `gcloud` CLI.

use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;

use crate::core::config::Config;
use crate::core::errors::{CfhError, Result};
use crate::env::EnvSet;
use crate::topology::{self, Architecture, ServerType};

use super::autoscaler::{InstanceControl, InstanceState};

/// Where the GPU instance lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub name: String,
    pub project: String,
    pub zone: String,
}

impl InstanceTarget {
    /// Resolve from the environment. Only a CPU server with the GPU flag set
    /// manages the GPU instance.
    pub fn resolve(architecture: Architecture, env: &EnvSet, config: &Config) -> Result<Self> {
        if architecture.server == ServerType::Gpu {
            return Err(CfhError::InvalidConfig {
                details: "the GPU instance is managed from the CPU server".to_string(),
            });
        }
        let Some(name) = topology::gpu_instance(env) else {
            return Err(CfhError::MissingEnv {
                names: vec![topology::GPU_INSTANCE_VAR.to_string()],
            });
        };
        let Some(project) = env
            .non_empty("GOOGLE_CLOUD_PROJECT")
            .or_else(|| env.non_empty("GCP_PROJECT_ID"))
        else {
            return Err(CfhError::MissingEnv {
                names: vec!["GOOGLE_CLOUD_PROJECT".to_string()],
            });
        };
        let zone = env
            .non_empty("GOOGLE_CLOUD_ZONE")
            .or_else(|| env.non_empty("GCP_ZONE"))
            .unwrap_or(config.gpu_monitor.default_zone.as_str());
        Ok(Self {
            name: name.to_string(),
            project: project.trim().to_string(),
            zone: zone.trim().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Describe {
    status: String,
}

pub struct GcloudInstance {
    binary: PathBuf,
    target: InstanceTarget,
}

impl GcloudInstance {
    #[must_use]
    pub const fn new(binary: PathBuf, target: InstanceTarget) -> Self {
        Self { binary, target }
    }

    #[must_use]
    pub fn args(&self, verb: &str) -> Vec<String> {
        vec![
            "compute".to_string(),
            "instances".to_string(),
            verb.to_string(),
            self.target.name.clone(),
            format!("--zone={}", self.target.zone),
            format!("--project={}", self.target.project),
            "--format=json".to_string(),
        ]
    }

    /// Run `gcloud compute instances <verb>`; `Ok(None)` when the instance
    /// does not exist.
    fn run(&self, verb: &str) -> Result<Option<String>> {
        let args = self.args(verb);
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        tracing::debug!(%command, "running gcloud");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|err| CfhError::ExternalCommand {
                command: command.clone(),
                details: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("was not found") {
            return Ok(None);
        }
        Err(CfhError::ExternalCommand {
            command,
            details: format!("{}: {}", output.status, stderr.trim()),
        })
    }
}

/// Parse `describe --format=json` output.
pub fn parse_describe(json: &str) -> Result<InstanceState> {
    let describe: Describe = serde_json::from_str(json)?;
    Ok(InstanceState::from_status(&describe.status))
}

impl InstanceControl for GcloudInstance {
    fn state(&self) -> Result<InstanceState> {
        match self.run("describe")? {
            Some(json) => parse_describe(&json),
            None => Ok(InstanceState::NotFound),
        }
    }

    fn start(&self) -> Result<()> {
        tracing::info!(instance = %self.target.name, zone = %self.target.zone, "starting GPU instance");
        self.run("start")?.map(|_| ()).ok_or_else(|| not_found(&self.target))
    }

    fn stop(&self) -> Result<()> {
        tracing::info!(instance = %self.target.name, zone = %self.target.zone, "stopping GPU instance");
        self.run("stop")?.map(|_| ()).ok_or_else(|| not_found(&self.target))
    }
}

fn not_found(target: &InstanceTarget) -> CfhError {
    CfhError::ExternalCommand {
        command: "gcloud compute instances".to_string(),
        details: format!("instance {} was not found in {}", target.name, target.zone),
    }
}
