//! Connection settings derived from the environment, and environment
//! validation per server role.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::core::errors::{CfhError, Result};
use crate::env::EnvSet;
use crate::topology::ServerType;

// Greedy up to the last `@` of the authority.
static URL_PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(://[^:/@]*:)([^/]*)(@)").expect("static regex is valid")
});

/// Replace the password component of a connection URL with `***`.
///
/// URLs that do not parse fall back to a pattern that masks everything between
/// the user and the last `@` before the path.
#[must_use]
pub fn mask_url(url: &str) -> String {
    if let Ok(mut parsed) = Url::parse(url) {
        if parsed.password().is_none() {
            return url.to_string();
        }
        if parsed.set_password(Some("***")).is_ok() {
            return parsed.into();
        }
    }
    URL_PASSWORD.replace(url, "${1}***${3}").into_owned()
}

/// Broker location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
    pub has_password: bool,
}

impl RedisSettings {
    /// `REDIS_URL`, else composed from `REDIS_HOST`/`PORT`/`DB`/`PASSWORD`.
    pub fn from_env(env: &EnvSet) -> Result<Self> {
        if let Some(raw) = env.non_empty("REDIS_URL") {
            let parsed = parse_url("REDIS_URL", raw)?;
            return Ok(Self {
                url: raw.trim().to_string(),
                has_password: parsed.password().is_some_and(|p| !p.is_empty()),
            });
        }
        let Some(host) = env.non_empty("REDIS_HOST") else {
            return Err(CfhError::MissingEnv {
                names: vec!["REDIS_URL".to_string()],
            });
        };
        let port = port_or(env, "REDIS_PORT", 6379)?;
        let db = env.non_empty("REDIS_DB").unwrap_or("0").trim();
        if db.parse::<u32>().is_err() {
            return Err(CfhError::InvalidConfig {
                details: format!("REDIS_DB must be a database index, got {db:?}"),
            });
        }
        let mut url = parse_url("REDIS_HOST", &format!("redis://{}:{port}/{db}", host.trim()))?;
        let password = env.non_empty("REDIS_PASSWORD");
        if let Some(password) = password {
            url.set_password(Some(password))
                .map_err(|()| CfhError::InvalidConfig {
                    details: "REDIS_PASSWORD cannot be applied to this host".to_string(),
                })?;
        }
        Ok(Self {
            url: url.to_string(),
            has_password: password.is_some(),
        })
    }

    #[must_use]
    pub fn masked(&self) -> String {
        mask_url(&self.url)
    }
}

/// Database location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub url: String,
}

impl DatabaseSettings {
    /// `DATABASE_URL`, else composed from `DB_HOST`/`PORT`/`NAME`/`USER`/`PASSWORD`.
    pub fn from_env(env: &EnvSet) -> Result<Self> {
        if let Some(raw) = env.non_empty("DATABASE_URL") {
            parse_url("DATABASE_URL", raw)?;
            return Ok(Self {
                url: raw.trim().to_string(),
            });
        }
        let required = ["DB_HOST", "DB_NAME", "DB_USER"];
        let missing: Vec<String> = required
            .iter()
            .filter(|key| !env.is_set(key))
            .map(|key| (*key).to_string())
            .collect();
        if missing.len() == required.len() {
            return Err(CfhError::MissingEnv {
                names: vec!["DATABASE_URL".to_string()],
            });
        }
        if !missing.is_empty() {
            return Err(CfhError::MissingEnv { names: missing });
        }

        let host = env.non_empty("DB_HOST").unwrap_or_default().trim();
        let name = env.non_empty("DB_NAME").unwrap_or_default().trim();
        let port = port_or(env, "DB_PORT", 5432)?;
        let mut url = parse_url("DB_HOST", &format!("postgresql://{host}:{port}/{name}"))?;
        let apply = |result: std::result::Result<(), ()>| {
            result.map_err(|()| CfhError::InvalidConfig {
                details: "DB_USER/DB_PASSWORD cannot be applied to this host".to_string(),
            })
        };
        apply(url.set_username(env.non_empty("DB_USER").unwrap_or_default().trim()))?;
        if let Some(password) = env.non_empty("DB_PASSWORD") {
            apply(url.set_password(Some(password)))?;
        }
        Ok(Self {
            url: url.to_string(),
        })
    }

    #[must_use]
    pub fn masked(&self) -> String {
        mask_url(&self.url)
    }
}

fn parse_url(source: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|err| CfhError::InvalidConfig {
        details: format!("{source} is not a valid URL: {err}"),
    })
}

fn port_or(env: &EnvSet, key: &str, default: u16) -> Result<u16> {
    env.non_empty(key).map_or(Ok(default), |raw| {
        raw.trim().parse::<u16>().map_err(|_| CfhError::InvalidConfig {
            details: format!("{key} must be a port number, got {raw:?}"),
        })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Check the environment for the given server role. Never fails; every
/// problem becomes an [`Issue`].
#[must_use]
pub fn validate(env: &EnvSet, server: ServerType) -> Vec<Issue> {
    let mut issues = Vec::new();

    let redis = match RedisSettings::from_env(env) {
        Ok(redis) => Some(redis),
        Err(err) => {
            issues.push(Issue::error(format!("redis: {err}")));
            None
        }
    };
    if let Err(err) = DatabaseSettings::from_env(env) {
        issues.push(Issue::error(format!("database: {err}")));
    }

    let production = env
        .non_empty("ENVIRONMENT")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("production"));
    if let Some(redis) = redis.filter(|r| !r.has_password) {
        if production {
            issues.push(Issue::error(format!(
                "redis at {} has no password in production; set REDIS_PASSWORD",
                redis.masked()
            )));
        } else {
            issues.push(Issue::warning(format!(
                "redis at {} has no password",
                redis.masked()
            )));
        }
    }

    match server {
        ServerType::Gpu => {
            if !env.is_set("CUDA_VISIBLE_DEVICES") {
                issues.push(Issue::warning("GPU server without CUDA_VISIBLE_DEVICES"));
            }
            if !env.is_set("VIRTUAL_ENV") {
                issues.push(Issue::warning(
                    "GPU server without VIRTUAL_ENV; celery resolves through PATH",
                ));
            }
        }
        ServerType::Cpu => {
            if env.is_set("CUDA_VISIBLE_DEVICES") {
                issues.push(Issue::error(
                    "CPU server has CUDA_VISIBLE_DEVICES set; it belongs on the GPU server only",
                ));
            }
        }
    }

    issues
}

/// Fail with the first blocking problem: the variables `start` cannot do without.
pub fn require_connection_settings(env: &EnvSet) -> Result<(RedisSettings, DatabaseSettings)> {
    let redis = RedisSettings::from_env(env);
    let database = DatabaseSettings::from_env(env);
    match (redis, database) {
        (Ok(redis), Ok(database)) => Ok((redis, database)),
        (
            Err(CfhError::MissingEnv { names: mut left }),
            Err(CfhError::MissingEnv { names: right }),
        ) => {
            left.extend(right);
            Err(CfhError::MissingEnv { names: left })
        }
        (Err(err), _) | (_, Err(err)) => Err(err),
    }
}
