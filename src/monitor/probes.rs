//! Dependency probes: Redis and PostgreSQL reachability, queue depths.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use crate::core::errors::{CfhError, Result};
use crate::env::settings::{DatabaseSettings, RedisSettings};

use super::{CheckResult, HealthCheck};

/// Pending messages above which a queue counts as backlogged.
pub const QUEUE_BACKLOG_WARN: u64 = 100;

const PROBE_KEY: &str = "cfh:health_check";

fn redis_unreachable(err: &redis::RedisError) -> CfhError {
    CfhError::DependencyUnreachable {
        service: "redis",
        details: err.to_string(),
    }
}

fn database_unreachable(err: impl std::fmt::Display) -> CfhError {
    CfhError::DependencyUnreachable {
        service: "database",
        details: err.to_string(),
    }
}

/// Open a synchronous connection with connect, read and write timeouts.
pub fn redis_connection(settings: &RedisSettings, timeout: Duration) -> Result<redis::Connection> {
    let client = redis::Client::open(settings.url.as_str()).map_err(|e| redis_unreachable(&e))?;
    let con = client
        .get_connection_with_timeout(timeout)
        .map_err(|e| redis_unreachable(&e))?;
    con.set_read_timeout(Some(timeout))
        .and_then(|()| con.set_write_timeout(Some(timeout)))
        .map_err(|e| redis_unreachable(&e))?;
    Ok(con)
}

/// `PING` the broker.
pub fn ping_redis(settings: &RedisSettings, timeout: Duration) -> Result<()> {
    let mut con = redis_connection(settings, timeout)?;
    let reply: String = redis::cmd("PING")
        .query(&mut con)
        .map_err(|e| redis_unreachable(&e))?;
    if reply != "PONG" {
        return Err(CfhError::DependencyUnreachable {
            service: "redis",
            details: format!("unexpected PING reply {reply:?}"),
        });
    }
    Ok(())
}

/// `SELECT 1` against the database; returns the server version string.
pub fn ping_database(settings: &DatabaseSettings, timeout: Duration) -> Result<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CfhError::Runtime {
            details: format!("cannot build probe runtime: {err}"),
        })?;

    runtime.block_on(async {
        let probe = async {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(timeout)
                .connect(&settings.url)
                .await
                .map_err(database_unreachable)?;
            let one: i32 = sqlx::query_scalar("SELECT 1")
                .fetch_one(&pool)
                .await
                .map_err(database_unreachable)?;
            if one != 1 {
                return Err(database_unreachable(format!("SELECT 1 returned {one}")));
            }
            let version: String = sqlx::query_scalar("SELECT version()")
                .fetch_one(&pool)
                .await
                .map_err(database_unreachable)?;
            pool.close().await;
            Ok(version)
        };
        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| database_unreachable(format!("no answer within {}s", timeout.as_secs())))?
    })
}

/// `LLEN` of every key, in order.
pub fn queue_lengths(con: &mut redis::Connection, keys: &[String]) -> Result<Vec<(String, u64)>> {
    let mut pipe = redis::pipe();
    for key in keys {
        pipe.cmd("LLEN").arg(key);
    }
    let lengths: Vec<u64> = pipe.query(con).map_err(|e| redis_unreachable(&e))?;
    Ok(keys.iter().cloned().zip(lengths).collect())
}

fn server_version(info: &str) -> Option<&str> {
    info.lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .map(str::trim)
}

/// PING, a short-lived SET/GET/DEL round trip, and the server version.
pub struct RedisCheck {
    pub settings: Option<RedisSettings>,
    pub timeout: Duration,
}

impl HealthCheck for RedisCheck {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn run(&self) -> Result<CheckResult> {
        let Some(settings) = &self.settings else {
            return Ok(CheckResult::error("redis connection settings missing"));
        };
        let mut con = redis_connection(settings, self.timeout)?;
        let pong: String = redis::cmd("PING")
            .query(&mut con)
            .map_err(|e| redis_unreachable(&e))?;

        let value = format!("{}", std::process::id());
        redis::cmd("SET")
            .arg(PROBE_KEY)
            .arg(&value)
            .arg("EX")
            .arg(10)
            .query::<()>(&mut con)
            .map_err(|e| redis_unreachable(&e))?;
        let read_back: Option<String> = redis::cmd("GET")
            .arg(PROBE_KEY)
            .query(&mut con)
            .map_err(|e| redis_unreachable(&e))?;
        redis::cmd("DEL")
            .arg(PROBE_KEY)
            .query::<()>(&mut con)
            .map_err(|e| redis_unreachable(&e))?;

        let info: String = redis::cmd("INFO")
            .arg("server")
            .query(&mut con)
            .map_err(|e| redis_unreachable(&e))?;
        let version = server_version(&info).unwrap_or("unknown").to_string();

        let result = if read_back.as_deref() == Some(value.as_str()) && pong == "PONG" {
            CheckResult::ok(format!("redis {version} reachable"))
        } else {
            CheckResult::error("redis read/write round trip returned a different value")
        };
        Ok(result
            .detail("url", settings.masked())
            .detail("version", version))
    }
}

pub struct DatabaseCheck {
    pub settings: Option<DatabaseSettings>,
    pub timeout: Duration,
}

impl HealthCheck for DatabaseCheck {
    fn name(&self) -> &'static str {
        "database"
    }

    fn run(&self) -> Result<CheckResult> {
        let Some(settings) = &self.settings else {
            return Ok(CheckResult::error("database connection settings missing"));
        };
        let version = ping_database(settings, self.timeout)?;
        Ok(CheckResult::ok("database reachable")
            .detail("url", settings.masked())
            .detail("version", version))
    }
}

/// Backlog of the queues this host consumes.
pub struct QueuesCheck {
    pub settings: Option<RedisSettings>,
    pub keys: Vec<String>,
    pub timeout: Duration,
}

impl HealthCheck for QueuesCheck {
    fn name(&self) -> &'static str {
        "queues"
    }

    fn run(&self) -> Result<CheckResult> {
        let Some(settings) = &self.settings else {
            return Ok(CheckResult::skip("redis connection settings missing"));
        };
        if self.keys.is_empty() {
            return Ok(CheckResult::warning("no queues configured"));
        }
        let mut con = redis_connection(settings, self.timeout)?;
        let lengths = queue_lengths(&mut con, &self.keys)?;
        Ok(summarize_backlog(&lengths))
    }
}

fn summarize_backlog(lengths: &[(String, u64)]) -> CheckResult {
    let backlogged: Vec<&str> = lengths
        .iter()
        .filter(|(_, len)| *len > QUEUE_BACKLOG_WARN)
        .map(|(name, _)| name.as_str())
        .collect();
    let result = if backlogged.is_empty() {
        CheckResult::ok(format!("{} queues within limits", lengths.len()))
    } else {
        CheckResult::warning(format!("backlogged queues: {}", backlogged.join(", ")))
    };
    let pending: serde_json::Map<String, serde_json::Value> = lengths
        .iter()
        .map(|(name, len)| (name.clone(), serde_json::Value::from(*len)))
        .collect();
    result.detail("pending", serde_json::Value::Object(pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::CheckStatus;

    #[test]
    fn version_is_read_from_info() {
        let info = "# Server\r\nredis_version:7.2.4\r\nredis_mode:standalone\r\n";
        assert_eq!(server_version(info), Some("7.2.4"));
        assert_eq!(server_version("# Server\r\n"), None);
    }

    #[test]
    fn backlog_above_threshold_warns() {
        let ok = summarize_backlog(&[("default".into(), 3), ("fillout".into(), QUEUE_BACKLOG_WARN)]);
        assert_eq!(ok.status, CheckStatus::Ok);

        let warn = summarize_backlog(&[("default".into(), 3), ("fillout".into(), 500)]);
        assert_eq!(warn.status, CheckStatus::Warning);
        assert!(warn.message.contains("fillout"));
        assert_eq!(warn.details["pending"]["fillout"], 500);
    }

    #[test]
    fn missing_settings_do_not_touch_the_network() {
        let redis = RedisCheck {
            settings: None,
            timeout: Duration::from_millis(10),
        };
        assert_eq!(redis.run().expect("run").status, CheckStatus::Error);
        let queues = QueuesCheck {
            settings: None,
            keys: vec!["default".into()],
            timeout: Duration::from_millis(10),
        };
        assert_eq!(queues.run().expect("run").status, CheckStatus::Skip);
    }

    #[test]
    fn unreachable_redis_is_a_dependency_error() {
        // Port 1 on loopback refuses connections.
        let settings = RedisSettings {
            url: "redis://127.0.0.1:1/0".into(),
            has_password: false,
        };
        let err = ping_redis(&settings, Duration::from_millis(500)).unwrap_err();
        assert_eq!(err.code(), "CFH-2001");
    }

    #[test]
    fn unreachable_database_is_a_dependency_error() {
        let settings = DatabaseSettings {
            url: "postgresql://hr@127.0.0.1:1/hr".into(),
        };
        let err = ping_database(&settings, Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.code(), "CFH-2001");
    }
}
