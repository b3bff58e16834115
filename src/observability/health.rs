use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let has_unhealthy = dependencies.iter().any(|d| d.status.is_unhealthy());
        let has_degraded = dependencies.iter().any(|d| d.status.is_degraded());

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// A dependency whose health can be probed.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> DependencyHealth;
}

fn timed(name: &str, start: std::time::Instant, degraded_above_ms: f64) -> DependencyHealth {
    let latency = start.elapsed().as_secs_f64() * 1000.0;
    if latency > degraded_above_ms {
        DependencyHealth {
            name: name.to_string(),
            status: HealthStatus::Degraded,
            latency_ms: Some(latency),
            message: Some("High latency detected".to_string()),
        }
    } else {
        DependencyHealth::healthy(name, latency)
    }
}

/// Probes the durable record store.
pub struct PostgresProbe {
    pool: PgPool,
}

impl PostgresProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DependencyProbe for PostgresProbe {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> DependencyHealth {
        let start = std::time::Instant::now();

        match tokio::time::timeout(
            PROBE_TIMEOUT,
            sqlx::query("SELECT 1").fetch_one(&self.pool)
        ).await {
            Ok(Ok(_)) => timed(self.name(), start, 100.0),
            Ok(Err(e)) => DependencyHealth::unhealthy(self.name(), format!("Query failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy(self.name(), "Connection timeout"),
        }
    }
}

/// Probes the lease coordination store.
pub struct RedisProbe {
    client: redis::Client,
}

impl RedisProbe {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DependencyProbe for RedisProbe {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check(&self) -> DependencyHealth {
        let start = std::time::Instant::now();

        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                match tokio::time::timeout(
                    PROBE_TIMEOUT,
                    redis::cmd("PING").query_async::<_, ()>(&mut conn)
                ).await {
                    Ok(Ok(_)) => timed(self.name(), start, 50.0),
                    Ok(Err(e)) => DependencyHealth::unhealthy(self.name(), format!("PING failed: {}", e)),
                    Err(_) => DependencyHealth::unhealthy(self.name(), "PING timeout"),
                }
            }
            Err(e) => DependencyHealth::unhealthy(self.name(), format!("Connection failed: {}", e)),
        }
    }
}

/// Health checker for all dependencies.
pub struct HealthChecker {
    probes: Vec<Arc<dyn DependencyProbe>>,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn DependencyProbe>>) -> Self {
        Self {
            probes,
            start_time: std::time::Instant::now(),
        }
    }

    /// Checker for the PostgreSQL record store and Redis lease store.
    pub fn for_stores(pool: PgPool, redis_client: redis::Client) -> Self {
        Self::new(vec![
            Arc::new(PostgresProbe::new(pool)),
            Arc::new(RedisProbe::new(redis_client)),
        ])
    }

    /// Performs a full health check of all dependencies.
    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            dependencies.push(probe.check().await);
        }

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            dependencies,
        )
    }

    /// Liveness check - returns true if the service is alive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Readiness check - no dependency may be unhealthy. A slow store still
    /// accepts traffic.
    pub async fn is_ready(&self) -> bool {
        for probe in &self.probes {
            if probe.check().await.status.is_unhealthy() {
                return false;
            }
        }
        true
    }

    /// Returns uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
