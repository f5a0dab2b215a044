use std::net::UdpSocket;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource and lifecycle knobs for the orchestrator. All values are
/// configuration, not state: they are read once at construction and
/// never change for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Inclusive lower bound of the host port range handed to labs.
    pub port_range_start: u16,
    /// Exclusive upper bound of the host port range.
    pub port_range_end: u16,
    /// Port exposed inside the lab container.
    pub container_port: u16,
    /// Hard memory ceiling per instance, in bytes.
    pub memory_limit: i64,
    /// CPU quota as a fraction of one core (0.5 = half a core).
    pub cpu_limit: f64,
    /// Soft lifetime granted to a new instance, in minutes.
    pub default_timeout_minutes: i64,
    /// Cap on total lifetime from creation, extension included.
    pub max_total_minutes: i64,
    /// Hard age ceiling for the stale safety-net sweep, in minutes.
    pub stale_ceiling_minutes: i64,
    /// Interval between reaper ticks.
    pub sweep_interval: Duration,
    /// Delay before verifying a fresh container reports running.
    pub settle_delay: Duration,
    /// Graceful stop timeout, in seconds.
    pub stop_timeout_secs: i64,
    /// Image launched when the requested one does not exist.
    pub fallback_image: String,
    /// Address learners connect to; autodetected when not configured.
    pub host_address: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port_range_start: 20000,
            port_range_end: 30000,
            container_port: 80,
            memory_limit: 512 * 1024 * 1024,
            cpu_limit: 0.5,
            default_timeout_minutes: 120,
            max_total_minutes: 240,
            stale_ceiling_minutes: 240,
            sweep_interval: Duration::from_secs(300),
            settle_delay: Duration::from_secs(2),
            stop_timeout_secs: 10,
            fallback_image: "nginx:alpine".to_string(),
            host_address: detect_host_address(),
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `LABORC_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            port_range_start: env_parse("LABORC_PORT_RANGE_START", defaults.port_range_start),
            port_range_end: env_parse("LABORC_PORT_RANGE_END", defaults.port_range_end),
            container_port: env_parse("LABORC_CONTAINER_PORT", defaults.container_port),
            memory_limit: env_parse("LABORC_MEMORY_LIMIT", defaults.memory_limit),
            cpu_limit: env_parse("LABORC_CPU_LIMIT", defaults.cpu_limit),
            default_timeout_minutes: env_parse(
                "LABORC_DEFAULT_TIMEOUT_MINUTES",
                defaults.default_timeout_minutes,
            ),
            max_total_minutes: env_parse("LABORC_MAX_TOTAL_MINUTES", defaults.max_total_minutes),
            stale_ceiling_minutes: env_parse(
                "LABORC_STALE_CEILING_MINUTES",
                defaults.stale_ceiling_minutes,
            ),
            sweep_interval: Duration::from_secs(env_parse("LABORC_SWEEP_INTERVAL_SECS", 300u64)),
            settle_delay: Duration::from_secs(env_parse("LABORC_SETTLE_DELAY_SECS", 2u64)),
            stop_timeout_secs: env_parse("LABORC_STOP_TIMEOUT_SECS", defaults.stop_timeout_secs),
            fallback_image: std::env::var("LABORC_FALLBACK_IMAGE")
                .unwrap_or(defaults.fallback_image),
            host_address: std::env::var("LABORC_HOST_ADDRESS").unwrap_or(defaults.host_address),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Best-effort detection of the address learners should connect to.
/// Connecting a UDP socket performs no traffic; it only asks the kernel
/// which local address would route outward.
pub fn detect_host_address() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
