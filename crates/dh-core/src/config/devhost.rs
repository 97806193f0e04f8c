//! Daemon and helper configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Configuration for the devhost daemon
///
/// Paths left unset are derived from `data_dir`, so relocating the data
/// directory (as the tests do) moves everything with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevhostConfig {
    /// Root for state, logs and per-instance data
    pub data_dir: PathBuf,

    /// Top-level domain served locally (without the leading dot)
    pub tld: String,

    /// Control socket path (defaults to `{data_dir}/devhost.sock`)
    pub ipc_socket: Option<PathBuf>,

    /// State snapshot path (defaults to `{data_dir}/state.json`)
    pub state_file: Option<PathBuf>,

    pub supervisor: SupervisorConfig,
    pub proxy: ProxyConfig,
    pub dns: DnsConfig,
    pub helper: HelperConfig,
    pub parking: ParkingConfig,
}

impl Default for DevhostConfig {
    fn default() -> Self {
        Self {
            data_dir: super::default_data_dir(),
            tld: "test".to_string(),
            ipc_socket: None,
            state_file: None,
            supervisor: SupervisorConfig::default(),
            proxy: ProxyConfig::default(),
            dns: DnsConfig::default(),
            helper: HelperConfig::default(),
            parking: ParkingConfig::default(),
        }
    }
}

impl DevhostConfig {
    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Control socket path
    pub fn ipc_socket_path(&self) -> PathBuf {
        self.ipc_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join("devhost.sock"))
    }

    /// State snapshot path
    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("state.json"))
    }

    /// PID file guarding against a second daemon
    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("devhost.pid")
    }

    /// Directory holding per-instance log files
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Data directory of a single instance, keyed by its stable id
    pub fn instance_data_dir(&self, instance_id: &str) -> PathBuf {
        self.data_dir.join("instances").join(instance_id)
    }

    /// Root of installed service binaries
    pub fn bin_dir(&self) -> PathBuf {
        self.supervisor
            .bin_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("bin"))
    }

    /// Directory the reverse-proxy configuration is rendered into
    pub fn proxy_config_dir(&self) -> PathBuf {
        self.proxy
            .config_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("caddy"))
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tld = self.tld.trim_matches('.');
        if tld.is_empty()
            || !tld
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(ConfigError::Invalid(format!(
                "tld must be lowercase letters, digits or hyphens: {:?}",
                self.tld
            )));
        }
        if self.helper.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "helper.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.supervisor.sweep_interval.is_zero() || self.parking.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "background intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Root of installed binaries, laid out as `{type}/{version}/{binary}`
    pub bin_dir: Option<PathBuf>,

    /// Upper bound on the startup probe
    #[serde(with = "duration_secs")]
    pub startup_timeout: Duration,

    /// How long `stop` waits after SIGTERM before SIGKILL
    #[serde(with = "duration_secs")]
    pub stop_grace_period: Duration,

    /// Timeout for a single health probe
    #[serde(with = "duration_millis")]
    pub health_timeout: Duration,

    /// Interval of the background health sweep
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            startup_timeout: Duration::from_secs(10),
            stop_grace_period: Duration::from_secs(5),
            health_timeout: Duration::from_millis(2000),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Reverse-proxy (Caddy) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Whether configuration is rendered and reloaded at all
    pub enabled: bool,

    /// Proxy executable
    pub binary: PathBuf,

    /// Render directory (defaults to `{data_dir}/caddy`)
    pub config_dir: Option<PathBuf>,

    /// Bound on a single reload command
    #[serde(with = "duration_secs")]
    pub reload_timeout: Duration,

    /// Root certificate of the proxy's local CA
    pub ca_cert_path: PathBuf,

    pub http_port: u16,
    pub https_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: PathBuf::from("caddy"),
            config_dir: None,
            reload_timeout: Duration::from_secs(10),
            ca_cert_path: default_caddy_root_cert(),
            http_port: 80,
            https_port: 443,
        }
    }
}

/// Where Caddy keeps the root of its `tls internal` authority
fn default_caddy_root_cert() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("caddy/pki/authorities/local/root.crt")
}

/// DNS responder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,

    /// Address the responder binds (UDP and TCP)
    pub bind: SocketAddr,

    /// TTL of synthesized loopback answers
    pub ttl: u32,

    /// Resolver for names outside the tld (system configuration when unset)
    pub upstream: Option<SocketAddr>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 5354)),
            ttl: 5,
            upstream: None,
        }
    }
}

/// Privileged helper settings, shared by both sides of the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Socket the helper listens on
    pub socket_path: PathBuf,

    /// Bound on a single round trip
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Requests allowed to wait behind the one in flight
    pub queue_depth: usize,

    /// Only this uid (and root) may connect; None allows root only
    pub allowed_uid: Option<u32>,

    /// Paths the helper is willing to touch
    pub allowed_roots: Vec<PathBuf>,

    /// Where daemon programs must live; never a user-writable tree
    pub program_roots: Vec<PathBuf>,

    /// Override for the daemon definition directory
    pub daemon_dir: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/devhost-helper.sock"),
            request_timeout: Duration::from_secs(5),
            queue_depth: 8,
            allowed_uid: None,
            allowed_roots: vec![
                PathBuf::from("/Users"),
                PathBuf::from("/home"),
                PathBuf::from("/usr/local/devhost"),
                PathBuf::from("/opt/devhost"),
            ],
            program_roots: vec![
                PathBuf::from("/usr/local/devhost"),
                PathBuf::from("/opt/devhost"),
            ],
            daemon_dir: None,
        }
    }
}

impl HelperConfig {
    /// Whether `path` sits below one of the allowed roots
    pub fn is_allowed(&self, path: &Path) -> bool {
        self.allowed_roots.iter().any(|root| path.starts_with(root))
    }

    /// Whether `path` sits below one of the program roots
    pub fn is_program_allowed(&self, path: &Path) -> bool {
        self.program_roots.iter().any(|root| path.starts_with(root))
    }
}

/// Parking engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkingConfig {
    /// Interval of the background refresh over all parked directories
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,

    /// Upstream port used when `park` is not given one
    pub default_upstream_port: u16,
}

impl Default for ParkingConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            default_upstream_port: 8000,
        }
    }
}
