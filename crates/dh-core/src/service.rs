//! Service types and their per-type configuration
//!
//! Each [`ServiceType`] knows its default port, binary name and health probe.
//! [`ServiceConfig`] is tagged by service type so every variant carries only
//! the fields that type understands, and [`ServiceType::config_schema`]
//! describes those fields for front ends.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DevhostError;

/// Kinds of local services devhost supervises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    AppServer,
    SqlDatabase,
    NoSqlDatabase,
    Cache,
    Search,
    ObjectStorage,
    Mail,
    Queue,
    Tunnel,
    Workflow,
}

impl ServiceType {
    /// Every supported service type
    pub const ALL: [ServiceType; 10] = [
        ServiceType::AppServer,
        ServiceType::SqlDatabase,
        ServiceType::NoSqlDatabase,
        ServiceType::Cache,
        ServiceType::Search,
        ServiceType::ObjectStorage,
        ServiceType::Mail,
        ServiceType::Queue,
        ServiceType::Tunnel,
        ServiceType::Workflow,
    ];

    /// Identifier used in paths and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::AppServer => "app-server",
            ServiceType::SqlDatabase => "sql-database",
            ServiceType::NoSqlDatabase => "nosql-database",
            ServiceType::Cache => "cache",
            ServiceType::Search => "search",
            ServiceType::ObjectStorage => "object-storage",
            ServiceType::Mail => "mail",
            ServiceType::Queue => "queue",
            ServiceType::Tunnel => "tunnel",
            ServiceType::Workflow => "workflow",
        }
    }

    /// Port tried first when allocating
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceType::AppServer => 8000,
            ServiceType::SqlDatabase => 5432,
            ServiceType::NoSqlDatabase => 27017,
            ServiceType::Cache => 6379,
            ServiceType::Search => 7700,
            ServiceType::ObjectStorage => 9000,
            ServiceType::Mail => 8025,
            ServiceType::Queue => 4222,
            ServiceType::Tunnel => 20241,
            ServiceType::Workflow => 7233,
        }
    }

    /// Executable name inside `{bin_dir}/{type}/{version}/`
    pub fn binary_name(&self) -> &'static str {
        match self {
            ServiceType::AppServer => "frankenphp",
            ServiceType::SqlDatabase => "postgres",
            ServiceType::NoSqlDatabase => "mongod",
            ServiceType::Cache => "redis-server",
            ServiceType::Search => "meilisearch",
            ServiceType::ObjectStorage => "minio",
            ServiceType::Mail => "mailpit",
            ServiceType::Queue => "nats-server",
            ServiceType::Tunnel => "cloudflared",
            ServiceType::Workflow => "temporal",
        }
    }

    /// How liveness is checked for this type
    pub fn health_probe(&self) -> HealthProbe {
        match self {
            ServiceType::AppServer => HealthProbe::Http { path: "/".into() },
            ServiceType::Search => HealthProbe::Http {
                path: "/health".into(),
            },
            ServiceType::ObjectStorage => HealthProbe::Http {
                path: "/minio/health/live".into(),
            },
            ServiceType::Mail => HealthProbe::Http {
                path: "/livez".into(),
            },
            ServiceType::Tunnel => HealthProbe::Http {
                path: "/ready".into(),
            },
            ServiceType::SqlDatabase
            | ServiceType::NoSqlDatabase
            | ServiceType::Cache
            | ServiceType::Queue
            | ServiceType::Workflow => HealthProbe::Tcp,
        }
    }

    /// Whether domains pointing at this type make sense (HTTP speaking)
    pub fn is_routable(&self) -> bool {
        matches!(self.health_probe(), HealthProbe::Http { .. })
    }

    /// Typed field descriptions for this type's configuration
    pub fn config_schema(&self) -> Vec<ConfigField> {
        match self {
            ServiceType::AppServer => vec![
                ConfigField::optional("document_root", "Document root", FieldKind::Path),
                ConfigField::optional("workers", "Worker count", FieldKind::Integer),
            ],
            ServiceType::SqlDatabase => vec![
                ConfigField::required("username", "Superuser", FieldKind::Text, Some("postgres")),
                ConfigField::optional("password", "Password", FieldKind::Secret),
                ConfigField::required("database", "Default database", FieldKind::Text, Some("postgres")),
            ],
            ServiceType::NoSqlDatabase => {
                vec![ConfigField::optional("replica_set", "Replica set name", FieldKind::Text)]
            }
            ServiceType::Cache => vec![
                ConfigField::optional("max_memory_mb", "Memory limit (MB)", FieldKind::Integer),
                ConfigField::required("persistence", "Persist to disk", FieldKind::Boolean, Some("false")),
            ],
            ServiceType::Search => {
                vec![ConfigField::optional("master_key", "Master key", FieldKind::Secret)]
            }
            ServiceType::ObjectStorage => vec![
                ConfigField::required("root_user", "Root user", FieldKind::Text, Some("minioadmin")),
                ConfigField::required("root_password", "Root password", FieldKind::Secret, Some("minioadmin")),
                ConfigField::optional("console_port", "Console port", FieldKind::Port),
            ],
            ServiceType::Mail => {
                vec![ConfigField::required("smtp_port", "SMTP port", FieldKind::Port, Some("1025"))]
            }
            ServiceType::Queue => {
                vec![ConfigField::required("jetstream", "Enable JetStream", FieldKind::Boolean, Some("true"))]
            }
            ServiceType::Tunnel => vec![
                ConfigField::optional("token", "Tunnel token", FieldKind::Secret),
                ConfigField::optional("hostname", "Public hostname", FieldKind::Text),
            ],
            ServiceType::Workflow => {
                vec![ConfigField::required("namespace", "Namespace", FieldKind::Text, Some("default"))]
            }
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = DevhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DevhostError::validation(format!("unknown service type: {}", s)))
    }
}

/// Liveness probe flavour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthProbe {
    /// TCP connect to the instance port
    Tcp,
    /// Shallow HTTP GET; any response counts as alive
    Http { path: String },
}

/// Value kind of a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Secret,
    Integer,
    Boolean,
    Path,
    Port,
}

/// One entry of a service type's configuration schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<String>,
}

impl ConfigField {
    fn required(key: &str, label: &str, kind: FieldKind, default: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            kind,
            required: true,
            default: default.map(str::to_string),
        }
    }

    fn optional(key: &str, label: &str, kind: FieldKind) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            kind,
            required: false,
            default: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppServerConfig {
    pub document_root: Option<PathBuf>,
    pub workers: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlDatabaseConfig {
    pub username: String,
    pub password: Option<String>,
    pub database: String,
}

impl Default for SqlDatabaseConfig {
    fn default() -> Self {
        Self {
            username: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoSqlDatabaseConfig {
    pub replica_set: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_memory_mb: Option<u32>,
    pub persistence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub root_user: String,
    pub root_password: String,
    pub console_port: Option<u16>,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            root_user: "minioadmin".to_string(),
            root_password: "minioadmin".to_string(),
            console_port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub smtp_port: u16,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self { smtp_port: 1025 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub jetstream: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { jetstream: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub token: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub namespace: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
        }
    }
}

/// Per-instance configuration, tagged by service type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service_type", rename_all = "kebab-case")]
pub enum ServiceConfig {
    AppServer(AppServerConfig),
    SqlDatabase(SqlDatabaseConfig),
    NoSqlDatabase(NoSqlDatabaseConfig),
    Cache(CacheConfig),
    Search(SearchConfig),
    ObjectStorage(ObjectStorageConfig),
    Mail(MailConfig),
    Queue(QueueConfig),
    Tunnel(TunnelConfig),
    Workflow(WorkflowConfig),
}

/// Command line and environment for one launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ServiceConfig {
    /// Default configuration for a service type
    pub fn default_for(service_type: ServiceType) -> Self {
        match service_type {
            ServiceType::AppServer => ServiceConfig::AppServer(Default::default()),
            ServiceType::SqlDatabase => ServiceConfig::SqlDatabase(Default::default()),
            ServiceType::NoSqlDatabase => ServiceConfig::NoSqlDatabase(Default::default()),
            ServiceType::Cache => ServiceConfig::Cache(Default::default()),
            ServiceType::Search => ServiceConfig::Search(Default::default()),
            ServiceType::ObjectStorage => ServiceConfig::ObjectStorage(Default::default()),
            ServiceType::Mail => ServiceConfig::Mail(Default::default()),
            ServiceType::Queue => ServiceConfig::Queue(Default::default()),
            ServiceType::Tunnel => ServiceConfig::Tunnel(Default::default()),
            ServiceType::Workflow => ServiceConfig::Workflow(Default::default()),
        }
    }

    /// The service type this configuration belongs to
    pub fn service_type(&self) -> ServiceType {
        match self {
            ServiceConfig::AppServer(_) => ServiceType::AppServer,
            ServiceConfig::SqlDatabase(_) => ServiceType::SqlDatabase,
            ServiceConfig::NoSqlDatabase(_) => ServiceType::NoSqlDatabase,
            ServiceConfig::Cache(_) => ServiceType::Cache,
            ServiceConfig::Search(_) => ServiceType::Search,
            ServiceConfig::ObjectStorage(_) => ServiceType::ObjectStorage,
            ServiceConfig::Mail(_) => ServiceType::Mail,
            ServiceConfig::Queue(_) => ServiceType::Queue,
            ServiceConfig::Tunnel(_) => ServiceType::Tunnel,
            ServiceConfig::Workflow(_) => ServiceType::Workflow,
        }
    }

    /// Reject values the service would refuse at startup
    pub fn validate(&self, port: u16) -> Result<(), DevhostError> {
        let clash = |other: u16, what: &str| {
            if other == 0 || other == port {
                Err(DevhostError::validation(format!(
                    "{} must be non-zero and differ from the service port {}",
                    what, port
                )))
            } else {
                Ok(())
            }
        };

        match self {
            ServiceConfig::SqlDatabase(c) if c.username.trim().is_empty() => {
                Err(DevhostError::validation("username must not be empty"))
            }
            ServiceConfig::ObjectStorage(c) => {
                if c.root_password.len() < 8 {
                    return Err(DevhostError::validation(
                        "root_password must be at least 8 characters",
                    ));
                }
                match c.console_port {
                    Some(console) => clash(console, "console_port"),
                    None => Ok(()),
                }
            }
            ServiceConfig::Mail(c) => clash(c.smtp_port, "smtp_port"),
            ServiceConfig::Workflow(c) if c.namespace.trim().is_empty() => {
                Err(DevhostError::validation("namespace must not be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Arguments and environment for launching on `port` with `data_dir`
    pub fn launch_spec(&self, port: u16, data_dir: &Path) -> LaunchSpec {
        let listen = format!("127.0.0.1:{}", port);
        let data = data_dir.display().to_string();
        let mut spec = LaunchSpec::default();

        match self {
            ServiceConfig::AppServer(c) => {
                let root = c
                    .document_root
                    .as_deref()
                    .unwrap_or(data_dir)
                    .display()
                    .to_string();
                spec.args = vec!["php-server".into(), "--listen".into(), listen, "--root".into(), root];
                if let Some(workers) = c.workers {
                    spec.env.push(("FRANKENPHP_NUM_THREADS".into(), workers.to_string()));
                }
            }
            ServiceConfig::SqlDatabase(c) => {
                spec.args = vec![
                    "-D".into(),
                    data.clone(),
                    "-p".into(),
                    port.to_string(),
                    "-h".into(),
                    "127.0.0.1".into(),
                    "-k".into(),
                    data,
                ];
                spec.env.push(("PGUSER".into(), c.username.clone()));
                spec.env.push(("PGDATABASE".into(), c.database.clone()));
                if let Some(password) = &c.password {
                    spec.env.push(("PGPASSWORD".into(), password.clone()));
                }
            }
            ServiceConfig::NoSqlDatabase(c) => {
                spec.args = vec![
                    "--dbpath".into(),
                    data,
                    "--port".into(),
                    port.to_string(),
                    "--bind_ip".into(),
                    "127.0.0.1".into(),
                ];
                if let Some(rs) = &c.replica_set {
                    spec.args.extend(["--replSet".into(), rs.clone()]);
                }
            }
            ServiceConfig::Cache(c) => {
                spec.args = vec![
                    "--port".into(),
                    port.to_string(),
                    "--bind".into(),
                    "127.0.0.1".into(),
                    "--dir".into(),
                    data,
                ];
                if let Some(mb) = c.max_memory_mb {
                    spec.args.extend(["--maxmemory".into(), format!("{}mb", mb)]);
                }
                if !c.persistence {
                    spec.args.extend(["--save".into(), String::new(), "--appendonly".into(), "no".into()]);
                }
            }
            ServiceConfig::Search(c) => {
                spec.args = vec!["--http-addr".into(), listen, "--db-path".into(), data];
                if let Some(key) = &c.master_key {
                    spec.env.push(("MEILI_MASTER_KEY".into(), key.clone()));
                }
            }
            ServiceConfig::ObjectStorage(c) => {
                spec.args = vec!["server".into(), data, "--address".into(), listen];
                if let Some(console) = c.console_port {
                    spec.args
                        .extend(["--console-address".into(), format!("127.0.0.1:{}", console)]);
                }
                spec.env.push(("MINIO_ROOT_USER".into(), c.root_user.clone()));
                spec.env.push(("MINIO_ROOT_PASSWORD".into(), c.root_password.clone()));
            }
            ServiceConfig::Mail(c) => {
                spec.args = vec![
                    "--listen".into(),
                    listen,
                    "--smtp".into(),
                    format!("127.0.0.1:{}", c.smtp_port),
                    "--database".into(),
                    data_dir.join("mailpit.db").display().to_string(),
                ];
            }
            ServiceConfig::Queue(c) => {
                spec.args = vec!["-a".into(), "127.0.0.1".into(), "-p".into(), port.to_string()];
                if c.jetstream {
                    spec.args.extend(["-js".into(), "-sd".into(), data]);
                }
            }
            ServiceConfig::Tunnel(c) => {
                spec.args = vec![
                    "tunnel".into(),
                    "--no-autoupdate".into(),
                    "--metrics".into(),
                    listen,
                    "run".into(),
                ];
                if let Some(token) = &c.token {
                    spec.env.push(("TUNNEL_TOKEN".into(), token.clone()));
                }
                if let Some(hostname) = &c.hostname {
                    spec.env.push(("TUNNEL_HOSTNAME".into(), hostname.clone()));
                }
            }
            ServiceConfig::Workflow(c) => {
                spec.args = vec![
                    "server".into(),
                    "start-dev".into(),
                    "--ip".into(),
                    "127.0.0.1".into(),
                    "--port".into(),
                    port.to_string(),
                    "--db-filename".into(),
                    data_dir.join("temporal.db").display().to_string(),
                    "--namespace".into(),
                    c.namespace.clone(),
                ];
            }
        }

        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_parse_roundtrip() {
        for t in ServiceType::ALL {
            assert_eq!(t.as_str().parse::<ServiceType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!("ftp".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_default_config_matches_type() {
        for t in ServiceType::ALL {
            assert_eq!(ServiceConfig::default_for(t).service_type(), t);
        }
    }

    #[test]
    fn test_config_is_tagged_by_service_type() {
        let config = ServiceConfig::Cache(CacheConfig {
            max_memory_mb: Some(64),
            persistence: false,
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["service_type"], "cache");
        assert_eq!(json["max_memory_mb"], 64);

        let parsed: ServiceConfig =
            serde_json::from_str(r#"{"service_type":"mail"}"#).unwrap();
        assert_eq!(parsed, ServiceConfig::Mail(MailConfig { smtp_port: 1025 }));
    }

    #[test]
    fn test_schema_defaults_match_config_defaults() {
        let schema = ServiceType::SqlDatabase.config_schema();
        let username = schema.iter().find(|f| f.key == "username").unwrap();
        assert!(username.required);
        assert_eq!(
            username.default.as_deref(),
            Some(SqlDatabaseConfig::default().username.as_str())
        );
    }

    #[test]
    fn test_validate_port_clash() {
        let config = ServiceConfig::Mail(MailConfig { smtp_port: 8025 });
        assert!(config.validate(8025).is_err());
        assert!(config.validate(8026).is_ok());
    }

    #[test]
    fn test_cache_launch_spec() {
        let spec = ServiceConfig::default_for(ServiceType::Cache)
            .launch_spec(6379, Path::new("/data/cache"));
        assert_eq!(&spec.args[..2], &["--port".to_string(), "6379".to_string()]);
        assert!(spec.args.contains(&"--bind".to_string()));
        assert!(spec.args.contains(&"127.0.0.1".to_string()));
        assert!(spec.args.contains(&"--save".to_string()));
    }
}
