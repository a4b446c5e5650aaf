//! Settings file management

use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::backends::memory::NetworkPool;
use crate::errors::OrchestratorError;
use crate::logs::LogLevel;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/fleetplane/settings.json";

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily rolling log files
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Status API listener
    #[serde(default)]
    pub server: ServerSettings,

    /// Enable the status API
    #[serde(default = "default_true")]
    pub enable_status_server: bool,

    /// Remote job runner; absent means jobs run in memory
    #[serde(default)]
    pub execution: Option<ExecutionSettings>,

    /// Controller concurrency
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Requeue delays
    #[serde(default)]
    pub requeue: RequeueSettings,

    /// Process-wide job defaults
    #[serde(default)]
    pub defaults: DefaultsSettings,

    /// Address pools of the built-in reservation backend
    #[serde(default)]
    pub networks: Vec<NetworkPool>,

    /// Built-in name resolution backend
    #[serde(default)]
    pub dns: DnsSettings,

    /// Built-in certificate backend
    #[serde(default)]
    pub certificates: CertificateSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            enable_status_server: true,
            execution: None,
            workers: WorkerSettings::default(),
            requeue: RequeueSettings::default(),
            defaults: DefaultsSettings::default(),
            networks: Vec::new(),
            dns: DnsSettings::default(),
            certificates: CertificateSettings::default(),
        }
    }
}

impl Settings {
    /// Read the settings file at `path`; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|e| {
            OrchestratorError::ConfigError(format!("invalid settings file {}: {}", path.display(), e))
        })
    }
}

/// Status API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Remote job runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Base URL of the job runner API
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Controller concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_workers")]
    pub nodeset: usize,

    #[serde(default = "default_workers")]
    pub deployment: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            nodeset: default_workers(),
            deployment: default_workers(),
        }
    }
}

/// Requeue delays in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueSettings {
    #[serde(default = "default_input_secs")]
    pub input_secs: u64,

    #[serde(default = "default_certificate_secs")]
    pub certificate_secs: u64,

    #[serde(default = "default_deployment_secs")]
    pub default_deployment_secs: u64,
}

fn default_input_secs() -> u64 {
    10
}

fn default_certificate_secs() -> u64 {
    5
}

fn default_deployment_secs() -> u64 {
    15
}

impl Default for RequeueSettings {
    fn default() -> Self {
        Self {
            input_secs: default_input_secs(),
            certificate_secs: default_certificate_secs(),
            default_deployment_secs: default_deployment_secs(),
        }
    }
}

/// Job defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSettings {
    #[serde(default = "default_runner_image")]
    pub runner_image: String,

    #[serde(default = "default_service_account")]
    pub service_account: String,

    #[serde(default = "default_backoff_limit")]
    pub default_backoff_limit: u32,
}

fn default_runner_image() -> String {
    "quay.io/fleetplane/runner:latest".to_string()
}

fn default_service_account() -> String {
    "fleetplane-runner".to_string()
}

fn default_backoff_limit() -> u32 {
    6
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            runner_image: default_runner_image(),
            service_account: default_service_account(),
            default_backoff_limit: default_backoff_limit(),
        }
    }
}

/// Name resolution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
}

/// Certificate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_duration_hours")]
    pub duration_hours: u64,

    #[serde(default)]
    pub issuer: Option<String>,

    /// Polls answered with "pending" before a certificate is issued
    #[serde(default)]
    pub pending_polls: u32,
}

fn default_duration_hours() -> u64 {
    365 * 24
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_hours: default_duration_hours(),
            issuer: None,
            pending_polls: 0,
        }
    }
}
