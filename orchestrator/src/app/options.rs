//! Application configuration options

use std::net::IpAddr;
use std::time::Duration;

use crate::backends::memory::NetworkPool;
use crate::deploy::ExecutionDefaults;
use crate::prereqs::certs::CertificateOptions;
use crate::reconcile::{ReconcileOptions, RequeueOptions};
use crate::storage::settings::Settings;
use crate::workers::controller;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Enable the status API
    pub enable_status_server: bool,

    /// Status API listener
    pub server: ServerOptions,

    /// Remote job runner; `None` runs jobs in memory
    pub execution: Option<ExecutionOptions>,

    /// NodeSet controller options
    pub nodeset_controller: controller::Options,

    /// Deployment controller options
    pub deployment_controller: controller::Options,

    /// Options handed to every reconcile pass
    pub reconcile: ReconcileOptions,

    /// Address pools of the built-in reservation backend
    pub networks: Vec<NetworkPool>,

    /// Nameservers of the built-in name backend; `None` disables publication
    pub dns_nameservers: Option<Vec<IpAddr>>,

    /// Pending polls of the built-in certificate backend; `None` disables it
    pub certificate_pending_polls: Option<u32>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_status_server: true,
            server: ServerOptions::default(),
            execution: None,
            nodeset_controller: controller::Options {
                kind: "NodeSet".to_string(),
                ..Default::default()
            },
            deployment_controller: controller::Options {
                kind: "Deployment".to_string(),
                ..Default::default()
            },
            reconcile: ReconcileOptions::default(),
            networks: Vec::new(),
            dns_nameservers: None,
            certificate_pending_polls: None,
        }
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        let defaults = Self::default();

        Self {
            enable_status_server: settings.enable_status_server,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            execution: settings.execution.as_ref().map(|e| ExecutionOptions {
                base_url: e.base_url.clone(),
                token: e.token.clone(),
                timeout: Duration::from_secs(e.timeout_secs),
            }),
            nodeset_controller: controller::Options {
                concurrency: settings.workers.nodeset,
                ..defaults.nodeset_controller
            },
            deployment_controller: controller::Options {
                concurrency: settings.workers.deployment,
                ..defaults.deployment_controller
            },
            reconcile: ReconcileOptions {
                requeue: RequeueOptions {
                    input: Duration::from_secs(settings.requeue.input_secs),
                    certificate: Duration::from_secs(settings.requeue.certificate_secs),
                    deployment: Duration::from_secs(settings.requeue.default_deployment_secs),
                },
                defaults: ExecutionDefaults {
                    runner_image: settings.defaults.runner_image.clone(),
                    service_account: settings.defaults.service_account.clone(),
                    backoff_limit: settings.defaults.default_backoff_limit,
                },
                certificates: CertificateOptions {
                    duration: Duration::from_secs(settings.certificates.duration_hours * 3600),
                    issuer: settings.certificates.issuer.clone(),
                },
            },
            networks: settings.networks.clone(),
            dns_nameservers: settings
                .dns
                .enabled
                .then(|| settings.dns.nameservers.clone()),
            certificate_pending_polls: settings
                .certificates
                .enabled
                .then_some(settings.certificates.pending_polls),
            lifecycle: defaults.lifecycle,
        }
    }
}

/// Lifecycle options for the orchestrator
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Remote job runner options
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Status API options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
