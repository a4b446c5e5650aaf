//! Service resource
//!
//! A named recipe of ordered remote-execution steps. Services are read-only
//! inputs to the orchestrator.

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};
use crate::vars::EnvVar;

/// Service resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

impl Resource for Service {
    const KIND: &'static str = "Service";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Execution recipe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,

    /// External artifacts mounted into every job of this service
    #[serde(default)]
    pub data_sources: Vec<DataSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<TlsCertSpec>,

    /// Secret with the CA bundle, mounted when TLS is enabled on the node set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certs: Option<String>,

    /// Run once per deployment against every targeted node set's inventory
    #[serde(default)]
    pub deploy_on_all_node_sets: bool,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl ServiceSpec {
    pub fn requires_tls(&self) -> bool {
        self.tls_cert.is_some()
    }
}

/// One remote-execution step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ExecutionStep {
    /// Playbook shipped with the runner image
    Playbook {
        path: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },

    /// Playbook passed inline
    Inline {
        contents: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },

    /// Reusable role, optionally entered through a sub-entrypoint
    Role {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
}

/// Config map or secret mounted into jobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Missing optional sources are skipped instead of failing the job
    #[serde(default)]
    pub optional: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

/// Certificate requirements of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertSpec {
    #[serde(default)]
    pub contents: Vec<CertContent>,

    /// Networks whose names go into the certificate; empty means every reserved network
    #[serde(default)]
    pub networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

impl TlsCertSpec {
    pub fn wants(&self, content: CertContent) -> bool {
        self.contents.contains(&content)
    }

    pub fn covers_network(&self, network: &str) -> bool {
        self.networks.is_empty()
            || self
                .networks
                .iter()
                .any(|n| n.eq_ignore_ascii_case(network))
    }
}

/// What a certificate must name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CertContent {
    DnsNames,
    IpAddresses,
}
