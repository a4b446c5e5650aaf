//! NodeSet resource
//!
//! A named group of target nodes sharing a template. Every node resolves its
//! hostname, network list and credential from its own section or from the
//! template.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::condition::ConditionLedger;
use crate::error::ApiError;
use crate::meta::{ObjectMeta, Resource};
use crate::vars::{merge_shallow, EnvVar, VarMap};

/// Default execution user when neither node nor template sets one
pub const DEFAULT_EXEC_USER: &str = "fleet";

/// Default execution port
pub const DEFAULT_EXEC_PORT: u16 = 22;

/// Default management network name
pub const DEFAULT_MANAGEMENT_NETWORK: &str = "ctlplane";

/// NodeSet resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    pub metadata: ObjectMeta,
    pub spec: NodeSetSpec,
    #[serde(default)]
    pub status: NodeSetStatus,
}

impl Resource for NodeSet {
    const KIND: &'static str = "NodeSet";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Desired configuration of a node set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Shared defaults for every node
    #[serde(default)]
    pub node_template: NodeTemplate,

    /// Per-node overrides keyed by node name
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSection>,

    /// Ordered services to deploy
    #[serde(default)]
    pub services: Vec<String>,

    /// Environment passed to every execution job
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Issue TLS material for services that ask for it
    #[serde(default)]
    pub tls_enabled: bool,

    /// Nodes already exist; no provisioning template is consulted
    #[serde(default = "default_true")]
    pub pre_provisioned: bool,

    /// Provisioning template; only tracked for drift detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baremetal_template: Option<BaremetalTemplate>,
}

fn default_true() -> bool {
    true
}

fn default_management_network() -> String {
    DEFAULT_MANAGEMENT_NETWORK.to_string()
}

/// Provisioning template for nodes that are not pre-provisioned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaremetalTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctlplane_interface: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_interface: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hardware_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: VarMap,
}

/// Template shared by every node of the set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    /// Secret holding the `ssh-privatekey` used to reach the nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret: Option<String>,

    #[serde(default = "default_management_network")]
    pub management_network: String,

    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,

    #[serde(default)]
    pub exec: ExecSettings,
}

impl Default for NodeTemplate {
    fn default() -> Self {
        Self {
            credential_secret: None,
            management_network: default_management_network(),
            networks: Vec::new(),
            exec: ExecSettings::default(),
        }
    }
}

/// Per-node overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<NetworkAttachment>>,

    #[serde(default)]
    pub exec: ExecSettings,
}

/// How the remote executor reaches a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: VarMap,
}

/// A network a node is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub name: String,

    #[serde(default = "default_subnet")]
    pub subnet: String,

    #[serde(default)]
    pub default_route: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<IpAddr>,
}

fn default_subnet() -> String {
    "subnet1".to_string()
}

impl NetworkAttachment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet: default_subnet(),
            default_route: false,
            fixed_ip: None,
        }
    }
}

/// A node with every template fallback applied
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveNode {
    /// Key in the nodes map
    pub name: String,
    pub hostname: String,
    pub credential_secret: String,
    pub management_network: String,
    pub networks: Vec<NetworkAttachment>,
    pub user: String,
    /// Explicit address to reach the node; falls back to the management IP
    pub host: Option<String>,
    pub port: u16,
    pub vars: VarMap,
}

impl NodeSetSpec {
    /// Resolve every node against the template
    pub fn effective_nodes(&self) -> Result<Vec<EffectiveNode>, ApiError> {
        let template = &self.node_template;
        let mut hostnames: HashMap<String, String> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());

        for (name, section) in &self.nodes {
            let hostname = section.hostname.clone().unwrap_or_else(|| name.clone());
            validate_hostname(name, &hostname)?;

            if let Some(other) = hostnames.insert(hostname.clone(), name.clone()) {
                return Err(ApiError::DuplicateHostname {
                    node: name.clone(),
                    hostname,
                    other,
                });
            }

            let credential_secret = section
                .credential_secret
                .clone()
                .or_else(|| template.credential_secret.clone())
                .ok_or_else(|| ApiError::MissingCredential { node: name.clone() })?;

            nodes.push(EffectiveNode {
                name: name.clone(),
                hostname,
                credential_secret,
                management_network: section
                    .management_network
                    .clone()
                    .unwrap_or_else(|| template.management_network.clone()),
                networks: section
                    .networks
                    .clone()
                    .unwrap_or_else(|| template.networks.clone()),
                user: section
                    .exec
                    .user
                    .clone()
                    .or_else(|| template.exec.user.clone())
                    .unwrap_or_else(|| DEFAULT_EXEC_USER.to_string()),
                host: section
                    .exec
                    .host
                    .clone()
                    .or_else(|| template.exec.host.clone()),
                port: section
                    .exec
                    .port
                    .or(template.exec.port)
                    .unwrap_or(DEFAULT_EXEC_PORT),
                vars: merge_shallow(&template.exec.vars, &section.exec.vars),
            });
        }

        Ok(nodes)
    }

    /// Every credential secret any node resolves to
    pub fn credential_secrets(&self) -> Result<BTreeSet<String>, ApiError> {
        Ok(self
            .effective_nodes()?
            .into_iter()
            .map(|n| n.credential_secret)
            .collect())
    }
}

fn validate_hostname(node: &str, hostname: &str) -> Result<(), ApiError> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !hostname.starts_with('-')
        && !hostname.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(ApiError::Invalid {
            field: format!("nodes.{node}.hostname"),
            message: format!("{hostname:?} is not a valid hostname"),
        })
    }
}

/// Observed state of a node set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    #[serde(default)]
    pub conditions: ConditionLedger,

    /// Fingerprint of the current spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,

    /// Fingerprint the authoritative deployment ran against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_config_hash: Option<String>,

    /// Deployment whose outcome `DeploymentReady` reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_by: Option<String>,

    #[serde(default)]
    pub config_map_hashes: BTreeMap<String, String>,

    #[serde(default)]
    pub secret_hashes: BTreeMap<String, String>,

    /// node -> network -> fully qualified name
    #[serde(default)]
    pub all_hostnames: BTreeMap<String, BTreeMap<String, String>>,

    /// node -> network -> reserved address
    #[serde(default)]
    pub all_ips: BTreeMap<String, BTreeMap<String, IpAddr>>,

    #[serde(default)]
    pub dns_nameservers: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_secret: Option<String>,

    #[serde(default)]
    pub observed_generation: u64,
}
