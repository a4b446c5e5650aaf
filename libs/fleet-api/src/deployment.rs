//! Deployment resource
//!
//! A one-shot request to run services against one or more node sets. Once
//! `status.deployed` is set the request is terminal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::{types, ConditionLedger};
use crate::meta::{ObjectMeta, Resource};
use crate::nodeset::NodeSet;
use crate::vars::VarMap;

/// Default delay before re-checking node sets or in-flight jobs
pub const DEFAULT_REQUEUE_AFTER_SECS: u64 = 15;

/// Deployment resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

impl Resource for Deployment {
    const KIND: &'static str = "Deployment";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Requested rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Target node sets, by name
    pub node_sets: Vec<String>,

    /// Replaces every node set's own service list when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services_override: Option<Vec<String>>,

    #[serde(default)]
    pub exec_filter: ExecFilter,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_vars: VarMap,

    #[serde(default = "default_requeue_after")]
    pub requeue_after_secs: u64,

    /// Retries the executor may spend inside one job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<u32>,
}

fn default_requeue_after() -> u64 {
    DEFAULT_REQUEUE_AFTER_SECS
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            node_sets: Vec::new(),
            services_override: None,
            exec_filter: ExecFilter::default(),
            extra_vars: VarMap::new(),
            requeue_after_secs: DEFAULT_REQUEUE_AFTER_SECS,
            backoff_limit: None,
        }
    }
}

impl DeploymentSpec {
    /// The service list used for `node_set`; the override wins verbatim
    pub fn effective_services<'a>(&'a self, node_set: &'a NodeSet) -> &'a [String] {
        match &self.services_override {
            Some(services) => services,
            None => &node_set.spec.services,
        }
    }
}

/// Remote-execution tag filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tags: Option<String>,
}

/// Observed state of a deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub conditions: ConditionLedger,

    /// Per node set progress, keyed by node set name
    #[serde(default)]
    pub node_set_conditions: BTreeMap<String, ConditionLedger>,

    #[serde(default)]
    pub deployed: bool,

    #[serde(default)]
    pub config_map_hashes: BTreeMap<String, String>,

    #[serde(default)]
    pub secret_hashes: BTreeMap<String, String>,

    /// Node set fingerprints this deployment ran against
    #[serde(default)]
    pub node_set_hashes: BTreeMap<String, String>,

    #[serde(default)]
    pub observed_generation: u64,
}

impl Deployment {
    pub fn targets(&self, node_set: &str) -> bool {
        self.spec.node_sets.iter().any(|n| n == node_set)
    }

    /// True when the deployment failed terminally for `node_set`
    pub fn failed_for(&self, node_set: &str) -> bool {
        self.status
            .node_set_conditions
            .get(node_set)
            .and_then(|ledger| ledger.get(types::DEPLOYMENT_READY))
            .map(|c| c.is_error())
            .unwrap_or(false)
    }
}
