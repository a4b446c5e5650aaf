//! Config fingerprint
//!
//! Hash over the parts of a NodeSet spec that feed execution inputs: the
//! baremetal template, the node template and the per-node sections. Status,
//! metadata and the service list are not tracked.

use std::collections::BTreeMap;

use fleet_api::nodeset::{BaremetalTemplate, NodeSection, NodeTemplate};
use fleet_api::NodeSetSpec;
use serde::Serialize;

use crate::errors::OrchestratorError;
use crate::utils::sha256_hash;

#[derive(Serialize)]
struct TrackedSpec<'a> {
    baremetal_template: &'a Option<BaremetalTemplate>,
    node_template: &'a NodeTemplate,
    nodes: &'a BTreeMap<String, NodeSection>,
}

/// Stable hex digest of the tracked spec subset.
///
/// The subset goes through `serde_json::Value` first; its object map is
/// key-sorted, so the digest does not depend on field or map insertion order.
pub fn fingerprint(spec: &NodeSetSpec) -> Result<String, OrchestratorError> {
    let tracked = TrackedSpec {
        baremetal_template: &spec.baremetal_template,
        node_template: &spec.node_template,
        nodes: &spec.nodes,
    };
    let canonical = serde_json::to_value(&tracked)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(sha256_hash(&bytes))
}
