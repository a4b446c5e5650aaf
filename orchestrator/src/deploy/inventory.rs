//! Execution inventory
//!
//! Renders the per-NodeSet inventory handed to every job: one group named after
//! the NodeSet, group vars from the node template, and host vars built from
//! the node's reservations and names with the node's own vars merged on top.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleet_api::nodeset::DEFAULT_EXEC_USER;
use fleet_api::{
    merge_shallow, EffectiveNode, NodeSet, ObjectMeta, Resource, Secret, VarMap, VarValue,
};
use serde::{Deserialize, Serialize};

use super::LABEL_NODESET;
use crate::backends::Reservation;
use crate::errors::OrchestratorError;
use crate::prereqs::dns::NameResolution;
use crate::prereqs::ipam::AddressMap;

/// Key of the rendered inventory inside its secret
pub const INVENTORY_KEY: &str = "inventory";

/// One inventory group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryGroup {
    #[serde(default)]
    pub vars: VarMap,
    /// hostname → host vars
    #[serde(default)]
    pub hosts: BTreeMap<String, VarMap>,
}

/// Groups keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub groups: BTreeMap<String, InventoryGroup>,
}

impl Inventory {
    pub fn host_count(&self) -> usize {
        self.groups.values().map(|g| g.hosts.len()).sum()
    }

    /// Add every group of `other`; groups with the same name are replaced
    pub fn extend(&mut self, other: Inventory) {
        self.groups.extend(other.groups);
    }

    pub fn from_secret(secret: &Secret) -> Result<Self, OrchestratorError> {
        let encoded = secret.data.get(INVENTORY_KEY).ok_or_else(|| {
            OrchestratorError::ConfigurationInvalid(format!(
                "secret {} has no {} key",
                secret.name(),
                INVENTORY_KEY
            ))
        })?;
        let raw = STANDARD.decode(encoded).map_err(|e| {
            OrchestratorError::Internal(format!("inventory in {} is not base64: {e}", secret.name()))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

pub fn inventory_secret_name(node_set: &str) -> String {
    format!("fleetplane-nodeset-{}", node_set)
}

/// Variable prefix for a network name: lowercase, `-` becomes `_`
fn var_prefix(network: &str) -> String {
    network.to_lowercase().replace('-', "_")
}

fn network_vars(vars: &mut VarMap, reservation: &Reservation) {
    let prefix = var_prefix(&reservation.network);
    vars.insert(format!("{prefix}_ip"), reservation.address.to_string().into());
    vars.insert(
        format!("{prefix}_cidr"),
        VarValue::from(i64::from(reservation.prefix_len)),
    );
    if let Some(gateway) = reservation.gateway {
        vars.insert(format!("{prefix}_gateway_ip"), gateway.to_string().into());
    }
    vars.insert(format!("{prefix}_mtu"), reservation.mtu.into());
    if let Some(vlan) = reservation.vlan {
        vars.insert(format!("{prefix}_vlan_id"), vlan.into());
    }
    vars.insert(
        format!("{prefix}_dns_domain"),
        reservation.dns_domain.clone().into(),
    );

    let routes: Vec<VarValue> = reservation
        .routes
        .iter()
        .map(|route| {
            VarValue::Map(BTreeMap::from([
                ("destination".to_string(), route.destination.to_string().into()),
                ("nexthop".to_string(), route.nexthop.to_string().into()),
            ]))
        })
        .collect();
    vars.insert(format!("{prefix}_host_routes"), routes.into());
}

fn host_vars(
    node: &EffectiveNode,
    reservations: Option<&BTreeMap<String, Reservation>>,
    names: &NameResolution,
) -> VarMap {
    let mut vars = VarMap::new();
    let fqdns = names.hostnames.get(&node.name);

    let management_ip = reservations
        .and_then(|r| r.get(&node.management_network))
        .map(|r| r.address.to_string());
    let ansible_host = node
        .host
        .clone()
        .or(management_ip)
        .unwrap_or_else(|| node.hostname.clone());
    let canonical = fqdns
        .and_then(|f| f.get(&node.management_network))
        .cloned()
        .unwrap_or_else(|| node.hostname.clone());

    vars.insert("ansible_host".into(), ansible_host.into());
    vars.insert("ansible_user".into(), node.user.clone().into());
    vars.insert("ansible_port".into(), node.port.into());
    vars.insert("canonical_hostname".into(), canonical.into());

    let mut domains = BTreeSet::new();
    if let Some(reservations) = reservations {
        for reservation in reservations.values() {
            network_vars(&mut vars, reservation);
            domains.insert(reservation.dns_domain.clone());
        }
    }
    if let Some(fqdns) = fqdns {
        for (network, fqdn) in fqdns {
            vars.insert(format!("fqdn_{}", var_prefix(network)), fqdn.clone().into());
        }
    }
    if let Some(network) = node.networks.iter().find(|n| n.default_route) {
        vars.insert("default_route_network".into(), network.name.clone().into());
    }
    if !domains.is_empty() {
        let domains: Vec<VarValue> = domains.into_iter().map(VarValue::from).collect();
        vars.insert("dns_search_domains".into(), domains.into());
    }
    if !names.nameservers.is_empty() {
        let servers: Vec<VarValue> = names
            .nameservers
            .iter()
            .map(|ip| VarValue::from(ip.to_string()))
            .collect();
        vars.insert("dns_servers".into(), servers.into());
    }

    merge_shallow(&vars, &node.vars)
}

/// Render the inventory of one NodeSet
pub fn render(
    node_set: &NodeSet,
    nodes: &[EffectiveNode],
    addresses: &AddressMap,
    names: &NameResolution,
) -> Inventory {
    let template = &node_set.spec.node_template;

    let mut group_vars = template.exec.vars.clone();
    group_vars.insert(
        "ansible_user".into(),
        template
            .exec
            .user
            .clone()
            .unwrap_or_else(|| DEFAULT_EXEC_USER.to_string())
            .into(),
    );
    if let Some(port) = template.exec.port {
        group_vars.insert("ansible_port".into(), port.into());
    }
    group_vars.insert("fleet_nodeset_name".into(), node_set.name().into());
    let services: Vec<VarValue> = node_set
        .spec
        .services
        .iter()
        .map(|s| VarValue::from(s.as_str()))
        .collect();
    group_vars.insert("fleet_services".into(), services.into());
    group_vars.insert("fleet_tls_enabled".into(), node_set.spec.tls_enabled.into());

    let hosts = nodes
        .iter()
        .map(|node| {
            (
                node.hostname.clone(),
                host_vars(node, addresses.get(&node.name), names),
            )
        })
        .collect();

    Inventory {
        groups: BTreeMap::from([(
            node_set.name().to_string(),
            InventoryGroup {
                vars: group_vars,
                hosts,
            },
        )]),
    }
}

/// Wrap an inventory into the secret owned by its NodeSet
pub fn inventory_secret(node_set: &NodeSet, inventory: &Inventory) -> Result<Secret, OrchestratorError> {
    let rendered = serde_json::to_vec(inventory)?;

    let mut metadata = ObjectMeta::named(inventory_secret_name(node_set.name()));
    metadata.owner_references.push(node_set.owner_reference());
    metadata
        .labels
        .insert(LABEL_NODESET.to_string(), node_set.name().to_string());

    Ok(Secret {
        metadata,
        data: BTreeMap::from([(INVENTORY_KEY.to_string(), STANDARD.encode(rendered))]),
    })
}
