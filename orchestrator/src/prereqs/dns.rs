//! Name-resolution publication

use std::collections::BTreeMap;
use std::net::IpAddr;

use fleet_api::{EffectiveNode, NodeSet, Resource};
use tracing::debug;

use super::ipam::AddressMap;
use crate::backends::{BackendError, DnsBackend, DnsRecord};

/// Names computed for a node set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameResolution {
    /// node → network → fqdn
    pub hostnames: BTreeMap<String, BTreeMap<String, String>>,
    pub nameservers: Vec<IpAddr>,
    /// False when no resolver backend is registered
    pub published: bool,
}

/// `<short hostname>.<lowercase network>.<domain>`
pub fn fqdn(hostname: &str, network: &str, domain: &str) -> String {
    let short = hostname.split('.').next().unwrap_or(hostname);
    format!(
        "{}.{}.{}",
        short,
        network.to_lowercase(),
        domain.trim_matches('.')
    )
}

/// Build one record per (node, reserved network) and publish the whole set
/// for this owner. Without a backend nothing is published, but names are
/// still computed for the inventory.
pub async fn ensure_names(
    backend: Option<&dyn DnsBackend>,
    node_set: &NodeSet,
    nodes: &[EffectiveNode],
    addresses: &AddressMap,
) -> Result<NameResolution, BackendError> {
    let mut resolution = NameResolution::default();
    let mut records = Vec::new();

    for node in nodes {
        let Some(reserved) = addresses.get(&node.name) else {
            continue;
        };
        for (network, reservation) in reserved {
            let name = fqdn(&node.hostname, network, &reservation.dns_domain);
            records.push(DnsRecord {
                fqdn: name.clone(),
                address: reservation.address,
            });
            resolution
                .hostnames
                .entry(node.name.clone())
                .or_default()
                .insert(network.clone(), name);
        }
    }

    let Some(backend) = backend else {
        return Ok(resolution);
    };

    backend.upsert(&node_set.owner_reference(), &records).await?;
    debug!(nodeset = %node_set.name(), "published {} records", records.len());
    resolution.nameservers = backend.nameservers();
    resolution.published = true;
    Ok(resolution)
}
