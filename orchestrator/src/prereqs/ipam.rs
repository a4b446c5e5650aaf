//! Address reservation

use std::collections::BTreeMap;

use fleet_api::{EffectiveNode, NodeSet, Resource};
use tracing::debug;

use super::Readiness;
use crate::backends::{AddressBackend, BackendError, Reservation, ReservationRequest, ReservationState};

/// node → network → reservation
pub type AddressMap = BTreeMap<String, BTreeMap<String, Reservation>>;

/// Reserve (or look up) an address for every network of every node.
///
/// Every pair is requested even after one reports pending so the backend can
/// work on all of them at once.
pub async fn ensure_addresses(
    backend: &dyn AddressBackend,
    node_set: &NodeSet,
    nodes: &[EffectiveNode],
) -> Result<Readiness<AddressMap>, BackendError> {
    let owner = node_set.owner_reference();
    let mut addresses = AddressMap::new();
    let mut pending = Vec::new();

    for node in nodes {
        for network in &node.networks {
            let request = ReservationRequest {
                owner: owner.clone(),
                node: node.name.clone(),
                hostname: node.hostname.clone(),
                network: network.name.clone(),
                subnet: network.subnet.clone(),
                fixed_ip: network.fixed_ip,
            };

            match backend.reserve(&request).await? {
                ReservationState::Ready(reservation) => {
                    addresses
                        .entry(node.name.clone())
                        .or_default()
                        .insert(network.name.clone(), reservation);
                }
                ReservationState::Pending => {
                    pending.push(format!("{}/{}", node.name, network.name));
                }
            }
        }
    }

    if !pending.is_empty() {
        debug!(
            nodeset = %node_set.name(),
            "address reservations pending: {}",
            pending.join(", ")
        );
        return Ok(Readiness::Pending(format!(
            "waiting for address reservations: {}",
            pending.join(", ")
        )));
    }

    Ok(Readiness::Ready(addresses))
}
