//! NodeSet reconciler
//!
//! Every pass rebuilds the ledger in this order and stops at the first step
//! that is not ready:
//!
//! ```text
//! InputReady -> AddressReservationReady -> NameResolutionReady
//!            -> fingerprint + inventory -> SetupReady -> DeploymentReady
//! ```
//!
//! `Ready` is the rollup of all of them. Deleting a NodeSet releases its
//! reservations, records and inventory before the finalizer is dropped.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use fleet_api::{
    reasons, types, Deployment, NodeSet, NodeSetStatus, Resource, Severity,
};
use tracing::{debug, info};

use super::{record_failure, Action, Context, NODESET_FINALIZER};
use crate::deploy::fingerprint::fingerprint;
use crate::deploy::inventory::{self, inventory_secret_name};
use crate::errors::OrchestratorError;
use crate::prereqs::{dns, ipam, Readiness};

/// Key the credential secret must carry
pub const SSH_KEY: &str = "ssh-privatekey";

const CONDITIONS: [&str; 5] = [
    types::INPUT_READY,
    types::ADDRESS_RESERVATION_READY,
    types::NAME_RESOLUTION_READY,
    types::SETUP_READY,
    types::DEPLOYMENT_READY,
];

/// Run one pass for the NodeSet called `name`
pub async fn reconcile(ctx: &Context, name: &str) -> Result<Action, OrchestratorError> {
    let Some(mut node_set) = ctx.node_sets.get(name).await? else {
        debug!(nodeset = %name, "NodeSet no longer exists");
        return Ok(Action::await_change());
    };

    if node_set.metadata.is_deleting() {
        return cleanup(ctx, node_set).await;
    }

    if node_set.metadata.add_finalizer(NODESET_FINALIZER) {
        node_set = ctx.node_sets.replace(&node_set).await?;
    }

    let mut status = node_set.status.clone();
    let outcome = run_pass(ctx, &node_set, &mut status).await;

    // Rendering failures leave the last persisted conditions in place
    if let Err(OrchestratorError::Serialization(_)) = &outcome {
        return outcome;
    }

    let ready = status.conditions.mirror(types::READY);
    status.conditions.apply(ready);
    status
        .conditions
        .restore_transition_times(&node_set.status.conditions);
    status.observed_generation = node_set.metadata.generation;

    if status != node_set.status {
        let mut updated = node_set.clone();
        updated.status = status;
        ctx.node_sets.replace(&updated).await?;
        debug!(nodeset = %name, "status updated");
    }

    outcome
}

async fn run_pass(
    ctx: &Context,
    node_set: &NodeSet,
    status: &mut NodeSetStatus,
) -> Result<Action, OrchestratorError> {
    let name = node_set.name();
    let requeue = Action::requeue(ctx.options.requeue.input);

    status.conditions.init(&CONDITIONS);
    status.conditions.mark_false(
        types::SETUP_READY,
        reasons::PENDING,
        Severity::Info,
        "setup in progress",
    );

    // Inputs
    let nodes = match node_set.spec.effective_nodes() {
        Ok(nodes) => nodes,
        Err(err) => {
            return Err(record_failure(
                &mut status.conditions,
                types::INPUT_READY,
                err.into(),
            ))
        }
    };
    match check_credentials(ctx, node_set).await {
        Ok(None) => {}
        Ok(Some(missing)) => {
            info!(nodeset = %name, "{}", missing);
            status.conditions.mark_false(
                types::INPUT_READY,
                reasons::MISSING,
                Severity::Warning,
                missing,
            );
            return Ok(requeue);
        }
        Err(err) => return Err(record_failure(&mut status.conditions, types::INPUT_READY, err)),
    }
    status
        .conditions
        .mark_true(types::INPUT_READY, reasons::READY, "input is ready");

    // Addresses
    let backend = ctx.backends.addresses.as_ref();
    let addresses = match ipam::ensure_addresses(backend, node_set, &nodes).await {
        Ok(Readiness::Ready(addresses)) => addresses,
        Ok(Readiness::Pending(message)) => {
            status.conditions.mark_false(
                types::ADDRESS_RESERVATION_READY,
                reasons::PENDING,
                Severity::Info,
                message,
            );
            return Ok(requeue);
        }
        Err(err) => {
            return Err(record_failure(
                &mut status.conditions,
                types::ADDRESS_RESERVATION_READY,
                err.into(),
            ))
        }
    };
    let reserved: usize = addresses.values().map(|nets| nets.len()).sum();
    status.conditions.mark_true(
        types::ADDRESS_RESERVATION_READY,
        reasons::READY,
        if reserved == 0 {
            "no networks requested".to_string()
        } else {
            format!("{} address reservations ready", reserved)
        },
    );
    status.all_ips = addresses
        .iter()
        .map(|(node, nets)| {
            let ips = nets.iter().map(|(net, r)| (net.clone(), r.address)).collect();
            (node.clone(), ips)
        })
        .collect();

    // Names
    let names = match dns::ensure_names(ctx.backends.dns.as_deref(), node_set, &nodes, &addresses).await {
        Ok(names) => names,
        Err(err) => {
            return Err(record_failure(
                &mut status.conditions,
                types::NAME_RESOLUTION_READY,
                err.into(),
            ))
        }
    };
    status.conditions.mark_true(
        types::NAME_RESOLUTION_READY,
        reasons::READY,
        if names.published {
            format!("{} names published", names.hostnames.values().map(|n| n.len()).sum::<usize>())
        } else {
            "no name resolution backend registered".to_string()
        },
    );
    status.all_hostnames = names.hostnames.clone();
    status.dns_nameservers = names.nameservers.clone();

    // Drift
    let hash = fingerprint(&node_set.spec)?;
    if status.config_hash.as_deref() != Some(hash.as_str()) {
        info!(nodeset = %name, "configuration fingerprint is now {}", hash);
    }
    status.config_hash = Some(hash);

    // Inventory
    let rendered = inventory::render(node_set, &nodes, &addresses, &names);
    let secret = inventory::inventory_secret(node_set, &rendered)?;
    ctx.secrets.apply(&secret).await?;
    status.inventory_secret = Some(secret.metadata.name);

    status
        .conditions
        .mark_true(types::SETUP_READY, reasons::READY, "setup complete");

    observe_deployments(ctx, node_set, status).await?;
    Ok(Action::await_change())
}

/// Returns a description of the first missing input, or fails when an input
/// exists but is malformed
async fn check_credentials(
    ctx: &Context,
    node_set: &NodeSet,
) -> Result<Option<String>, OrchestratorError> {
    for secret_name in node_set.spec.credential_secrets()? {
        let Some(secret) = ctx.secrets.get(&secret_name).await? else {
            return Ok(Some(format!("secret {} not found", secret_name)));
        };
        let Some(key) = secret.data.get(SSH_KEY) else {
            return Ok(Some(format!("secret {} has no {} key", secret_name, SSH_KEY)));
        };
        if key.is_empty() || STANDARD.decode(key).is_err() {
            return Err(OrchestratorError::ConfigurationInvalid(format!(
                "secret {}: {} is not valid base64",
                secret_name, SSH_KEY
            )));
        }
    }
    Ok(None)
}

/// DeploymentReady transition time, else creation time, then name
fn deployment_order(deployment: &Deployment) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>, String) {
    let created = deployment.metadata.creation_timestamp;
    let transitioned = deployment
        .status
        .conditions
        .get(types::DEPLOYMENT_READY)
        .map(|c| c.last_transition_time)
        .or(created);
    (transitioned, created, deployment.name().to_string())
}

/// Copy the outcome of the deployments targeting this NodeSet, oldest first,
/// so the most recent one has the last word
async fn observe_deployments(
    ctx: &Context,
    node_set: &NodeSet,
    status: &mut NodeSetStatus,
) -> Result<(), OrchestratorError> {
    let name = node_set.name();
    let mut deployments: Vec<Deployment> = ctx
        .deployments
        .list()
        .await?
        .into_iter()
        .filter(|d| !d.metadata.is_deleting() && d.targets(name))
        .collect();
    deployments.sort_by_key(deployment_order);

    if deployments.is_empty() {
        status.conditions.mark_false(
            types::DEPLOYMENT_READY,
            reasons::NOT_REQUESTED,
            Severity::Info,
            "no deployment requested",
        );
        return Ok(());
    }

    for deployment in &deployments {
        if deployment.status.deployed {
            status.conditions.mark_true(
                types::DEPLOYMENT_READY,
                reasons::READY,
                format!("deployed by {}", deployment.name()),
            );
            status.config_map_hashes = deployment.status.config_map_hashes.clone();
            status.secret_hashes = deployment.status.secret_hashes.clone();
            status.deployed_config_hash = deployment.status.node_set_hashes.get(name).cloned();
            status.deployed_by = Some(deployment.name().to_string());
        } else if deployment.failed_for(name) {
            let detail = deployment
                .status
                .node_set_conditions
                .get(name)
                .and_then(|ledger| ledger.get(types::DEPLOYMENT_READY))
                .map(|c| c.message.clone())
                .unwrap_or_default();
            status.conditions.mark_false(
                types::DEPLOYMENT_READY,
                reasons::ERROR,
                Severity::Error,
                format!("deployment {} failed: {}", deployment.name(), detail),
            );
        } else {
            status.conditions.mark_false(
                types::DEPLOYMENT_READY,
                reasons::REQUESTED,
                Severity::Info,
                format!("deployment {} in progress", deployment.name()),
            );
        }
    }

    if status.conditions.is_true(types::DEPLOYMENT_READY)
        && status.deployed_config_hash.is_some()
        && status.deployed_config_hash != status.config_hash
    {
        status.conditions.mark_true(
            types::DEPLOYMENT_READY,
            reasons::READY,
            format!(
                "deployed by {}; configuration changed since, a new deployment is needed",
                status.deployed_by.as_deref().unwrap_or("unknown")
            ),
        );
    }

    Ok(())
}

async fn cleanup(ctx: &Context, mut node_set: NodeSet) -> Result<Action, OrchestratorError> {
    if !node_set.metadata.has_finalizer(NODESET_FINALIZER) {
        return Ok(Action::await_change());
    }

    let owner = node_set.owner_reference();
    ctx.backends.addresses.release(&owner).await?;
    if let Some(dns) = &ctx.backends.dns {
        dns.remove(&owner).await?;
    }

    let secret_name = node_set
        .status
        .inventory_secret
        .clone()
        .unwrap_or_else(|| inventory_secret_name(node_set.name()));
    ctx.secrets.delete(&secret_name).await?;

    node_set.metadata.remove_finalizer(NODESET_FINALIZER);
    ctx.node_sets.replace(&node_set).await?;
    info!(nodeset = %node_set.name(), "released addresses, records and inventory");
    Ok(Action::await_change())
}
