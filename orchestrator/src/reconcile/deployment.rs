//! Deployment reconciler
//!
//! A deployment applies the service lists of its NodeSets once. It waits for
//! every target to finish setup, issues TLS material where needed and then
//! dispatches the NodeSets one after the other. A deployment that reported
//! `deployed` is never acted on again; redeploying means creating a new one.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet_api::{
    reasons, types, ConditionLedger, Deployment, DeploymentStatus, NodeSet, Resource, Severity,
};
use tracing::{debug, info, warn};

use super::{record_failure, Action, Context, DEPLOYMENT_FINALIZER};
use crate::deploy::dispatcher::{DispatchState, Dispatcher};
use crate::errors::{OrchestratorError, RetryPolicy};
use crate::prereqs::certs::{ensure_certificates, remove_certificates};
use crate::prereqs::Readiness;

const CONDITIONS: [&str; 2] = [types::INPUT_READY, types::DEPLOYMENT_READY];

/// Run one pass for the deployment called `name`
pub async fn reconcile(ctx: &Context, name: &str) -> Result<Action, OrchestratorError> {
    let Some(mut deployment) = ctx.deployments.get(name).await? else {
        debug!(deployment = %name, "Deployment no longer exists");
        return Ok(Action::await_change());
    };

    if deployment.metadata.is_deleting() {
        return cleanup(ctx, deployment).await;
    }

    if deployment.status.deployed {
        return Ok(Action::await_change());
    }

    if deployment.metadata.add_finalizer(DEPLOYMENT_FINALIZER) {
        deployment = ctx.deployments.replace(&deployment).await?;
    }

    let mut status = deployment.status.clone();
    let outcome = run_pass(ctx, &deployment, &mut status).await;

    if let Err(OrchestratorError::Serialization(_)) = &outcome {
        return outcome;
    }

    let ready = status.conditions.mirror(types::READY);
    status.conditions.apply(ready);
    status
        .conditions
        .restore_transition_times(&deployment.status.conditions);
    status.observed_generation = deployment.metadata.generation;

    if status != deployment.status {
        let mut updated = deployment.clone();
        updated.status = status;
        ctx.deployments.replace(&updated).await?;
        debug!(deployment = %name, "status updated");
    }

    outcome
}

async fn run_pass(
    ctx: &Context,
    deployment: &Deployment,
    status: &mut DeploymentStatus,
) -> Result<Action, OrchestratorError> {
    let name = deployment.name();
    let requeue = Action::requeue(match deployment.spec.requeue_after_secs {
        0 => ctx.options.requeue.deployment,
        secs => Duration::from_secs(secs),
    });

    status.conditions.init(&CONDITIONS);

    if deployment.spec.node_sets.is_empty() {
        return Err(record_failure(
            &mut status.conditions,
            types::INPUT_READY,
            OrchestratorError::ConfigurationInvalid("no node sets requested".to_string()),
        ));
    }

    // Inputs
    let mut node_sets = Vec::with_capacity(deployment.spec.node_sets.len());
    for node_set_name in &deployment.spec.node_sets {
        match ctx.node_sets.get(node_set_name).await? {
            None => {
                status.conditions.mark_false(
                    types::INPUT_READY,
                    reasons::MISSING,
                    Severity::Warning,
                    format!("NodeSet {} not found", node_set_name),
                );
                return Ok(requeue);
            }
            Some(node_set) if !node_set.status.conditions.is_true(types::SETUP_READY) => {
                status.conditions.mark_false(
                    types::INPUT_READY,
                    reasons::WAITING,
                    Severity::Info,
                    format!("waiting for NodeSet {} to finish setup", node_set_name),
                );
                return Ok(requeue);
            }
            Some(node_set) => node_sets.push(node_set),
        }
    }

    // TLS
    match ensure_tls(ctx, deployment, &node_sets).await {
        Ok(None) => {}
        Ok(Some(message)) => {
            status.conditions.mark_false(
                types::INPUT_READY,
                reasons::PENDING,
                Severity::Info,
                message,
            );
            return Ok(Action::requeue(ctx.options.requeue.certificate));
        }
        Err(err) => return Err(record_failure(&mut status.conditions, types::INPUT_READY, err)),
    }
    status
        .conditions
        .mark_true(types::INPUT_READY, reasons::READY, "input is ready");

    // The first fingerprint observed for a NodeSet is the one this
    // deployment is recorded against
    for node_set in &node_sets {
        if let Some(hash) = &node_set.status.config_hash {
            status
                .node_set_hashes
                .entry(node_set.name().to_string())
                .or_insert_with(|| hash.clone());
        }
    }

    // Dispatch
    let dispatcher = Dispatcher {
        backend: ctx.backends.execution.as_ref(),
        registry: ctx.registry.as_ref(),
        secrets: &ctx.secrets,
        config_maps: &ctx.config_maps,
        defaults: &ctx.options.defaults,
    };

    let mut failures: Vec<(String, OrchestratorError)> = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut config_map_hashes = BTreeMap::new();
    let mut secret_hashes = BTreeMap::new();

    for node_set in &node_sets {
        let node_set_name = node_set.name().to_string();
        let mut progress = ConditionLedger::new();
        progress.init(&[types::DEPLOYMENT_READY]);

        match dispatcher
            .deploy(deployment, node_set, &node_sets, &mut progress)
            .await
        {
            Ok(report) => {
                match &report.state {
                    DispatchState::Complete => {
                        progress.mark_true(
                            types::DEPLOYMENT_READY,
                            reasons::READY,
                            "all services deployed",
                        );
                    }
                    DispatchState::Pending { service, job } => {
                        progress.mark_false(
                            types::DEPLOYMENT_READY,
                            reasons::PENDING,
                            Severity::Info,
                            format!("service {} running as job {}", service, job),
                        );
                        pending.push(node_set_name.clone());
                    }
                }
                config_map_hashes.extend(report.config_map_hashes);
                secret_hashes.extend(report.secret_hashes);
            }
            Err(err) => {
                warn!(deployment = %name, nodeset = %node_set_name, "dispatch failed: {}", err);
                let err = record_failure(&mut progress, types::DEPLOYMENT_READY, err);
                failures.push((node_set_name.clone(), err));
            }
        }

        let ready = progress.mirror(types::READY);
        progress.apply(ready);
        if let Some(previous) = deployment.status.node_set_conditions.get(&node_set_name) {
            progress.restore_transition_times(previous);
        }
        status.node_set_conditions.insert(node_set_name, progress);
    }

    // Aggregate
    if !failures.is_empty() {
        let message = failures
            .iter()
            .map(|(node_set, err)| format!("{}: {}", node_set, err))
            .collect::<Vec<_>>()
            .join("; ");
        let policies: Vec<RetryPolicy> = failures.iter().map(|(_, e)| e.retry_policy()).collect();
        let err = if policies.contains(&RetryPolicy::Immediate) {
            OrchestratorError::Conflict(message)
        } else if policies.contains(&RetryPolicy::Backoff) {
            OrchestratorError::BackendUnavailable(message)
        } else if failures
            .iter()
            .any(|(_, e)| matches!(e, OrchestratorError::ExecutionFailed(_)))
        {
            OrchestratorError::ExecutionFailed(message)
        } else {
            OrchestratorError::ConfigurationInvalid(message)
        };
        return Err(record_failure(&mut status.conditions, types::DEPLOYMENT_READY, err));
    }

    if !pending.is_empty() {
        status.conditions.mark_false(
            types::DEPLOYMENT_READY,
            reasons::PENDING,
            Severity::Info,
            format!("deployment in progress on {}", pending.join(", ")),
        );
        return Ok(requeue);
    }

    status.conditions.mark_true(
        types::DEPLOYMENT_READY,
        reasons::READY,
        "all node sets deployed",
    );
    status.deployed = true;
    status.config_map_hashes = config_map_hashes;
    status.secret_hashes = secret_hashes;
    info!(deployment = %name, "deployment finished");
    Ok(Action::await_change())
}

/// Returns a wait message while any certificate is still being issued
async fn ensure_tls(
    ctx: &Context,
    deployment: &Deployment,
    node_sets: &[NodeSet],
) -> Result<Option<String>, OrchestratorError> {
    for node_set in node_sets.iter().filter(|ns| ns.spec.tls_enabled) {
        for service_name in deployment.spec.effective_services(node_set) {
            let service = ctx.registry.resolve(service_name).await?;
            if !service.spec.requires_tls() {
                continue;
            }
            let Some(backend) = ctx.backends.certificates.as_deref() else {
                return Err(OrchestratorError::ConfigurationInvalid(format!(
                    "service {} needs TLS but no certificate backend is registered",
                    service_name
                )));
            };
            let state = ensure_certificates(
                backend,
                &ctx.secrets,
                &ctx.options.certificates,
                deployment,
                node_set,
                &service,
            )
            .await?;
            if let Readiness::Pending(message) = state {
                return Ok(Some(message));
            }
        }
    }
    Ok(None)
}

async fn cleanup(ctx: &Context, mut deployment: Deployment) -> Result<Action, OrchestratorError> {
    if !deployment.metadata.has_finalizer(DEPLOYMENT_FINALIZER) {
        return Ok(Action::await_change());
    }

    remove_certificates(ctx.backends.certificates.as_deref(), &ctx.secrets, &deployment).await?;

    deployment.metadata.remove_finalizer(DEPLOYMENT_FINALIZER);
    ctx.deployments.replace(&deployment).await?;
    info!(deployment = %deployment.name(), "released certificates");
    Ok(Action::await_change())
}
