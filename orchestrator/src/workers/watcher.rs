//! Store watcher
//!
//! Turns store change events into names for the NodeSet and Deployment
//! controllers:
//!
//! - NodeSet: itself and every deployment that references it
//! - Deployment: itself and the NodeSets it targets
//! - Service, Secret, ConfigMap: every NodeSet and every deployment not yet deployed
//!
//! Everything is queued once at startup and again whenever the watch stream
//! lags behind.

use std::future::Future;
use std::pin::Pin;

use fleet_api::{ConfigMap, Deployment, NodeSet, Resource, Secret, Service};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::errors::OrchestratorError;
use crate::store::{Api, WatchAction, WatchEvent};

/// Where the watcher sends names
#[derive(Debug, Clone)]
pub struct Targets {
    pub node_sets: mpsc::UnboundedSender<String>,
    pub deployments: mpsc::UnboundedSender<String>,
}

impl Targets {
    fn node_set(&self, name: &str) {
        let _ = self.node_sets.send(name.to_string());
    }

    fn deployment(&self, name: &str) {
        let _ = self.deployments.send(name.to_string());
    }
}

/// Queue every NodeSet and every deployment still in progress
pub async fn resync(
    node_sets: &Api<NodeSet>,
    deployments: &Api<Deployment>,
    targets: &Targets,
) -> Result<(), OrchestratorError> {
    for node_set in node_sets.list().await? {
        targets.node_set(node_set.name());
    }
    for deployment in deployments.list().await? {
        if !deployment.status.deployed || deployment.metadata.is_deleting() {
            targets.deployment(deployment.name());
        }
    }
    Ok(())
}

/// Route one store event
pub async fn route(
    event: &WatchEvent,
    node_sets: &Api<NodeSet>,
    deployments: &Api<Deployment>,
    targets: &Targets,
) -> Result<(), OrchestratorError> {
    match event.kind.as_str() {
        NodeSet::KIND => {
            targets.node_set(&event.name);
            for deployment in deployments.list().await? {
                if deployment.targets(&event.name) {
                    targets.deployment(deployment.name());
                }
            }
        }
        Deployment::KIND => {
            targets.deployment(&event.name);
            match (event.action, deployments.get(&event.name).await?) {
                (WatchAction::Applied, Some(deployment)) => {
                    for node_set in &deployment.spec.node_sets {
                        targets.node_set(node_set);
                    }
                }
                // The targets of a removed deployment are unknown
                _ => {
                    for node_set in node_sets.list().await? {
                        targets.node_set(node_set.name());
                    }
                }
            }
        }
        Service::KIND | Secret::KIND | ConfigMap::KIND => {
            resync(node_sets, deployments, targets).await?;
        }
        other => debug!("ignoring change to unknown kind {}", other),
    }
    Ok(())
}

/// Run the watcher until shutdown
pub async fn run(
    mut events: broadcast::Receiver<WatchEvent>,
    node_sets: Api<NodeSet>,
    deployments: Api<Deployment>,
    targets: Targets,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Store watcher starting...");

    if let Err(e) = resync(&node_sets, &deployments, &targets).await {
        error!("Initial resync failed: {}", e);
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Store watcher shutting down...");
                return;
            }
            received = events.recv() => {
                let result = match received {
                    Ok(event) => route(&event, &node_sets, &deployments, &targets).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Watch stream lagged by {} events, resyncing", skipped);
                        resync(&node_sets, &deployments, &targets).await
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Watch stream closed");
                        return;
                    }
                };
                if let Err(e) = result {
                    error!("Failed to route store event: {}", e);
                }
            }
        }
    }
}
