//! Reconcilers
//!
//! One pass per resource: read the object, recompute its status from scratch,
//! persist the status if it changed and tell the controller when to look again.
//! A pass never mutates another resource's status.

pub mod deployment;
pub mod nodeset;

use std::sync::Arc;
use std::time::Duration;

use fleet_api::{reasons, ConditionLedger, ConfigMap, Deployment, NodeSet, Secret, Severity};

use crate::backends::Backends;
use crate::deploy::registry::{ServiceRegistry, StoreRegistry};
use crate::deploy::ExecutionDefaults;
use crate::errors::{OrchestratorError, RetryPolicy};
use crate::prereqs::certs::CertificateOptions;
use crate::store::{Api, ObjectStore};

pub const NODESET_FINALIZER: &str = "fleetplane.io/nodeset-cleanup";
pub const DEPLOYMENT_FINALIZER: &str = "fleetplane.io/deployment-cleanup";

/// What the controller should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Look again after `delay` even without a change event
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Only a change event triggers the next pass
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Requeue delays for waits the orchestrator cannot observe through events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueOptions {
    /// Missing credentials and pending address reservations
    pub input: Duration,
    /// Pending certificate issuance
    pub certificate: Duration,
    /// Deployments whose `requeue_after_secs` is zero
    pub deployment: Duration,
}

impl Default for RequeueOptions {
    fn default() -> Self {
        Self {
            input: Duration::from_secs(10),
            certificate: Duration::from_secs(5),
            deployment: Duration::from_secs(15),
        }
    }
}

/// Options the reconcilers are built with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub requeue: RequeueOptions,
    pub defaults: ExecutionDefaults,
    pub certificates: CertificateOptions,
}

/// Everything a pass needs; cheap to clone and shared by all workers
#[derive(Clone)]
pub struct Context {
    pub node_sets: Api<NodeSet>,
    pub deployments: Api<Deployment>,
    pub secrets: Api<Secret>,
    pub config_maps: Api<ConfigMap>,
    pub backends: Backends,
    pub registry: Arc<dyn ServiceRegistry>,
    pub options: ReconcileOptions,
}

impl Context {
    /// Context over `store` resolving services from the same store
    pub fn new(store: Arc<dyn ObjectStore>, backends: Backends, options: ReconcileOptions) -> Self {
        Self {
            node_sets: Api::new(store.clone()),
            deployments: Api::new(store.clone()),
            registry: Arc::new(StoreRegistry::new(Api::new(store.clone()))),
            secrets: Api::new(store.clone()),
            config_maps: Api::new(store),
            backends,
            options,
        }
    }
}

/// Record `err` on `condition` and hand it back.
///
/// Errors only an external change can fix become False/Error; transient
/// ones leave the condition Unknown with the error as its message.
pub(crate) fn record_failure(
    ledger: &mut ConditionLedger,
    condition: &str,
    err: OrchestratorError,
) -> OrchestratorError {
    match err.retry_policy() {
        RetryPolicy::AwaitChange => {
            ledger.mark_false(condition, reasons::ERROR, Severity::Error, err.to_string())
        }
        RetryPolicy::Immediate | RetryPolicy::Backoff => {
            ledger.mark_unknown(condition, reasons::ERROR, err.to_string())
        }
    }
    err
}
