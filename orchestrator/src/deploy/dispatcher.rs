//! Deployment dispatcher
//!
//! Walks a NodeSet's effective service list in order and keeps exactly one
//! job per (service, deployment, node set) alive on the execution backend.
//!
//! Each call is submit-and-check and never waits on a job:
//!
//! ```text
//! for service in services:
//!     status(job) == Succeeded  -> next service
//!     status(job) == Pending    -> return pending
//!     status(job) == Failed     -> return ExecutionFailed, later services untouched
//!     no job yet                -> submit, return pending
//! ```
//!
//! Job names are derived from the triple, so calling again while a job is in
//! flight observes that job instead of submitting a duplicate. A failed job is
//! never resubmitted.

use std::collections::BTreeMap;

use fleet_api::{
    reasons, types, ConditionLedger, ConfigMap, Deployment, NodeSet, Resource, Secret, Service,
    Severity,
};
use tracing::{debug, info, warn};

use super::inventory::{inventory_secret_name, Inventory};
use super::registry::ServiceRegistry;
use super::{ExecutionDefaults, LABEL_DEPLOYMENT, LABEL_NODESET, LABEL_SERVICE};
use crate::backends::{ExecutionBackend, ExecutionJob, JobPhase, Mount, MountSource};
use crate::errors::OrchestratorError;
use crate::prereqs::certs::cert_secret_name;
use crate::store::Api;
use crate::utils::{joined_label, sha256_hash};

const MAX_JOB_NAME_LEN: usize = 63;

/// `<service>-<deployment>-<nodeset>`, or `<service>-<deployment>` for
/// services that run once across every node set. Distinct triples always get
/// distinct names, see [`joined_label`].
pub fn job_name(service: &str, deployment: &str, node_set: Option<&str>) -> String {
    match node_set {
        Some(node_set) => joined_label(&[service, deployment, node_set], MAX_JOB_NAME_LEN),
        None => joined_label(&[service, deployment], MAX_JOB_NAME_LEN),
    }
}

/// Where a dispatch pass stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    /// Every service's job succeeded
    Complete,
    /// Waiting on the job of `service`
    Pending { service: String, job: String },
}

/// Result of one dispatch pass for one NodeSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub state: DispatchState,
    /// Content hashes of every config map mounted so far
    pub config_map_hashes: BTreeMap<String, String>,
    /// Content hashes of every data-source secret mounted so far
    pub secret_hashes: BTreeMap<String, String>,
}

impl DispatchReport {
    fn new() -> Self {
        Self {
            state: DispatchState::Complete,
            config_map_hashes: BTreeMap::new(),
            secret_hashes: BTreeMap::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DispatchState::Pending { .. })
    }
}

fn hash_data(data: &BTreeMap<String, String>) -> Result<String, OrchestratorError> {
    Ok(sha256_hash(&serde_json::to_vec(data)?))
}

fn push_mount(mounts: &mut Vec<Mount>, mount: Mount) {
    if !mounts.iter().any(|m| m.name == mount.name) {
        mounts.push(mount);
    }
}

/// Dispatches the services of one deployment, one NodeSet at a time
pub struct Dispatcher<'a> {
    pub backend: &'a dyn ExecutionBackend,
    pub registry: &'a dyn ServiceRegistry,
    pub secrets: &'a Api<Secret>,
    pub config_maps: &'a Api<ConfigMap>,
    pub defaults: &'a ExecutionDefaults,
}

impl Dispatcher<'_> {
    /// Advance `node_set` through the deployment's service list.
    ///
    /// `all_node_sets` are the deployment's targets, used by services that run
    /// once across every node set. Per-service progress goes into `progress`
    /// as `<Service>DeploymentReady` conditions.
    pub async fn deploy(
        &self,
        deployment: &Deployment,
        node_set: &NodeSet,
        all_node_sets: &[NodeSet],
        progress: &mut ConditionLedger,
    ) -> Result<DispatchReport, OrchestratorError> {
        let mut report = DispatchReport::new();

        for name in deployment.spec.effective_services(node_set) {
            let condition = types::service_deployment_ready(name);

            let service = match self.registry.resolve(name).await {
                Ok(service) => service,
                Err(err) => {
                    progress.mark_false(&condition, reasons::ERROR, Severity::Error, err.to_string());
                    return Err(err);
                }
            };

            let scope = (!service.spec.deploy_on_all_node_sets).then(|| node_set.name());
            let job = job_name(name, deployment.name(), scope);

            match self.backend.status(&job).await? {
                Some(status) if status.phase == JobPhase::Succeeded => {
                    self.data_sources(&service, &mut report, false).await?;
                    debug!(nodeset = %node_set.name(), service = %name, job = %job, "job succeeded");
                    progress.mark_true(&condition, reasons::READY, format!("job {} succeeded", job));
                }
                Some(status) if status.phase == JobPhase::Failed => {
                    let message = format!(
                        "job {} for service {} failed: {}",
                        job,
                        name,
                        if status.message.is_empty() {
                            "no details reported"
                        } else {
                            status.message.as_str()
                        }
                    );
                    warn!(nodeset = %node_set.name(), service = %name, "{}", message);
                    progress.mark_false(&condition, reasons::ERROR, Severity::Error, &message);
                    return Err(OrchestratorError::ExecutionFailed(message));
                }
                Some(status) => {
                    self.data_sources(&service, &mut report, false).await?;
                    let mut message = format!("job {} for service {} is running", job, name);
                    if !status.message.is_empty() {
                        message = format!("{message}: {}", status.message);
                    }
                    progress.mark_false(&condition, reasons::PENDING, Severity::Info, message);
                    report.state = DispatchState::Pending {
                        service: name.clone(),
                        job,
                    };
                    return Ok(report);
                }
                None => {
                    let data_mounts = match self.data_sources(&service, &mut report, true).await {
                        Ok(mounts) => mounts,
                        Err(err) => {
                            progress.mark_false(
                                &condition,
                                reasons::ERROR,
                                Severity::Error,
                                err.to_string(),
                            );
                            return Err(err);
                        }
                    };
                    let spec = self
                        .build_job(&job, deployment, node_set, all_node_sets, &service, data_mounts)
                        .await?;
                    let handle = self.backend.submit(&spec).await?;
                    if handle.created {
                        info!(
                            nodeset = %node_set.name(),
                            service = %name,
                            job = %job,
                            "submitted job"
                        );
                    }
                    progress.mark_false(
                        &condition,
                        reasons::DEPLOYING,
                        Severity::Info,
                        format!("job {} for service {} submitted", job, name),
                    );
                    report.state = DispatchState::Pending {
                        service: name.clone(),
                        job,
                    };
                    return Ok(report);
                }
            }
        }

        Ok(report)
    }

    /// Mounts for every data source of `service`, recording content hashes.
    ///
    /// With `required` unset (the job already exists) sources that are gone
    /// or malformed are skipped instead of failing the pass.
    async fn data_sources(
        &self,
        service: &Service,
        report: &mut DispatchReport,
        required: bool,
    ) -> Result<Vec<Mount>, OrchestratorError> {
        let mut mounts = Vec::new();

        for source in &service.spec.data_sources {
            let (name, mount_source, data) = match (&source.config_map, &source.secret) {
                (Some(name), _) => {
                    let found = self.config_maps.get(name).await?;
                    (name, MountSource::ConfigMap(name.clone()), found.map(|c| c.data))
                }
                (None, Some(name)) => {
                    let found = self.secrets.get(name).await?;
                    (name, MountSource::Secret(name.clone()), found.map(|s| s.data))
                }
                (None, None) if !required => continue,
                (None, None) => {
                    return Err(OrchestratorError::ConfigurationInvalid(format!(
                        "service {} has a data source naming neither a config map nor a secret",
                        service.name()
                    )))
                }
            };

            let Some(data) = data else {
                if source.optional || !required {
                    continue;
                }
                return Err(OrchestratorError::ConfigurationInvalid(format!(
                    "service {} needs {} which does not exist",
                    service.name(),
                    name
                )));
            };

            let hash = hash_data(&data)?;
            match mount_source {
                MountSource::ConfigMap(_) => report.config_map_hashes.insert(name.clone(), hash),
                MountSource::Secret(_) => report.secret_hashes.insert(name.clone(), hash),
            };

            push_mount(
                &mut mounts,
                Mount {
                    name: name.clone(),
                    path: source
                        .mount_path
                        .clone()
                        .unwrap_or_else(|| format!("/var/lib/fleetplane/{}", name)),
                    source: mount_source,
                },
            );
        }

        Ok(mounts)
    }

    async fn build_job(
        &self,
        job: &str,
        deployment: &Deployment,
        node_set: &NodeSet,
        all_node_sets: &[NodeSet],
        service: &Service,
        data_mounts: Vec<Mount>,
    ) -> Result<ExecutionJob, OrchestratorError> {
        let targets: Vec<&NodeSet> = if service.spec.deploy_on_all_node_sets {
            all_node_sets.iter().collect()
        } else {
            vec![node_set]
        };

        let mut inventory = Inventory::default();
        let mut mounts = Vec::new();
        let mut tls = false;

        for target in targets {
            let secret_name = target
                .status
                .inventory_secret
                .clone()
                .unwrap_or_else(|| inventory_secret_name(target.name()));
            let secret = self.secrets.get(&secret_name).await?.ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "inventory secret {} of NodeSet {}",
                    secret_name,
                    target.name()
                ))
            })?;
            inventory.extend(Inventory::from_secret(&secret)?);

            push_mount(
                &mut mounts,
                Mount {
                    name: format!("inventory-{}", target.name()),
                    source: MountSource::Secret(secret_name),
                    path: format!("/runner/inventory/{}", target.name()),
                },
            );

            for credential in target.spec.credential_secrets()? {
                push_mount(
                    &mut mounts,
                    Mount {
                        name: format!("ssh-key-{}", credential),
                        path: format!("/runner/env/ssh-keys/{}", credential),
                        source: MountSource::Secret(credential),
                    },
                );
            }

            if target.spec.tls_enabled && service.spec.requires_tls() {
                tls = true;
                push_mount(
                    &mut mounts,
                    Mount {
                        name: format!("certs-{}", target.name()),
                        source: MountSource::Secret(cert_secret_name(
                            service.name(),
                            deployment.name(),
                            target.name(),
                        )),
                        path: format!("/var/lib/fleetplane/certs/{}/{}", service.name(), target.name()),
                    },
                );
            }
        }

        if tls {
            if let Some(ca) = &service.spec.ca_certs {
                push_mount(
                    &mut mounts,
                    Mount {
                        name: format!("cacerts-{}", service.name()),
                        source: MountSource::Secret(ca.clone()),
                        path: format!("/var/lib/fleetplane/cacerts/{}", service.name()),
                    },
                );
            }
        }

        for mount in data_mounts {
            push_mount(&mut mounts, mount);
        }

        let mut env = node_set.spec.env.clone();
        env.extend(service.spec.env.iter().cloned());

        let mut labels = BTreeMap::from([
            (LABEL_DEPLOYMENT.to_string(), deployment.name().to_string()),
            (LABEL_SERVICE.to_string(), service.name().to_string()),
        ]);
        if !service.spec.deploy_on_all_node_sets {
            labels.insert(LABEL_NODESET.to_string(), node_set.name().to_string());
        }

        Ok(ExecutionJob {
            name: job.to_string(),
            labels,
            image: self.defaults.runner_image.clone(),
            service_account: self.defaults.service_account.clone(),
            inventory,
            steps: service.spec.steps.clone(),
            mounts,
            env,
            filter: deployment.spec.exec_filter.clone(),
            extra_vars: deployment.spec.extra_vars.clone(),
            backoff_limit: deployment
                .spec
                .backoff_limit
                .unwrap_or(self.defaults.backoff_limit),
            owner: deployment.owner_reference(),
        })
    }
}
