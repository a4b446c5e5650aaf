//! External collaborators
//!
//! The orchestrator drives four backends it does not implement itself:
//!
//! - [`ExecutionBackend`]: runs a named job against an inventory
//! - [`AddressBackend`]: reserves addresses per (node, network)
//! - [`DnsBackend`]: publishes name records (optional)
//! - [`CertificateBackend`]: issues TLS material (optional)
//!
//! Each call either completes with a definitive result or reports pending;
//! nothing here blocks on long-running work.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_api::service::ExecutionStep;
use fleet_api::{EnvVar, ExecFilter, OwnerReference, VarMap};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::inventory::Inventory;

/// Errors reported by external backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transient infrastructure fault
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The request can never succeed as written
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

// =============================== EXECUTION ================================== //

/// Where a mount comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "name")]
pub enum MountSource {
    Secret(String),
    ConfigMap(String),
}

/// Named external artifact made available to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub name: String,
    pub source: MountSource,
    pub path: String,
}

/// One unit of remote work: one service against one node set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub service_account: String,
    pub inventory: Inventory,
    pub steps: Vec<ExecutionStep>,
    pub mounts: Vec<Mount>,
    pub env: Vec<EnvVar>,
    pub filter: ExecFilter,
    pub extra_vars: VarMap,
    pub backoff_limit: u32,
    pub owner: OwnerReference,
}

/// Returned by a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub name: String,
    /// False when a job with the same name already existed
    pub created: bool,
}

/// Coarse job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Pending,
    Succeeded,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobPhase::Pending => "pending",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Job state plus a human readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub phase: JobPhase,
    #[serde(default)]
    pub message: String,
}

/// Remote-execution backend. At most one job exists per name; submitting a
/// name that already exists is not an error.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, job: &ExecutionJob) -> Result<JobHandle, BackendError>;

    /// `None` when no job with that name was ever submitted
    async fn status(&self, name: &str) -> Result<Option<JobStatus>, BackendError>;
}

// =============================== ADDRESSES ================================== //

/// Static route handed to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub destination: IpNet,
    pub nexthop: IpAddr,
}

/// Address reservation request for one (node, network) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub owner: OwnerReference,
    pub node: String,
    pub hostname: String,
    pub network: String,
    pub subnet: String,
    pub fixed_ip: Option<IpAddr>,
}

/// A reserved address with everything a node needs to configure it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub network: String,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub mtu: u32,
    pub vlan: Option<u16>,
    pub dns_domain: String,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Reservation {
    /// Network in CIDR notation, e.g. `192.168.122.0/24`
    pub fn cidr(&self) -> String {
        IpNet::new(self.address, self.prefix_len)
            .map(|net| net.trunc().to_string())
            .unwrap_or_else(|_| format!("{}/{}", self.address, self.prefix_len))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationState {
    Ready(Reservation),
    Pending,
}

#[async_trait]
pub trait AddressBackend: Send + Sync {
    async fn reserve(&self, request: &ReservationRequest)
        -> Result<ReservationState, BackendError>;

    /// Drop every reservation held by `owner`
    async fn release(&self, owner: &OwnerReference) -> Result<(), BackendError>;
}

// ================================== DNS ===================================== //

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    pub fqdn: String,
    pub address: IpAddr,
}

/// Name-resolution backend with upsert semantics
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Replace the record set owned by `owner`
    async fn upsert(&self, owner: &OwnerReference, records: &[DnsRecord])
        -> Result<(), BackendError>;

    async fn remove(&self, owner: &OwnerReference) -> Result<(), BackendError>;

    /// Resolvers the nodes should use
    fn nameservers(&self) -> Vec<IpAddr>;
}

// ============================== CERTIFICATES ================================ //

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub name: String,
    pub owner: OwnerReference,
    pub subject_labels: BTreeMap<String, String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub duration: Duration,
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBundle {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateState {
    Issued(CertificateBundle),
    Pending,
}

/// Certificate issuance backend; issuing an existing name returns the same bundle
#[async_trait]
pub trait CertificateBackend: Send + Sync {
    async fn issue(&self, request: &CertificateRequest)
        -> Result<CertificateState, BackendError>;

    /// Bundle of an already issued certificate, `None` while none exists
    async fn fetch(&self, name: &str) -> Result<Option<CertificateBundle>, BackendError>;

    async fn revoke(&self, name: &str) -> Result<(), BackendError>;
}

/// Every backend the reconcilers talk to
#[derive(Clone)]
pub struct Backends {
    pub execution: Arc<dyn ExecutionBackend>,
    pub addresses: Arc<dyn AddressBackend>,
    pub dns: Option<Arc<dyn DnsBackend>>,
    pub certificates: Option<Arc<dyn CertificateBackend>>,
}
