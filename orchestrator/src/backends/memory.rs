//! In-process backends
//!
//! Used by the daemon when no remote endpoint is configured and by the test
//! suite, which drives job phases and address readiness through the helper
//! methods on each type.
//!
//! The certificate issuer produces placeholder material only. It is meant for
//! local runs and must not back a real fleet.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleet_api::OwnerReference;
use ipnet::{IpNet, Ipv4AddrRange, Ipv6AddrRange};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{
    AddressBackend, BackendError, CertificateBackend, CertificateBundle, CertificateRequest,
    CertificateState, DnsBackend, DnsRecord, ExecutionBackend, ExecutionJob, JobHandle, JobPhase,
    JobStatus, Reservation, ReservationRequest, ReservationState, Route,
};
use crate::utils::sha256_hash;

fn poison_err<T>(_: PoisonError<T>) -> BackendError {
    BackendError::Unavailable("backend state lock poisoned".to_string())
}

// =============================== EXECUTION ================================== //

#[derive(Debug, Default)]
struct ExecutionState {
    jobs: BTreeMap<String, (ExecutionJob, JobStatus)>,
    order: Vec<String>,
}

/// Records submitted jobs. Jobs stay pending until [`Self::set_phase`] moves
/// them, unless the backend was built with [`Self::auto_completing`].
#[derive(Debug, Default)]
pub struct MemoryExecutionBackend {
    state: RwLock<ExecutionState>,
    auto_complete: bool,
}

impl MemoryExecutionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submitted job succeeds immediately
    pub fn auto_completing() -> Self {
        Self {
            state: RwLock::new(ExecutionState::default()),
            auto_complete: true,
        }
    }

    /// Move a job to `phase`. Returns false for unknown jobs.
    pub fn set_phase(&self, name: &str, phase: JobPhase, message: &str) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        match state.jobs.get_mut(name) {
            Some((_, status)) => {
                status.phase = phase;
                status.message = message.to_string();
                true
            }
            None => false,
        }
    }

    /// Job names in submission order
    pub fn submitted(&self) -> Vec<String> {
        self.state
            .read()
            .map(|state| state.order.clone())
            .unwrap_or_default()
    }

    pub fn job(&self, name: &str) -> Option<ExecutionJob> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.jobs.get(name).map(|(job, _)| job.clone()))
    }
}

#[async_trait]
impl ExecutionBackend for MemoryExecutionBackend {
    async fn submit(&self, job: &ExecutionJob) -> Result<JobHandle, BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.jobs.contains_key(&job.name) {
            return Ok(JobHandle {
                name: job.name.clone(),
                created: false,
            });
        }

        let phase = if self.auto_complete {
            JobPhase::Succeeded
        } else {
            JobPhase::Pending
        };
        state.jobs.insert(
            job.name.clone(),
            (
                job.clone(),
                JobStatus {
                    phase,
                    message: String::new(),
                },
            ),
        );
        state.order.push(job.name.clone());
        info!("accepted job {} ({} hosts)", job.name, job.inventory.host_count());

        Ok(JobHandle {
            name: job.name.clone(),
            created: true,
        })
    }

    async fn status(&self, name: &str) -> Result<Option<JobStatus>, BackendError> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.jobs.get(name).map(|(_, status)| status.clone()))
    }
}

// =============================== ADDRESSES ================================== //

fn default_mtu() -> u32 {
    1500
}

/// Address pool for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPool {
    pub name: String,
    pub cidr: IpNet,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub vlan: Option<u16>,
    pub dns_domain: String,
    /// First address handed out; earlier host addresses are reserved for infrastructure
    #[serde(default)]
    pub allocation_start: Option<IpAddr>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl NetworkPool {
    fn reservation(&self, address: IpAddr) -> Reservation {
        Reservation {
            network: self.name.clone(),
            address,
            prefix_len: self.cidr.prefix_len(),
            gateway: self.gateway,
            mtu: self.mtu,
            vlan: self.vlan,
            dns_domain: self.dns_domain.clone(),
            routes: self.routes.clone(),
        }
    }

    /// Host addresses in ascending order, beginning at `allocation_start`
    fn candidates(&self) -> Box<dyn Iterator<Item = IpAddr> + Send> {
        match self.cidr {
            IpNet::V4(net) => {
                let hosts = net.hosts();
                let (Some(first), Some(last)) = (hosts.clone().next(), hosts.clone().next_back())
                else {
                    return Box::new(std::iter::empty());
                };
                let start = match self.allocation_start {
                    Some(IpAddr::V4(start)) if start > first => start,
                    _ => first,
                };
                Box::new(Ipv4AddrRange::new(start, last).map(IpAddr::V4))
            }
            IpNet::V6(net) => {
                let hosts = net.hosts();
                let (Some(first), Some(last)) = (hosts.clone().next(), hosts.clone().next_back())
                else {
                    return Box::new(std::iter::empty());
                };
                let start = match self.allocation_start {
                    Some(IpAddr::V6(start)) if start > first => start,
                    _ => first,
                };
                Box::new(Ipv6AddrRange::new(start, last).map(IpAddr::V6))
            }
        }
    }

    fn allocatable(&self, address: IpAddr) -> bool {
        Some(address) != self.gateway
            && self.allocation_start.map_or(true, |start| address >= start)
    }
}

/// (owner uid, node, network)
type ReservationKey = (String, String, String);

#[derive(Debug, Default)]
struct AddressState {
    reservations: HashMap<ReservationKey, Reservation>,
    used: HashMap<String, HashSet<IpAddr>>,
    held: HashSet<String>,
}

impl AddressState {
    fn free(&mut self, reservation: &Reservation) {
        if let Some(used) = self.used.get_mut(&reservation.network) {
            used.remove(&reservation.address);
        }
    }
}

/// Pool-based address allocator. A (node, network) pair keeps its address
/// across calls for as long as the owner holds it.
#[derive(Debug, Default)]
pub struct MemoryAddressBackend {
    pools: HashMap<String, NetworkPool>,
    state: RwLock<AddressState>,
}

impl MemoryAddressBackend {
    pub fn new(pools: impl IntoIterator<Item = NetworkPool>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.name.clone(), p)).collect(),
            state: RwLock::new(AddressState::default()),
        }
    }

    /// Report reservations on `network` as pending until released again
    pub fn hold(&self, network: &str, held: bool) {
        if let Ok(mut state) = self.state.write() {
            if held {
                state.held.insert(network.to_string());
            } else {
                state.held.remove(network);
            }
        }
    }

    /// Reservations held by an owner, ordered by (node, network)
    pub fn reservations(&self, owner: &OwnerReference) -> Vec<(String, Reservation)> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        let mut held: Vec<(String, Reservation)> = state
            .reservations
            .iter()
            .filter(|((uid, _, _), _)| uid == &owner.uid)
            .map(|((_, node, _), r)| (node.clone(), r.clone()))
            .collect();
        held.sort_by(|a, b| (&a.0, &a.1.network).cmp(&(&b.0, &b.1.network)));
        held
    }
}

#[async_trait]
impl AddressBackend for MemoryAddressBackend {
    async fn reserve(
        &self,
        request: &ReservationRequest,
    ) -> Result<ReservationState, BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.held.contains(&request.network) {
            return Ok(ReservationState::Pending);
        }

        let pool = self.pools.get(&request.network).ok_or_else(|| {
            BackendError::Rejected(format!("network {} is not defined", request.network))
        })?;

        let key = (
            request.owner.uid.clone(),
            request.node.clone(),
            request.network.clone(),
        );
        if let Some(existing) = state.reservations.get(&key).cloned() {
            if request.fixed_ip.map_or(true, |ip| ip == existing.address) {
                return Ok(ReservationState::Ready(existing));
            }
            state.reservations.remove(&key);
            state.free(&existing);
        }

        let used = state.used.entry(request.network.clone()).or_default();
        let address = match request.fixed_ip {
            Some(ip) => {
                if !pool.cidr.contains(&ip) {
                    return Err(BackendError::Rejected(format!(
                        "{ip} is outside network {} ({})",
                        pool.name, pool.cidr
                    )));
                }
                if used.contains(&ip) {
                    return Err(BackendError::Rejected(format!(
                        "{ip} on network {} is already reserved",
                        pool.name
                    )));
                }
                ip
            }
            None => pool
                .candidates()
                .find(|ip| pool.allocatable(*ip) && !used.contains(ip))
                .ok_or_else(|| {
                    BackendError::Unavailable(format!("network {} has no free addresses", pool.name))
                })?,
        };
        used.insert(address);

        let reservation = pool.reservation(address);
        debug!(
            "reserved {} for {}/{} on {}",
            address, request.owner.name, request.node, request.network
        );
        state.reservations.insert(key, reservation.clone());
        Ok(ReservationState::Ready(reservation))
    }

    async fn release(&self, owner: &OwnerReference) -> Result<(), BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        let released: Vec<ReservationKey> = state
            .reservations
            .keys()
            .filter(|(uid, _, _)| uid == &owner.uid)
            .cloned()
            .collect();
        for key in released {
            if let Some(reservation) = state.reservations.remove(&key) {
                state.free(&reservation);
            }
        }
        Ok(())
    }
}

// ================================== DNS ===================================== //

/// Record sets keyed by owner uid
#[derive(Debug, Default)]
pub struct MemoryDnsBackend {
    records: RwLock<BTreeMap<String, Vec<DnsRecord>>>,
    nameservers: Vec<IpAddr>,
}

impl MemoryDnsBackend {
    pub fn new(nameservers: Vec<IpAddr>) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            nameservers,
        }
    }

    pub fn records(&self, owner: &OwnerReference) -> Vec<DnsRecord> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&owner.uid).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DnsBackend for MemoryDnsBackend {
    async fn upsert(
        &self,
        owner: &OwnerReference,
        records: &[DnsRecord],
    ) -> Result<(), BackendError> {
        let mut all = self.records.write().map_err(poison_err)?;
        all.insert(owner.uid.clone(), records.to_vec());
        Ok(())
    }

    async fn remove(&self, owner: &OwnerReference) -> Result<(), BackendError> {
        let mut all = self.records.write().map_err(poison_err)?;
        all.remove(&owner.uid);
        Ok(())
    }

    fn nameservers(&self) -> Vec<IpAddr> {
        self.nameservers.clone()
    }
}

// ============================== CERTIFICATES ================================ //

#[derive(Debug)]
struct CertEntry {
    polls: u32,
    bundle: Option<CertificateBundle>,
}

/// Development issuer. Reports pending for `pending_polls` calls per name,
/// then issues placeholder PEM blocks.
#[derive(Debug, Default)]
pub struct MemoryCertificateBackend {
    pending_polls: u32,
    certs: RwLock<HashMap<String, CertEntry>>,
}

fn pem_block(label: &str, payload: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        STANDARD.encode(payload)
    )
}

impl MemoryCertificateBackend {
    pub fn new(pending_polls: u32) -> Self {
        Self {
            pending_polls,
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// Names of certificates issued so far, sorted
    pub fn issued(&self) -> Vec<String> {
        let Ok(certs) = self.certs.read() else {
            return Vec::new();
        };
        let mut names: Vec<String> = certs
            .iter()
            .filter(|(_, entry)| entry.bundle.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn bundle(request: &CertificateRequest) -> CertificateBundle {
        let issuer = request.issuer.as_deref().unwrap_or("fleetplane-dev-ca");
        let subject = json!({
            "name": request.name,
            "dnsNames": request.dns_names,
            "ipAddresses": request.ip_addresses,
            "issuer": issuer,
            "durationSecs": request.duration.as_secs(),
        });
        let key_seed = format!("{}/{}", request.owner.uid, request.name);
        CertificateBundle {
            cert_pem: pem_block("CERTIFICATE", subject.to_string().as_bytes()),
            key_pem: pem_block("PRIVATE KEY", sha256_hash(key_seed.as_bytes()).as_bytes()),
            ca_pem: pem_block("CERTIFICATE", issuer.as_bytes()),
        }
    }
}

#[async_trait]
impl CertificateBackend for MemoryCertificateBackend {
    async fn issue(
        &self,
        request: &CertificateRequest,
    ) -> Result<CertificateState, BackendError> {
        let mut certs = self.certs.write().map_err(poison_err)?;
        let entry = certs.entry(request.name.clone()).or_insert(CertEntry {
            polls: 0,
            bundle: None,
        });

        if let Some(bundle) = &entry.bundle {
            return Ok(CertificateState::Issued(bundle.clone()));
        }
        if entry.polls < self.pending_polls {
            entry.polls += 1;
            return Ok(CertificateState::Pending);
        }

        let bundle = Self::bundle(request);
        entry.bundle = Some(bundle.clone());
        debug!("issued certificate {}", request.name);
        Ok(CertificateState::Issued(bundle))
    }

    async fn fetch(&self, name: &str) -> Result<Option<CertificateBundle>, BackendError> {
        let certs = self.certs.read().map_err(poison_err)?;
        Ok(certs.get(name).and_then(|entry| entry.bundle.clone()))
    }

    async fn revoke(&self, name: &str) -> Result<(), BackendError> {
        let mut certs = self.certs.write().map_err(poison_err)?;
        certs.remove(name);
        Ok(())
    }
}
