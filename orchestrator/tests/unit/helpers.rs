//! Shared fixtures

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_api::nodeset::NetworkAttachment;
use fleet_api::service::ExecutionStep;
use fleet_api::{
    Deployment, DeploymentSpec, NodeSet, NodeSetSpec, ObjectMeta, Resource, Secret, Service,
    ServiceSpec,
};
use fleetplane::backends::memory::{
    MemoryAddressBackend, MemoryCertificateBackend, MemoryDnsBackend, MemoryExecutionBackend,
    NetworkPool,
};
use fleetplane::backends::{Backends, CertificateBackend, DnsBackend};
use fleetplane::errors::OrchestratorError;
use fleetplane::reconcile::{deployment, nodeset, Action, Context, ReconcileOptions};
use fleetplane::store::memory::MemoryStore;
use fleetplane::store::{Api, ObjectStore};

pub const CREDENTIALS: &str = "dataplane-ansible-ssh-private-key-secret";

pub const NAMESERVER: &str = "192.168.122.10";

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub execution: Arc<MemoryExecutionBackend>,
    pub addresses: Arc<MemoryAddressBackend>,
    pub dns: Option<Arc<MemoryDnsBackend>>,
    pub certificates: Option<Arc<MemoryCertificateBackend>>,
    pub ctx: Context,
}

impl Fixture {
    /// No address pools, no resolver, no issuer
    pub fn new() -> Self {
        Self::build(Vec::new(), None, None)
    }

    /// A ctlplane pool, a resolver and an issuer that answers pending once
    /// per certificate
    pub fn networked() -> Self {
        Self::build(
            vec![ctlplane_pool()],
            Some(MemoryDnsBackend::new(vec![NAMESERVER.parse().unwrap()])),
            Some(MemoryCertificateBackend::new(1)),
        )
    }

    fn build(
        pools: Vec<NetworkPool>,
        dns: Option<MemoryDnsBackend>,
        certificates: Option<MemoryCertificateBackend>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let execution = Arc::new(MemoryExecutionBackend::new());
        let addresses = Arc::new(MemoryAddressBackend::new(pools));
        let dns = dns.map(Arc::new);
        let certificates = certificates.map(Arc::new);
        let backends = Backends {
            execution: execution.clone(),
            addresses: addresses.clone(),
            dns: dns.clone().map(|d| d as Arc<dyn DnsBackend>),
            certificates: certificates
                .clone()
                .map(|c| c as Arc<dyn CertificateBackend>),
        };
        let ctx = Context::new(
            store.clone() as Arc<dyn ObjectStore>,
            backends,
            ReconcileOptions::default(),
        );
        Self {
            store,
            execution,
            addresses,
            dns,
            certificates,
            ctx,
        }
    }

    pub fn api<K: Resource>(&self) -> Api<K> {
        Api::new(self.store.clone() as Arc<dyn ObjectStore>)
    }

    pub async fn create<K: Resource>(&self, object: K) -> K {
        self.api::<K>().create(&object).await.unwrap()
    }

    pub async fn node_set(&self, name: &str) -> NodeSet {
        self.ctx.node_sets.get(name).await.unwrap().unwrap()
    }

    pub async fn deployment(&self, name: &str) -> Deployment {
        self.ctx.deployments.get(name).await.unwrap().unwrap()
    }

    pub async fn reconcile_node_set(&self, name: &str) -> Result<Action, OrchestratorError> {
        nodeset::reconcile(&self.ctx, name).await
    }

    pub async fn reconcile_deployment(&self, name: &str) -> Result<Action, OrchestratorError> {
        deployment::reconcile(&self.ctx, name).await
    }

    /// Credentials, services and set-up NodeSets ready for a deployment
    pub async fn seed(&self, node_sets: &[&str], services: &[&str]) {
        self.create(ssh_secret(CREDENTIALS)).await;
        for service in services {
            self.create(service_named(service)).await;
        }
        for name in node_sets {
            self.create(node_set_named(name, services)).await;
            self.reconcile_node_set(name).await.unwrap();
        }
    }
}

pub fn ctlplane_pool() -> NetworkPool {
    NetworkPool {
        name: "ctlplane".into(),
        cidr: "192.168.122.0/24".parse().unwrap(),
        gateway: Some("192.168.122.1".parse().unwrap()),
        mtu: 1500,
        vlan: None,
        dns_domain: "example.com".into(),
        allocation_start: Some("192.168.122.100".parse().unwrap()),
        routes: Vec::new(),
    }
}

/// A NodeSet whose nodes attach to the ctlplane network
pub fn networked_node_set(name: &str, services: &[&str]) -> NodeSet {
    let mut node_set = node_set_named(name, services);
    node_set.spec.node_template.networks = vec![NetworkAttachment::new("ctlplane")];
    node_set
}

pub fn ssh_secret(name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta::named(name),
        data: BTreeMap::from([(nodeset::SSH_KEY.to_string(), "a2V5".to_string())]),
    }
}

pub fn node_set_named(name: &str, services: &[&str]) -> NodeSet {
    let mut spec = NodeSetSpec::default();
    spec.node_template.credential_secret = Some(CREDENTIALS.to_string());
    spec.nodes.insert(format!("{name}-compute-0"), Default::default());
    spec.services = services.iter().map(|s| s.to_string()).collect();
    NodeSet {
        metadata: ObjectMeta::named(name),
        spec,
        ..Default::default()
    }
}

pub fn service_named(name: &str) -> Service {
    Service {
        metadata: ObjectMeta::named(name),
        spec: ServiceSpec {
            steps: vec![ExecutionStep::Playbook {
                path: format!("fleet.{name}"),
                tags: Vec::new(),
            }],
            ..Default::default()
        },
    }
}

pub fn deployment_named(name: &str, node_sets: &[&str]) -> Deployment {
    Deployment {
        metadata: ObjectMeta::named(name),
        spec: DeploymentSpec {
            node_sets: node_sets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}
