//! TLS material issuance
//!
//! One certificate per node, scoped to the names (and optionally addresses)
//! the node got from the earlier steps. All certificates of one
//! (deployment, node set, service) triple are stored in a single secret owned
//! by the deployment:
//!
//! ```text
//! cert-<service>-<deployment>-<nodeset>
//!   <node>-tls.crt / <node>-tls.key / <node>-ca.crt
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleet_api::service::CertContent;
use fleet_api::{Deployment, NodeSet, ObjectMeta, Resource, Secret, Service};
use tracing::{debug, info};

use super::Readiness;
use crate::backends::{
    BackendError, CertificateBackend, CertificateBundle, CertificateRequest, CertificateState,
};
use crate::deploy::{LABEL_DEPLOYMENT, LABEL_NODESET, LABEL_SERVICE};
use crate::errors::OrchestratorError;
use crate::store::Api;
use crate::utils::joined_label;

/// Certificate names held in a bundle secret, comma separated
pub const CERTIFICATES_ANNOTATION: &str = "fleetplane.io/certificates";

/// Issuance parameters shared by every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOptions {
    pub duration: Duration,
    pub issuer: Option<String>,
}

impl Default for CertificateOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(365 * 24 * 3600),
            issuer: None,
        }
    }
}

pub fn cert_secret_name(service: &str, deployment: &str, node_set: &str) -> String {
    joined_label(&["cert", service, deployment, node_set], 63)
}

fn cert_name(service: &str, deployment: &str, node_set: &str, node: &str) -> String {
    joined_label(&[service, deployment, node_set, node], 63)
}

const CERT_KEYS: [&str; 3] = ["tls.crt", "tls.key", "ca.crt"];

fn insert_bundle(data: &mut BTreeMap<String, String>, node: &str, bundle: &CertificateBundle) {
    let pems = [&bundle.cert_pem, &bundle.key_pem, &bundle.ca_pem];
    for (key, pem) in CERT_KEYS.iter().zip(pems) {
        data.insert(format!("{node}-{key}"), STANDARD.encode(pem));
    }
}

/// Issue or fetch the certificates `service` needs on every node of
/// `node_set` and aggregate them into the bundle secret.
///
/// Returns the secret name once every certificate is issued.
pub async fn ensure_certificates(
    backend: &dyn CertificateBackend,
    secrets: &Api<Secret>,
    options: &CertificateOptions,
    deployment: &Deployment,
    node_set: &NodeSet,
    service: &Service,
) -> Result<Readiness<String>, OrchestratorError> {
    let Some(tls) = service.spec.tls_cert.as_ref() else {
        return Err(OrchestratorError::ConfigurationInvalid(format!(
            "service {} does not request TLS material",
            service.name()
        )));
    };

    let secret_name = cert_secret_name(service.name(), deployment.name(), node_set.name());
    let nodes = node_set.spec.effective_nodes()?;

    let mut data = BTreeMap::new();
    let mut names = Vec::new();
    let mut pending = Vec::new();

    for node in &nodes {
        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();

        if tls.wants(CertContent::DnsNames) {
            if let Some(hostnames) = node_set.status.all_hostnames.get(&node.name) {
                dns_names.extend(
                    hostnames
                        .iter()
                        .filter(|(network, _)| tls.covers_network(network))
                        .map(|(_, fqdn)| fqdn.clone()),
                );
            }
            if dns_names.is_empty() {
                dns_names.push(node.hostname.clone());
            }
        }
        if tls.wants(CertContent::IpAddresses) {
            if let Some(ips) = node_set.status.all_ips.get(&node.name) {
                ip_addresses.extend(
                    ips.iter()
                        .filter(|(network, _)| tls.covers_network(network))
                        .map(|(_, ip)| *ip),
                );
            }
        }

        let name = cert_name(service.name(), deployment.name(), node_set.name(), &node.name);
        let request = CertificateRequest {
            name: name.clone(),
            owner: deployment.owner_reference(),
            subject_labels: BTreeMap::from([
                (LABEL_SERVICE.to_string(), service.name().to_string()),
                (LABEL_NODESET.to_string(), node_set.name().to_string()),
                (LABEL_DEPLOYMENT.to_string(), deployment.name().to_string()),
                ("hostname".to_string(), node.hostname.clone()),
            ]),
            dns_names,
            ip_addresses,
            duration: options.duration,
            issuer: tls.issuer.clone().or_else(|| options.issuer.clone()),
        };

        match backend.issue(&request).await {
            Ok(CertificateState::Issued(bundle)) => insert_bundle(&mut data, &node.name, &bundle),
            Ok(CertificateState::Pending) => pending.push(node.name.clone()),
            Err(BackendError::AlreadyExists(_)) => match backend.fetch(&name).await? {
                Some(bundle) => insert_bundle(&mut data, &node.name, &bundle),
                None => pending.push(node.name.clone()),
            },
            Err(err) => return Err(err.into()),
        }
        names.push(name);
    }

    if !pending.is_empty() {
        debug!(
            deployment = %deployment.name(),
            service = %service.name(),
            "certificates pending for {}",
            pending.join(", ")
        );
        return Ok(Readiness::Pending(format!(
            "waiting for {} certificates on {}: {}",
            service.name(),
            node_set.name(),
            pending.join(", ")
        )));
    }

    let mut metadata = ObjectMeta::named(&secret_name);
    metadata.owner_references.push(deployment.owner_reference());
    metadata.labels = BTreeMap::from([
        (LABEL_SERVICE.to_string(), service.name().to_string()),
        (LABEL_NODESET.to_string(), node_set.name().to_string()),
        (LABEL_DEPLOYMENT.to_string(), deployment.name().to_string()),
    ]);
    metadata
        .annotations
        .insert(CERTIFICATES_ANNOTATION.to_string(), names.join(","));

    secrets.apply(&Secret { metadata, data }).await?;
    Ok(Readiness::Ready(secret_name))
}

/// Revoke and delete every bundle secret owned by `deployment`
pub async fn remove_certificates(
    backend: Option<&dyn CertificateBackend>,
    secrets: &Api<Secret>,
    deployment: &Deployment,
) -> Result<(), OrchestratorError> {
    let owner = deployment.owner_reference();
    for secret in secrets.list().await? {
        if !secret.metadata.is_owned_by(&owner) {
            continue;
        }
        let Some(names) = secret.metadata.annotations.get(CERTIFICATES_ANNOTATION) else {
            continue;
        };
        if let Some(backend) = backend {
            for name in names.split(',').filter(|n| !n.is_empty()) {
                backend.revoke(name).await?;
            }
        }
        secrets.delete(secret.name()).await?;
        info!(deployment = %deployment.name(), "removed certificate secret {}", secret.name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use fleet_api::service::TlsCertSpec;
    use fleet_api::{NodeSetSpec, ServiceSpec};

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStore;

    /// Issues a name once, then answers AlreadyExists like a real CA would.
    /// Names listed in `slow` are pending on their first request.
    #[derive(Default)]
    struct OneShotIssuer {
        slow: Vec<String>,
        calls: Mutex<HashMap<String, u32>>,
        issued: Mutex<HashMap<String, CertificateBundle>>,
    }

    #[async_trait]
    impl CertificateBackend for OneShotIssuer {
        async fn issue(
            &self,
            request: &CertificateRequest,
        ) -> Result<CertificateState, BackendError> {
            let mut issued = self.issued.lock().unwrap();
            if issued.contains_key(&request.name) {
                return Err(BackendError::AlreadyExists(request.name.clone()));
            }
            let mut calls = self.calls.lock().unwrap();
            let seen = calls.entry(request.name.clone()).or_insert(0);
            *seen += 1;
            if *seen == 1 && self.slow.iter().any(|s| request.name.ends_with(s.as_str())) {
                return Ok(CertificateState::Pending);
            }
            let bundle = CertificateBundle {
                cert_pem: format!("cert {}", request.name),
                key_pem: format!("key {}", request.name),
                ca_pem: "ca".to_string(),
            };
            issued.insert(request.name.clone(), bundle.clone());
            Ok(CertificateState::Issued(bundle))
        }

        async fn fetch(&self, name: &str) -> Result<Option<CertificateBundle>, BackendError> {
            Ok(self.issued.lock().unwrap().get(name).cloned())
        }

        async fn revoke(&self, name: &str) -> Result<(), BackendError> {
            self.issued.lock().unwrap().remove(name);
            Ok(())
        }
    }

    fn tls_service() -> Service {
        Service {
            metadata: ObjectMeta::named("tlssvc"),
            spec: ServiceSpec {
                tls_cert: Some(TlsCertSpec {
                    contents: vec![CertContent::DnsNames],
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn two_node_set() -> NodeSet {
        let mut spec = NodeSetSpec::default();
        spec.node_template.credential_secret = Some("ssh".to_string());
        spec.nodes.insert("a".to_string(), Default::default());
        spec.nodes.insert("b".to_string(), Default::default());
        NodeSet {
            metadata: ObjectMeta::named("edpm"),
            spec,
            ..Default::default()
        }
    }

    #[test]
    fn test_secret_name_is_a_label() {
        assert_eq!(cert_secret_name("libvirt", "d1", "edpm"), "cert-libvirt-d1-edpm");
        assert!(cert_secret_name("libvirt", "Deploy_1", "edpm").starts_with("cert-libvirt-deploy-1-edpm-"));
        assert!(cert_secret_name(&"s".repeat(80), "d", "n").len() <= 63);
    }

    #[tokio::test]
    async fn test_already_issued_certificate_is_fetched() {
        let store = Arc::new(MemoryStore::new());
        let secrets: Api<Secret> = Api::new(store as Arc<dyn ObjectStore>);
        let issuer = OneShotIssuer {
            slow: vec!["-b".to_string()],
            ..Default::default()
        };
        let deployment = Deployment {
            metadata: ObjectMeta::named("d1"),
            ..Default::default()
        };
        let node_set = two_node_set();
        let service = tls_service();
        let options = CertificateOptions::default();

        let first = ensure_certificates(&issuer, &secrets, &options, &deployment, &node_set, &service)
            .await
            .unwrap();
        let Readiness::Pending(message) = first else {
            panic!("first pass should wait for b");
        };
        assert!(message.ends_with(": b"), "{message}");

        let second = ensure_certificates(&issuer, &secrets, &options, &deployment, &node_set, &service)
            .await
            .unwrap();
        let name = cert_secret_name("tlssvc", "d1", "edpm");
        assert_eq!(second, Readiness::Ready(name.clone()));

        let secret = secrets.get(&name).await.unwrap().unwrap();
        assert_eq!(secret.data["a-tls.crt"], STANDARD.encode("cert tlssvc-d1-edpm-a"));
        assert_eq!(secret.data["b-tls.key"], STANDARD.encode("key tlssvc-d1-edpm-b"));
    }
}
