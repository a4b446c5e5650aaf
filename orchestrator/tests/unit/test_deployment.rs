//! Deployment reconciler

use std::time::Duration;

use fleet_api::service::{CertContent, TlsCertSpec};
use fleet_api::{reasons, types, ConditionStatus, Secret, Severity};
use fleetplane::backends::{JobPhase, MountSource};
use fleetplane::deploy::dispatcher::job_name;
use fleetplane::errors::OrchestratorError;
use fleetplane::prereqs::certs::cert_secret_name;
use fleetplane::reconcile::{Action, DEPLOYMENT_FINALIZER};
use tokio_test::{assert_err, assert_ok};

use crate::helpers::{
    deployment_named, networked_node_set, node_set_named, service_named, ssh_secret, Fixture,
    CREDENTIALS,
};

fn requeue() -> Action {
    Action::requeue(Duration::from_secs(15))
}

#[tokio::test]
async fn test_waits_for_node_set_setup() {
    let fixture = Fixture::new();
    // No credentials: the NodeSet cannot finish setup
    fixture.create(node_set_named("edpm", &["svc1"])).await;
    assert_ok!(fixture.reconcile_node_set("edpm").await);
    fixture.create(deployment_named("d1", &["edpm"])).await;

    let action = assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_eq!(action, requeue());

    let deployment = fixture.deployment("d1").await;
    let input = deployment.status.conditions.get(types::INPUT_READY).unwrap();
    assert_eq!(input.status, ConditionStatus::False);
    assert_eq!(input.reason, reasons::WAITING);
    assert!(!deployment.status.deployed);
    assert!(deployment.metadata.has_finalizer(DEPLOYMENT_FINALIZER));
    assert!(fixture.execution.submitted().is_empty());

    // Credentials show up, setup finishes, dispatch starts
    fixture.create(ssh_secret(CREDENTIALS)).await;
    fixture.create(service_named("svc1")).await;
    assert_ok!(fixture.reconcile_node_set("edpm").await);
    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_eq!(
        fixture.execution.submitted(),
        vec![job_name("svc1", "d1", Some("edpm"))]
    );
}

#[tokio::test]
async fn test_missing_node_set_waits() {
    let fixture = Fixture::new();
    fixture.create(deployment_named("d1", &["absent"])).await;

    let action = assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_eq!(action, requeue());
    let input = fixture
        .deployment("d1")
        .await
        .status
        .conditions
        .get(types::INPUT_READY)
        .cloned()
        .unwrap();
    assert_eq!(input.reason, reasons::MISSING);
    assert_eq!(input.severity, Severity::Warning);
}

#[tokio::test]
async fn test_no_node_sets_is_invalid() {
    let fixture = Fixture::new();
    fixture.create(deployment_named("d1", &[])).await;

    let err = assert_err!(fixture.reconcile_deployment("d1").await);
    assert!(matches!(err, OrchestratorError::ConfigurationInvalid(_)));
    let deployment = fixture.deployment("d1").await;
    assert!(deployment
        .status
        .conditions
        .get(types::INPUT_READY)
        .unwrap()
        .is_error());
}

#[tokio::test]
async fn test_partial_progress_is_pending() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1", "svc2"]).await;
    fixture.create(deployment_named("d1", &["edpm"])).await;

    assert_eq!(assert_ok!(fixture.reconcile_deployment("d1").await), requeue());
    fixture
        .execution
        .set_phase(&job_name("svc1", "d1", Some("edpm")), JobPhase::Succeeded, "");
    assert_eq!(assert_ok!(fixture.reconcile_deployment("d1").await), requeue());

    let deployment = fixture.deployment("d1").await;
    assert!(!deployment.status.deployed);
    assert!(deployment.status.conditions.is_true(types::INPUT_READY));

    let deployed = deployment.status.conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert_eq!(deployed.status, ConditionStatus::False);
    assert_eq!(deployed.reason, reasons::PENDING);

    let group = &deployment.status.node_set_conditions["edpm"];
    assert!(group.is_true(&types::service_deployment_ready("svc1")));
    let pending = group.get(types::DEPLOYMENT_READY).unwrap();
    assert_eq!(pending.reason, reasons::PENDING);
    assert!(pending.message.contains("svc2"));
    assert!(!group.is_true(types::READY));

    assert_eq!(
        fixture.execution.submitted(),
        vec![
            job_name("svc1", "d1", Some("edpm")),
            job_name("svc2", "d1", Some("edpm")),
        ]
    );
}

#[tokio::test]
async fn test_completes_once() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1", "svc2"]).await;
    fixture.create(deployment_named("d1", &["edpm"])).await;

    for service in ["svc1", "svc2"] {
        assert_ok!(fixture.reconcile_deployment("d1").await);
        fixture
            .execution
            .set_phase(&job_name(service, "d1", Some("edpm")), JobPhase::Succeeded, "");
    }
    let action = assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_eq!(action, Action::await_change());

    let deployment = fixture.deployment("d1").await;
    assert!(deployment.status.deployed);
    assert!(deployment.status.conditions.is_true(types::READY));
    assert!(deployment.status.node_set_conditions["edpm"].is_true(types::READY));
    let node_set = fixture.node_set("edpm").await;
    assert_eq!(
        deployment.status.node_set_hashes.get("edpm"),
        node_set.status.config_hash.as_ref()
    );

    // A finished deployment is never acted on again
    let submitted = fixture.execution.submitted();
    for _ in 0..3 {
        assert_eq!(
            assert_ok!(fixture.reconcile_deployment("d1").await),
            Action::await_change()
        );
    }
    assert_eq!(fixture.execution.submitted(), submitted);
    assert_eq!(
        fixture.deployment("d1").await.metadata.resource_version,
        deployment.metadata.resource_version
    );
}

#[tokio::test]
async fn test_repeated_pending_pass_is_stable() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    fixture.create(deployment_named("d1", &["edpm"])).await;

    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_ok!(fixture.reconcile_deployment("d1").await);
    let before = fixture.deployment("d1").await;

    assert_ok!(fixture.reconcile_deployment("d1").await);
    let after = fixture.deployment("d1").await;

    assert_eq!(fixture.execution.submitted().len(), 1);
    assert_eq!(after.status, before.status);
    assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
}

#[tokio::test]
async fn test_failed_group_names_itself() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm-a", "edpm-b"], &["svc1"]).await;
    fixture
        .create(deployment_named("d1", &["edpm-a", "edpm-b"]))
        .await;

    assert_ok!(fixture.reconcile_deployment("d1").await);
    let job_a = job_name("svc1", "d1", Some("edpm-a"));
    let job_b = job_name("svc1", "d1", Some("edpm-b"));
    assert_eq!(fixture.execution.submitted(), vec![job_a.clone(), job_b.clone()]);

    fixture.execution.set_phase(&job_a, JobPhase::Succeeded, "");
    fixture
        .execution
        .set_phase(&job_b, JobPhase::Failed, "task failed on edpm-b-compute-0");

    let err = assert_err!(fixture.reconcile_deployment("d1").await);
    assert!(matches!(err, OrchestratorError::ExecutionFailed(_)));
    assert!(err.to_string().contains("edpm-b"));

    let deployment = fixture.deployment("d1").await;
    assert!(!deployment.status.deployed);
    assert!(deployment.status.conditions.get(types::DEPLOYMENT_READY).unwrap().is_error());
    assert!(deployment.status.node_set_conditions["edpm-a"].is_true(types::DEPLOYMENT_READY));
    assert!(deployment.status.node_set_conditions["edpm-b"]
        .get(types::DEPLOYMENT_READY)
        .unwrap()
        .is_error());
    assert!(deployment.failed_for("edpm-b"));
    assert!(!deployment.failed_for("edpm-a"));

    // Both NodeSets see the outcome that concerns them
    assert_ok!(fixture.reconcile_node_set("edpm-b").await);
    let failed = fixture.node_set("edpm-b").await;
    let condition = failed.status.conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert!(condition.is_error());
    assert!(condition.message.contains("task failed"));

    assert_ok!(fixture.reconcile_node_set("edpm-a").await);
    let requested = fixture.node_set("edpm-a").await;
    assert_eq!(
        requested
            .status
            .conditions
            .get(types::DEPLOYMENT_READY)
            .unwrap()
            .reason,
        reasons::REQUESTED
    );

    // The failed job is not resubmitted
    assert_err!(fixture.reconcile_deployment("d1").await);
    assert_eq!(fixture.execution.submitted().len(), 2);
}

#[tokio::test]
async fn test_services_override_replaces_node_set_list() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1", "svc2"]).await;
    let mut deployment = deployment_named("d1", &["edpm"]);
    deployment.spec.services_override = Some(vec!["svc2".into()]);
    fixture.create(deployment).await;

    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_eq!(
        fixture.execution.submitted(),
        vec![job_name("svc2", "d1", Some("edpm"))]
    );
}

#[tokio::test]
async fn test_deletion_drops_finalizer() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    fixture.create(deployment_named("d1", &["edpm"])).await;
    assert_ok!(fixture.reconcile_deployment("d1").await);

    assert!(fixture.ctx.deployments.delete("d1").await.unwrap());
    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert!(fixture.ctx.deployments.get("d1").await.unwrap().is_none());
}

/// A TLS-enabled NodeSet running one service that needs certificates
async fn tls_fixture(ca_certs: Option<&str>) -> Fixture {
    let fixture = Fixture::networked();
    fixture.create(ssh_secret(CREDENTIALS)).await;
    let mut service = service_named("tlssvc");
    service.spec.tls_cert = Some(TlsCertSpec {
        contents: vec![CertContent::DnsNames, CertContent::IpAddresses],
        ..Default::default()
    });
    service.spec.ca_certs = ca_certs.map(str::to_string);
    fixture.create(service).await;

    let mut node_set = networked_node_set("edpm", &["tlssvc"]);
    node_set.spec.tls_enabled = true;
    fixture.create(node_set).await;
    assert_ok!(fixture.reconcile_node_set("edpm").await);
    fixture.create(deployment_named("d1", &["edpm"])).await;
    fixture
}

#[tokio::test]
async fn test_pending_certificates_hold_dispatch() {
    let fixture = tls_fixture(None).await;

    let action = assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_eq!(action, Action::requeue(Duration::from_secs(5)));

    let deployment = fixture.deployment("d1").await;
    let input = deployment.status.conditions.get(types::INPUT_READY).unwrap();
    assert_eq!(input.status, ConditionStatus::False);
    assert_eq!(input.reason, reasons::PENDING);
    assert!(input.message.contains("edpm-compute-0"));
    assert!(fixture.execution.submitted().is_empty());
    assert!(fixture.certificates.as_ref().unwrap().issued().is_empty());

    // Issued on the next poll; the bundle is stored and dispatch starts
    assert_eq!(assert_ok!(fixture.reconcile_deployment("d1").await), requeue());
    assert_eq!(fixture.certificates.as_ref().unwrap().issued().len(), 1);
    assert!(fixture
        .deployment("d1")
        .await
        .status
        .conditions
        .is_true(types::INPUT_READY));

    let bundle = cert_secret_name("tlssvc", "d1", "edpm");
    let secret = fixture.api::<Secret>().get(&bundle).await.unwrap().unwrap();
    for key in ["tls.crt", "tls.key", "ca.crt"] {
        assert!(secret.data.contains_key(&format!("edpm-compute-0-{key}")), "{key}");
    }
    assert_eq!(
        fixture.execution.submitted(),
        vec![job_name("tlssvc", "d1", Some("edpm"))]
    );
}

#[tokio::test]
async fn test_job_mounts_certificates() {
    let fixture = tls_fixture(Some("combined-ca-bundle")).await;
    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_ok!(fixture.reconcile_deployment("d1").await);

    let job = fixture
        .execution
        .job(&job_name("tlssvc", "d1", Some("edpm")))
        .unwrap();
    let certs = job.mounts.iter().find(|m| m.name == "certs-edpm").unwrap();
    assert_eq!(
        certs.source,
        MountSource::Secret(cert_secret_name("tlssvc", "d1", "edpm"))
    );
    let ca = job.mounts.iter().find(|m| m.name == "cacerts-tlssvc").unwrap();
    assert_eq!(ca.source, MountSource::Secret("combined-ca-bundle".into()));
}

#[tokio::test]
async fn test_deletion_revokes_certificates() {
    let fixture = tls_fixture(None).await;
    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert_ok!(fixture.reconcile_deployment("d1").await);
    let bundle = cert_secret_name("tlssvc", "d1", "edpm");
    assert!(fixture.api::<Secret>().get(&bundle).await.unwrap().is_some());

    assert!(fixture.ctx.deployments.delete("d1").await.unwrap());
    assert_ok!(fixture.reconcile_deployment("d1").await);

    assert!(fixture.api::<Secret>().get(&bundle).await.unwrap().is_none());
    assert!(fixture.certificates.as_ref().unwrap().issued().is_empty());
}
