//! NodeSet reconciler

use std::time::Duration;

use fleet_api::{reasons, types, ConditionStatus, Secret, Severity};
use fleetplane::backends::JobPhase;
use fleetplane::deploy::dispatcher::job_name;
use fleetplane::deploy::inventory::inventory_secret_name;
use fleetplane::reconcile::{Action, NODESET_FINALIZER};
use tokio_test::{assert_err, assert_ok};

use crate::helpers::{deployment_named, node_set_named, ssh_secret, Fixture, CREDENTIALS};

#[tokio::test]
async fn test_missing_credentials_wait() {
    let fixture = Fixture::new();
    fixture.create(node_set_named("edpm", &["svc1"])).await;

    let action = assert_ok!(fixture.reconcile_node_set("edpm").await);
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));

    let node_set = fixture.node_set("edpm").await;
    let conditions = &node_set.status.conditions;
    let input = conditions.get(types::INPUT_READY).unwrap();
    assert_eq!(input.status, ConditionStatus::False);
    assert_eq!(input.reason, reasons::MISSING);
    assert_eq!(input.severity, Severity::Warning);
    assert!(input.message.contains(CREDENTIALS));
    assert!(!conditions.is_true(types::READY));
    assert!(!conditions.is_true(types::SETUP_READY));
    assert!(node_set.status.inventory_secret.is_none());
    assert!(node_set.metadata.has_finalizer(NODESET_FINALIZER));
    assert!(fixture.execution.submitted().is_empty());
}

#[tokio::test]
async fn test_malformed_credentials_fail() {
    let fixture = Fixture::new();
    let mut secret = ssh_secret(CREDENTIALS);
    secret
        .data
        .insert(fleetplane::reconcile::nodeset::SSH_KEY.into(), "not base64!".into());
    fixture.create(secret).await;
    fixture.create(node_set_named("edpm", &[])).await;

    assert_err!(fixture.reconcile_node_set("edpm").await);
    let node_set = fixture.node_set("edpm").await;
    assert!(node_set
        .status
        .conditions
        .get(types::INPUT_READY)
        .unwrap()
        .is_error());
}

#[tokio::test]
async fn test_setup_without_deployment() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;

    let node_set = fixture.node_set("edpm").await;
    let conditions = &node_set.status.conditions;
    for condition in [
        types::INPUT_READY,
        types::ADDRESS_RESERVATION_READY,
        types::NAME_RESOLUTION_READY,
        types::SETUP_READY,
    ] {
        assert!(conditions.is_true(condition), "{condition} should be True");
    }
    let deployed = conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert_eq!(deployed.status, ConditionStatus::False);
    assert_eq!(deployed.reason, reasons::NOT_REQUESTED);

    let ready = conditions.get(types::READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, reasons::NOT_REQUESTED);

    assert!(node_set.status.config_hash.is_some());
    assert_eq!(node_set.status.observed_generation, node_set.metadata.generation);
    let inventory = node_set.status.inventory_secret.clone().unwrap();
    assert!(fixture.api::<Secret>().get(&inventory).await.unwrap().is_some());
}

#[tokio::test]
async fn test_repeated_pass_writes_nothing() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    let before = fixture.node_set("edpm").await;

    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let after = fixture.node_set("edpm").await;

    assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
    assert_eq!(after.status, before.status);
}

#[tokio::test]
async fn test_spec_change_moves_the_fingerprint() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    let mut node_set = fixture.node_set("edpm").await;
    let first = node_set.status.config_hash.clone();

    node_set.spec.node_template.exec.user = Some("cloud-admin".into());
    fixture.ctx.node_sets.replace(&node_set).await.unwrap();
    assert_ok!(fixture.reconcile_node_set("edpm").await);

    let node_set = fixture.node_set("edpm").await;
    assert_ne!(node_set.status.config_hash, first);
    assert_eq!(node_set.status.observed_generation, 2);
}

#[tokio::test]
async fn test_reports_finished_deployment() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    fixture.create(deployment_named("d1", &["edpm"])).await;

    assert_ok!(fixture.reconcile_deployment("d1").await);
    fixture
        .execution
        .set_phase(&job_name("svc1", "d1", Some("edpm")), JobPhase::Succeeded, "");
    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert!(fixture.deployment("d1").await.status.deployed);

    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let node_set = fixture.node_set("edpm").await;
    assert!(node_set.status.conditions.is_true(types::DEPLOYMENT_READY));
    assert!(node_set.status.conditions.is_true(types::READY));
    assert_eq!(node_set.status.deployed_by.as_deref(), Some("d1"));
    assert_eq!(node_set.status.deployed_config_hash, node_set.status.config_hash);

    // Changing the spec afterwards is flagged as drift
    let mut changed = node_set.clone();
    changed.spec.node_template.exec.port = Some(2222);
    fixture.ctx.node_sets.replace(&changed).await.unwrap();
    assert_ok!(fixture.reconcile_node_set("edpm").await);

    let node_set = fixture.node_set("edpm").await;
    let deployed = node_set.status.conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert!(deployed.is_true());
    assert!(deployed.message.contains("new deployment is needed"));
    assert_ne!(node_set.status.deployed_config_hash, node_set.status.config_hash);
}

#[tokio::test]
async fn test_reports_requested_deployment() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    fixture.create(deployment_named("d1", &["edpm"])).await;
    assert_ok!(fixture.reconcile_deployment("d1").await);

    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let node_set = fixture.node_set("edpm").await;
    let deployed = node_set.status.conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert_eq!(deployed.status, ConditionStatus::False);
    assert_eq!(deployed.reason, reasons::REQUESTED);
}

#[tokio::test]
async fn test_deletion_releases_inventory() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    let secret_name = inventory_secret_name("edpm");
    assert!(fixture.api::<Secret>().get(&secret_name).await.unwrap().is_some());

    // The finalizer keeps the object around until cleanup ran
    assert!(fixture.ctx.node_sets.delete("edpm").await.unwrap());
    assert!(fixture.node_set("edpm").await.metadata.is_deleting());

    let action = assert_ok!(fixture.reconcile_node_set("edpm").await);
    assert_eq!(action, Action::await_change());
    assert!(fixture.ctx.node_sets.get("edpm").await.unwrap().is_none());
    assert!(fixture.api::<Secret>().get(&secret_name).await.unwrap().is_none());

    // Later passes find nothing to do
    assert_ok!(fixture.reconcile_node_set("edpm").await);
}

#[tokio::test]
async fn test_latest_deployment_has_the_last_word() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;

    fixture.create(deployment_named("d1", &["edpm"])).await;
    assert_ok!(fixture.reconcile_deployment("d1").await);
    fixture
        .execution
        .set_phase(&job_name("svc1", "d1", Some("edpm")), JobPhase::Succeeded, "");
    assert_ok!(fixture.reconcile_deployment("d1").await);
    assert!(fixture.deployment("d1").await.status.deployed);

    tokio::time::sleep(Duration::from_millis(5)).await;
    fixture.create(deployment_named("d2", &["edpm"])).await;
    assert_ok!(fixture.reconcile_deployment("d2").await);

    // The newer deployment is still running
    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let node_set = fixture.node_set("edpm").await;
    let deployed = node_set.status.conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert_eq!(deployed.reason, reasons::REQUESTED);
    assert!(deployed.message.contains("d2"));
    assert_eq!(node_set.status.deployed_by.as_deref(), Some("d1"));

    fixture
        .execution
        .set_phase(&job_name("svc1", "d2", Some("edpm")), JobPhase::Succeeded, "");
    assert_ok!(fixture.reconcile_deployment("d2").await);
    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let node_set = fixture.node_set("edpm").await;
    assert!(node_set.status.conditions.is_true(types::DEPLOYMENT_READY));
    assert_eq!(node_set.status.deployed_by.as_deref(), Some("d2"));
}

#[tokio::test]
async fn test_unobserved_deployments_order_by_creation() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;

    // Name order is the reverse of creation order
    fixture.create(deployment_named("b-first", &["edpm"])).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    fixture.create(deployment_named("a-second", &["edpm"])).await;

    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let node_set = fixture.node_set("edpm").await;
    let deployed = node_set.status.conditions.get(types::DEPLOYMENT_READY).unwrap();
    assert_eq!(deployed.reason, reasons::REQUESTED);
    assert!(deployed.message.contains("a-second"), "{}", deployed.message);
    assert!(node_set.status.deployed_by.is_none());
}
