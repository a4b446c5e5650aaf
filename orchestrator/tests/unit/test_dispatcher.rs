//! Service ordering on one NodeSet

use std::collections::BTreeMap;

use fleet_api::service::DataSource;
use fleet_api::{reasons, types, ConditionLedger, ConditionStatus, ConfigMap, ObjectMeta, Service};
use fleetplane::backends::JobPhase;
use fleetplane::deploy::dispatcher::{job_name, DispatchState, Dispatcher};
use fleetplane::errors::OrchestratorError;
use tokio_test::{assert_err, assert_ok};

use crate::helpers::{deployment_named, service_named, Fixture};

fn dispatcher(fixture: &Fixture) -> Dispatcher<'_> {
    Dispatcher {
        backend: fixture.execution.as_ref(),
        registry: fixture.ctx.registry.as_ref(),
        secrets: &fixture.ctx.secrets,
        config_maps: &fixture.ctx.config_maps,
        defaults: &fixture.ctx.options.defaults,
    }
}

#[tokio::test]
async fn test_pending_service_blocks_the_next() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc-a", "svc-b"]).await;
    let node_set = fixture.node_set("edpm").await;
    let deployment = deployment_named("d1", &["edpm"]);
    let dispatcher = dispatcher(&fixture);

    let mut progress = ConditionLedger::new();
    let report = assert_ok!(
        dispatcher
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    let first = job_name("svc-a", "d1", Some("edpm"));
    assert_eq!(
        report.state,
        DispatchState::Pending {
            service: "svc-a".into(),
            job: first.clone(),
        }
    );
    assert_eq!(fixture.execution.submitted(), vec![first.clone()]);

    // Asking again while the job runs observes it
    let mut progress = ConditionLedger::new();
    let report = assert_ok!(
        dispatcher
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    assert!(report.is_pending());
    assert_eq!(fixture.execution.submitted(), vec![first.clone()]);
    let condition = progress
        .get(&types::service_deployment_ready("svc-a"))
        .unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, reasons::PENDING);
    assert!(progress
        .get(&types::service_deployment_ready("svc-b"))
        .is_none());

    // Once it succeeds the next service is submitted
    assert!(fixture.execution.set_phase(&first, JobPhase::Succeeded, ""));
    let mut progress = ConditionLedger::new();
    assert_ok!(
        dispatcher
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    assert!(progress.is_true(&types::service_deployment_ready("svc-a")));
    assert_eq!(
        fixture.execution.submitted(),
        vec![first, job_name("svc-b", "d1", Some("edpm"))]
    );
}

#[tokio::test]
async fn test_failed_service_stops_the_walk() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc-a", "svc-b", "svc-c"]).await;
    let node_set = fixture.node_set("edpm").await;
    let deployment = deployment_named("d1", &["edpm"]);
    let dispatcher = dispatcher(&fixture);

    let mut progress = ConditionLedger::new();
    assert_ok!(
        dispatcher
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    let first = job_name("svc-a", "d1", Some("edpm"));
    fixture
        .execution
        .set_phase(&first, JobPhase::Failed, "unreachable host");

    for _ in 0..2 {
        let mut progress = ConditionLedger::new();
        let err = assert_err!(
            dispatcher
                .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
                .await
        );
        assert!(matches!(err, OrchestratorError::ExecutionFailed(ref m) if m.contains("unreachable host")));
        assert!(progress
            .get(&types::service_deployment_ready("svc-a"))
            .unwrap()
            .is_error());
    }

    // Never resubmitted, never moved on
    assert_eq!(fixture.execution.submitted(), vec![first]);
}

#[tokio::test]
async fn test_job_carries_inventory_and_credentials() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc-a"]).await;
    let node_set = fixture.node_set("edpm").await;
    let deployment = deployment_named("d1", &["edpm"]);

    let mut progress = ConditionLedger::new();
    assert_ok!(
        dispatcher(&fixture)
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );

    let job = fixture
        .execution
        .job(&job_name("svc-a", "d1", Some("edpm")))
        .unwrap();
    assert_eq!(job.inventory.host_count(), 1);
    assert!(job.mounts.iter().any(|m| m.name == "inventory-edpm"));
    assert!(job
        .mounts
        .iter()
        .any(|m| m.path.starts_with("/runner/env/ssh-keys/")));
    assert_eq!(job.backoff_limit, 6);
}

#[tokio::test]
async fn test_unknown_service_is_a_configuration_error() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &[]).await;
    let mut node_set = fixture.node_set("edpm").await;
    node_set.spec.services = vec!["missing".into()];
    let deployment = deployment_named("d1", &["edpm"]);

    let mut progress = ConditionLedger::new();
    let err = assert_err!(
        dispatcher(&fixture)
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    assert!(matches!(err, OrchestratorError::ConfigurationInvalid(_)));
    assert!(fixture.execution.submitted().is_empty());
}

#[tokio::test]
async fn test_finished_service_ignores_removed_inputs() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1", "svc2"]).await;
    fixture
        .create(ConfigMap {
            metadata: ObjectMeta::named("cm1"),
            data: BTreeMap::from([("key".to_string(), "value".to_string())]),
        })
        .await;
    let mut svc1 = service_named("svc1");
    svc1.spec.data_sources = vec![DataSource {
        config_map: Some("cm1".into()),
        ..Default::default()
    }];
    fixture.api::<Service>().apply(&svc1).await.unwrap();

    let node_set = fixture.node_set("edpm").await;
    let deployment = deployment_named("d1", &["edpm"]);
    let dispatcher = dispatcher(&fixture);

    let mut progress = ConditionLedger::new();
    let report = assert_ok!(
        dispatcher
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    assert!(report.config_map_hashes.contains_key("cm1"));
    let first = job_name("svc1", "d1", Some("edpm"));
    assert!(fixture
        .execution
        .job(&first)
        .unwrap()
        .mounts
        .iter()
        .any(|m| m.name == "cm1"));

    fixture.execution.set_phase(&first, JobPhase::Succeeded, "");
    fixture.api::<ConfigMap>().delete("cm1").await.unwrap();

    let mut progress = ConditionLedger::new();
    let report = assert_ok!(
        dispatcher
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    assert!(progress.is_true(&types::service_deployment_ready("svc1")));
    assert!(report.config_map_hashes.is_empty());
    assert_eq!(
        fixture.execution.submitted(),
        vec![first, job_name("svc2", "d1", Some("edpm"))]
    );
}

#[tokio::test]
async fn test_missing_input_blocks_submission() {
    let fixture = Fixture::new();
    fixture.seed(&["edpm"], &["svc1"]).await;
    let mut svc1 = service_named("svc1");
    svc1.spec.data_sources = vec![DataSource {
        config_map: Some("cm1".into()),
        ..Default::default()
    }];
    fixture.api::<Service>().apply(&svc1).await.unwrap();
    let node_set = fixture.node_set("edpm").await;
    let deployment = deployment_named("d1", &["edpm"]);

    let mut progress = ConditionLedger::new();
    let err = assert_err!(
        dispatcher(&fixture)
            .deploy(&deployment, &node_set, &[node_set.clone()], &mut progress)
            .await
    );
    assert!(matches!(err, OrchestratorError::ConfigurationInvalid(ref m) if m.contains("cm1")));
    assert!(fixture.execution.submitted().is_empty());
}
