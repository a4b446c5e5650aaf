//! Address reservation, name publication and network inventory vars

use std::net::IpAddr;
use std::time::Duration;

use fleet_api::{reasons, types, ConditionStatus, Resource, Secret, VarValue};
use fleetplane::deploy::inventory::Inventory;
use fleetplane::reconcile::Action;
use tokio_test::assert_ok;

use crate::helpers::{networked_node_set, ssh_secret, Fixture, CREDENTIALS, NAMESERVER};

const NODE: &str = "edpm-compute-0";

async fn networked_fixture() -> Fixture {
    let fixture = Fixture::networked();
    fixture.create(ssh_secret(CREDENTIALS)).await;
    fixture.create(networked_node_set("edpm", &[])).await;
    fixture
}

#[tokio::test]
async fn test_pending_reservation_waits() {
    let fixture = networked_fixture().await;
    fixture.addresses.hold("ctlplane", true);

    let action = assert_ok!(fixture.reconcile_node_set("edpm").await);
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));

    let node_set = fixture.node_set("edpm").await;
    let conditions = &node_set.status.conditions;
    assert!(conditions.is_true(types::INPUT_READY));
    let reserved = conditions.get(types::ADDRESS_RESERVATION_READY).unwrap();
    assert_eq!(reserved.status, ConditionStatus::False);
    assert_eq!(reserved.reason, reasons::PENDING);
    assert!(reserved.message.contains(&format!("{NODE}/ctlplane")));
    assert!(!conditions.is_true(types::SETUP_READY));
    assert!(node_set.status.inventory_secret.is_none());

    // Released by the backend, the next pass completes setup
    fixture.addresses.hold("ctlplane", false);
    let action = assert_ok!(fixture.reconcile_node_set("edpm").await);
    assert_eq!(action, Action::await_change());
    let node_set = fixture.node_set("edpm").await;
    assert!(node_set
        .status
        .conditions
        .is_true(types::ADDRESS_RESERVATION_READY));
    assert!(node_set.status.conditions.is_true(types::SETUP_READY));
}

#[tokio::test]
async fn test_names_are_published() {
    let fixture = networked_fixture().await;
    assert_ok!(fixture.reconcile_node_set("edpm").await);

    let node_set = fixture.node_set("edpm").await;
    let address: IpAddr = "192.168.122.100".parse().unwrap();
    assert_eq!(node_set.status.all_ips[NODE]["ctlplane"], address);
    assert_eq!(
        node_set.status.all_hostnames[NODE]["ctlplane"],
        "edpm-compute-0.ctlplane.example.com"
    );
    assert_eq!(
        node_set.status.dns_nameservers,
        vec![NAMESERVER.parse::<IpAddr>().unwrap()]
    );
    let resolved = node_set
        .status
        .conditions
        .get(types::NAME_RESOLUTION_READY)
        .unwrap();
    assert!(resolved.is_true());
    assert!(resolved.message.contains("1 names published"));

    let dns = fixture.dns.as_ref().unwrap();
    let records = dns.records(&node_set.owner_reference());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, address);
    assert_eq!(fixture.addresses.reservations(&node_set.owner_reference()).len(), 1);
}

#[tokio::test]
async fn test_inventory_carries_network_vars() {
    let fixture = networked_fixture().await;
    assert_ok!(fixture.reconcile_node_set("edpm").await);

    let node_set = fixture.node_set("edpm").await;
    let secret_name = node_set.status.inventory_secret.clone().unwrap();
    let secret = fixture.api::<Secret>().get(&secret_name).await.unwrap().unwrap();
    let inventory = Inventory::from_secret(&secret).unwrap();

    let host = &inventory.groups["edpm"].hosts[NODE];
    assert_eq!(host["ctlplane_ip"], VarValue::from("192.168.122.100"));
    assert_eq!(host["ctlplane_gateway_ip"], VarValue::from("192.168.122.1"));
    assert_eq!(host["ansible_host"], VarValue::from("192.168.122.100"));
    assert_eq!(
        host["canonical_hostname"],
        VarValue::from("edpm-compute-0.ctlplane.example.com")
    );
    assert_eq!(
        host["dns_servers"],
        VarValue::from(vec![VarValue::from(NAMESERVER)])
    );
}

#[tokio::test]
async fn test_deletion_releases_addresses_and_records() {
    let fixture = networked_fixture().await;
    assert_ok!(fixture.reconcile_node_set("edpm").await);
    let owner = fixture.node_set("edpm").await.owner_reference();

    assert!(fixture.ctx.node_sets.delete("edpm").await.unwrap());
    assert_ok!(fixture.reconcile_node_set("edpm").await);

    assert!(fixture.addresses.reservations(&owner).is_empty());
    assert!(fixture.dns.as_ref().unwrap().records(&owner).is_empty());
}
