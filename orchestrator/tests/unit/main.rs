//! Reconciler tests against the in-memory store and backends

mod helpers;
mod test_deployment;
mod test_dispatcher;
mod test_networks;
mod test_nodeset;
