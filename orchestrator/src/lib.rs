//! fleetplane library
//!
//! Reconciliation engine for declarative fleet deployments: NodeSets are
//! prepared (addresses, names, inventory), Deployments dispatch their
//! services as ordered jobs, and both report progress through condition
//! ledgers.

pub mod app;
pub mod backends;
pub mod deploy;
pub mod errors;
pub mod logs;
pub mod prereqs;
pub mod reconcile;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
