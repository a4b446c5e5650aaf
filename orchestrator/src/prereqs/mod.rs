//! Prerequisite provisioners
//!
//! Three independent, idempotent steps gate every deployment:
//!
//! - [`ipam`]: address reservation per (node, network)
//! - [`dns`]: name-resolution records per reserved address
//! - [`certs`]: TLS material per (deployment, node set, service)
//!
//! A step either finishes, reports [`Readiness::Pending`], or fails. Pending is
//! never an error; callers record it as condition state and requeue.

pub mod certs;
pub mod dns;
pub mod ipam;

/// Outcome of a provisioning step that may still be in progress
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness<T> {
    Ready(T),
    /// Human readable description of what is still outstanding
    Pending(String),
}

impl<T> Readiness<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }
}
