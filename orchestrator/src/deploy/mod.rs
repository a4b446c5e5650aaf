//! Deployment engine: drift detection, inventory rendering, service lookup
//! and job dispatch.

pub mod dispatcher;
pub mod fingerprint;
pub mod inventory;
pub mod registry;

pub const LABEL_DEPLOYMENT: &str = "fleetplane.io/deployment";
pub const LABEL_NODESET: &str = "fleetplane.io/nodeset";
pub const LABEL_SERVICE: &str = "fleetplane.io/service";

/// Process-wide execution defaults, read once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDefaults {
    pub runner_image: String,
    pub service_account: String,
    pub backoff_limit: u32,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            runner_image: "quay.io/fleetplane/runner:latest".to_string(),
            service_account: "fleetplane-runner".to_string(),
            backoff_limit: 6,
        }
    }
}
