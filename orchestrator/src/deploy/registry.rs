//! Service registry lookup

use async_trait::async_trait;
use fleet_api::Service;

use crate::errors::OrchestratorError;
use crate::store::Api;

/// Resolves a service name to its recipe
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Fails with `ConfigurationInvalid` when `name` is not registered
    async fn resolve(&self, name: &str) -> Result<Service, OrchestratorError>;
}

/// Registry backed by the `Service` objects in the store
#[derive(Clone)]
pub struct StoreRegistry {
    services: Api<Service>,
}

impl StoreRegistry {
    pub fn new(services: Api<Service>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ServiceRegistry for StoreRegistry {
    async fn resolve(&self, name: &str) -> Result<Service, OrchestratorError> {
        self.services.get(name).await?.ok_or_else(|| {
            OrchestratorError::ConfigurationInvalid(format!("service {} is not registered", name))
        })
    }
}
