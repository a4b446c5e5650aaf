//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::backends::http::HttpExecutionBackend;
use crate::backends::memory::{
    MemoryAddressBackend, MemoryCertificateBackend, MemoryDnsBackend, MemoryExecutionBackend,
};
use crate::backends::{Backends, CertificateBackend, DnsBackend, ExecutionBackend};
use crate::errors::OrchestratorError;
use crate::reconcile::Context;
use crate::store::memory::MemoryStore;
use crate::store::ObjectStore;

/// Main application state
pub struct AppState {
    /// Object store shared by the controllers and the status API
    pub store: Arc<dyn ObjectStore>,

    /// Reconcile context shared by every pass
    pub context: Context,
}

impl AppState {
    /// Build the store and backends described by `options`
    pub fn init(options: &AppOptions) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");

        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let backends = init_backends(options)?;
        let context = Context::new(store.clone(), backends, options.reconcile.clone());

        Ok(Self { store, context })
    }
}

fn init_backends(options: &AppOptions) -> Result<Backends, OrchestratorError> {
    let execution: Arc<dyn ExecutionBackend> = match &options.execution {
        Some(remote) => {
            info!("Submitting jobs to {}", remote.base_url);
            Arc::new(HttpExecutionBackend::new(
                &remote.base_url,
                remote.token.clone(),
                remote.timeout,
            )?)
        }
        None => {
            info!("No job runner configured, jobs complete in memory");
            Arc::new(MemoryExecutionBackend::auto_completing())
        }
    };

    let dns = options.dns_nameservers.as_ref().map(|nameservers| {
        Arc::new(MemoryDnsBackend::new(nameservers.clone())) as Arc<dyn DnsBackend>
    });

    let certificates = options.certificate_pending_polls.map(|polls| {
        Arc::new(MemoryCertificateBackend::new(polls)) as Arc<dyn CertificateBackend>
    });

    Ok(Backends {
        execution,
        addresses: Arc::new(MemoryAddressBackend::new(options.networks.clone())),
        dns,
        certificates,
    })
}
