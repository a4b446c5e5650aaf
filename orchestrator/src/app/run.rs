//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use fleet_api::{Deployment, NodeSet};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::OrchestratorError;
use crate::reconcile::{deployment, nodeset, Context};
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::store::Api;
use crate::workers::{controller, watcher};

/// Run the orchestrator until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), OrchestratorError> {
    info!("Initializing fleetplane...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start fleetplane: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), OrchestratorError> {
    let app_state = Arc::new(AppState::init(options)?);

    let (node_sets_tx, node_sets_rx) = mpsc::unbounded_channel();
    let (deployments_tx, deployments_rx) = mpsc::unbounded_channel();

    // Controllers first so the watcher's initial resync has somewhere to go
    init_nodeset_controller(
        options.nodeset_controller.clone(),
        app_state.context.clone(),
        node_sets_rx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_deployment_controller(
        options.deployment_controller.clone(),
        app_state.context.clone(),
        deployments_rx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_watcher(
        app_state.clone(),
        watcher::Targets {
            node_sets: node_sets_tx,
            deployments: deployments_tx,
        },
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_status_server {
        init_status_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_nodeset_controller(
    options: controller::Options,
    context: Context,
    names: mpsc::UnboundedReceiver<String>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), OrchestratorError> {
    info!("Initializing NodeSet controller...");

    let handle = tokio::spawn(async move {
        controller::run(
            &options,
            names,
            move |name: String| {
                let context = context.clone();
                async move { nodeset::reconcile(&context, &name).await }
            },
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_nodeset_controller_handle(handle)
}

fn init_deployment_controller(
    options: controller::Options,
    context: Context,
    names: mpsc::UnboundedReceiver<String>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), OrchestratorError> {
    info!("Initializing Deployment controller...");

    let handle = tokio::spawn(async move {
        controller::run(
            &options,
            names,
            move |name: String| {
                let context = context.clone();
                async move { deployment::reconcile(&context, &name).await }
            },
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployment_controller_handle(handle)
}

fn init_watcher(
    app_state: Arc<AppState>,
    targets: watcher::Targets,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), OrchestratorError> {
    info!("Initializing store watcher...");

    let events = app_state.store.watch();
    let node_sets: Api<NodeSet> = Api::new(app_state.store.clone());
    let deployments: Api<Deployment> = Api::new(app_state.store.clone());

    let handle = tokio::spawn(async move {
        watcher::run(
            events,
            node_sets,
            deployments,
            targets,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_watcher_handle(handle)
}

async fn init_status_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), OrchestratorError> {
    info!("Initializing status API...");

    let server_state = ServerState::new(app_state.store.clone());
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_status_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    watcher_handle: Option<JoinHandle<()>>,
    nodeset_controller_handle: Option<JoinHandle<()>>,
    deployment_controller_handle: Option<JoinHandle<()>>,
    status_server_handle: Option<JoinHandle<Result<(), OrchestratorError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            watcher_handle: None,
            nodeset_controller_handle: None,
            deployment_controller_handle: None,
            status_server_handle: None,
        }
    }

    pub fn with_watcher_handle(&mut self, handle: JoinHandle<()>) -> Result<(), OrchestratorError> {
        if self.watcher_handle.is_some() {
            return Err(OrchestratorError::ShutdownError("watcher_handle already set".to_string()));
        }
        self.watcher_handle = Some(handle);
        Ok(())
    }

    pub fn with_nodeset_controller_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), OrchestratorError> {
        if self.nodeset_controller_handle.is_some() {
            return Err(OrchestratorError::ShutdownError(
                "nodeset_controller_handle already set".to_string(),
            ));
        }
        self.nodeset_controller_handle = Some(handle);
        Ok(())
    }

    pub fn with_deployment_controller_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), OrchestratorError> {
        if self.deployment_controller_handle.is_some() {
            return Err(OrchestratorError::ShutdownError(
                "deployment_controller_handle already set".to_string(),
            ));
        }
        self.deployment_controller_handle = Some(handle);
        Ok(())
    }

    pub fn with_status_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), OrchestratorError>>,
    ) -> Result<(), OrchestratorError> {
        if self.status_server_handle.is_some() {
            return Err(OrchestratorError::ShutdownError("server_handle already set".to_string()));
        }
        self.status_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), OrchestratorError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), OrchestratorError> {
        info!("Shutting down fleetplane...");

        // 1. Stop feeding the controllers
        if let Some(handle) = self.watcher_handle.take() {
            handle.await.map_err(|e| OrchestratorError::ShutdownError(e.to_string()))?;
        }

        // 2. Let in-flight passes finish
        if let Some(handle) = self.nodeset_controller_handle.take() {
            handle.await.map_err(|e| OrchestratorError::ShutdownError(e.to_string()))?;
        }
        if let Some(handle) = self.deployment_controller_handle.take() {
            handle.await.map_err(|e| OrchestratorError::ShutdownError(e.to_string()))?;
        }

        // 3. Status API
        if let Some(handle) = self.status_server_handle.take() {
            handle.await.map_err(|e| OrchestratorError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
