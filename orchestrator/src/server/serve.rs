//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{routing::get, Router};
use fleet_api::{ConfigMap, Deployment, NodeSet, Resource, Secret, Service};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::OrchestratorError;
use crate::server::handlers::{
    delete_handler, get_handler, health_handler, list_handler, put_handler, version_handler,
};
use crate::server::state::ServerState;

/// Collection and item routes for one kind under `prefix`
fn object_routes<K: Resource>(router: Router<Arc<ServerState>>, prefix: &str) -> Router<Arc<ServerState>> {
    router
        .route(prefix, get(list_handler::<K>))
        .route(
            &format!("{prefix}/{{name}}"),
            get(get_handler::<K>)
                .put(put_handler::<K>)
                .delete(delete_handler::<K>),
        )
}

/// Build the status API router
pub fn router(state: Arc<ServerState>) -> Router {
    let router = Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler));

    let router = object_routes::<NodeSet>(router, "/nodesets");
    let router = object_routes::<Deployment>(router, "/deployments");
    let router = object_routes::<Service>(router, "/services");
    let router = object_routes::<Secret>(router, "/secrets");
    let router = object_routes::<ConfigMap>(router, "/configmaps");

    router
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), OrchestratorError>>, OrchestratorError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting status API on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| OrchestratorError::ServerError(e.to_string()))
    });

    Ok(handle)
}
