//! Server state

use std::sync::Arc;

use crate::store::ObjectStore;

/// Server state shared across handlers
pub struct ServerState {
    pub store: Arc<dyn ObjectStore>,
}

impl ServerState {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}
