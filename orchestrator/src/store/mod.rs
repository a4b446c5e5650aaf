//! Typed object store
//!
//! The control plane that persists and watches resources is an external
//! collaborator. This module defines its contract:
//!
//! - [`ObjectStore`]: object-safe CRUD + watch over untyped [`RawObject`]s
//! - [`Api`]: typed access for any [`Resource`] through serde conversion
//! - [`memory::MemoryStore`]: the in-process implementation
//!
//! Writes use optimistic concurrency: a `replace` carrying a stale
//! `resource_version` fails with [`StoreError::Conflict`].

pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_api::{ObjectMeta, Resource};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid object: {0}")]
    Invalid(String),
}

/// An object as the store sees it: metadata plus an opaque body
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Everything except `metadata`, typically `spec` and `status`
    pub body: Value,
}

/// What happened to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Applied,
    Deleted,
}

/// Change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: String,
    pub name: String,
    pub action: WatchAction,
}

/// Storage contract for declarative resources
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &str, name: &str) -> Result<Option<RawObject>, StoreError>;

    async fn list(&self, kind: &str) -> Result<Vec<RawObject>, StoreError>;

    /// Fails with `AlreadyExists` when the name is taken
    async fn create(&self, object: RawObject) -> Result<RawObject, StoreError>;

    /// Fails with `Conflict` when `metadata.resource_version` is stale.
    /// Clearing the last finalizer of a deleting object removes it.
    async fn replace(&self, object: RawObject) -> Result<RawObject, StoreError>;

    /// Marks the object as deleting while finalizers remain, removes it otherwise.
    /// Returns false when the object did not exist.
    async fn delete(&self, kind: &str, name: &str) -> Result<bool, StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Typed handle over one resource kind
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<K>, StoreError> {
        self.store
            .get(K::KIND, name)
            .await?
            .map(from_raw)
            .transpose()
    }

    pub async fn list(&self) -> Result<Vec<K>, StoreError> {
        self.store
            .list(K::KIND)
            .await?
            .into_iter()
            .map(from_raw)
            .collect()
    }

    pub async fn create(&self, object: &K) -> Result<K, StoreError> {
        from_raw(self.store.create(to_raw(object)?).await?)
    }

    pub async fn replace(&self, object: &K) -> Result<K, StoreError> {
        from_raw(self.store.replace(to_raw(object)?).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.store.delete(K::KIND, name).await
    }

    /// Create, or overwrite whatever is stored under the same name.
    ///
    /// Used for artifacts the caller fully owns; skips the write when nothing changed.
    pub async fn apply(&self, object: &K) -> Result<K, StoreError> {
        match self.store.get(K::KIND, object.name()).await? {
            None => match self.create(object).await {
                Err(StoreError::AlreadyExists { .. }) => Err(StoreError::Conflict {
                    kind: K::KIND.to_string(),
                    name: object.name().to_string(),
                }),
                other => other,
            },
            Some(existing) => {
                let desired = to_raw(object)?;
                if existing.body == desired.body
                    && existing.metadata.owner_references == desired.metadata.owner_references
                    && existing.metadata.labels == desired.metadata.labels
                    && existing.metadata.annotations == desired.metadata.annotations
                {
                    return from_raw(existing);
                }
                let mut next = desired;
                next.metadata.resource_version = existing.metadata.resource_version;
                next.metadata.finalizers = existing.metadata.finalizers;
                from_raw(self.store.replace(next).await?)
            }
        }
    }
}

/// Split a typed resource into metadata and body
pub fn to_raw<K: Resource>(object: &K) -> Result<RawObject, StoreError> {
    let mut body = serde_json::to_value(object)?;
    match body.as_object_mut() {
        Some(map) => {
            map.remove("metadata");
        }
        None => {
            return Err(StoreError::Invalid(format!(
                "{} {} does not serialize to an object",
                K::KIND,
                object.name()
            )))
        }
    }
    Ok(RawObject {
        kind: K::KIND.to_string(),
        metadata: object.meta().clone(),
        body,
    })
}

/// Reassemble a typed resource
pub fn from_raw<K: Resource>(raw: RawObject) -> Result<K, StoreError> {
    let RawObject {
        kind,
        metadata,
        mut body,
    } = raw;
    if kind != K::KIND {
        return Err(StoreError::Invalid(format!(
            "expected kind {}, got {kind}",
            K::KIND
        )));
    }
    match body.as_object_mut() {
        Some(map) => {
            map.insert("metadata".to_string(), serde_json::to_value(&metadata)?);
        }
        None => {
            return Err(StoreError::Invalid(format!(
                "{kind} {} has a non-object body",
                metadata.name
            )))
        }
    }
    Ok(serde_json::from_value(body)?)
}
