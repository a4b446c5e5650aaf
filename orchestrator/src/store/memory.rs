//! In-memory object store
//!
//! Keeps every object in a single map guarded by a lock and broadcasts a
//! [`WatchEvent`] for each write. Used by the daemon for local runs and by tests.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{ObjectStore, RawObject, StoreError, WatchAction, WatchEvent};

const WATCH_CAPACITY: usize = 1024;

type Key = (String, String);

/// In-memory store
pub struct MemoryStore {
    objects: RwLock<HashMap<Key, RawObject>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("object map lock poisoned".to_string())
}

fn key(kind: &str, name: &str) -> Key {
    (kind.to_string(), name.to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.objects
            .read()
            .map(|objects| objects.keys().filter(|(k, _)| k == kind).count())
            .unwrap_or(0)
    }

    fn notify(&self, kind: &str, name: &str, action: WatchAction) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(WatchEvent {
            kind: kind.to_string(),
            name: name.to_string(),
            action,
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &str, name: &str) -> Result<Option<RawObject>, StoreError> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.get(&key(kind, name)).cloned())
    }

    async fn list(&self, kind: &str) -> Result<Vec<RawObject>, StoreError> {
        let objects = self.objects.read().map_err(poison_err)?;
        let mut listed: Vec<RawObject> = objects
            .values()
            .filter(|o| o.kind == kind)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(listed)
    }

    async fn create(&self, mut object: RawObject) -> Result<RawObject, StoreError> {
        if object.metadata.name.is_empty() {
            return Err(StoreError::Invalid(format!("{} without a name", object.kind)));
        }

        {
            let mut objects = self.objects.write().map_err(poison_err)?;
            let k = key(&object.kind, &object.metadata.name);
            if objects.contains_key(&k) {
                return Err(StoreError::AlreadyExists {
                    kind: object.kind,
                    name: object.metadata.name,
                });
            }

            object.metadata.uid = Uuid::new_v4().to_string();
            object.metadata.resource_version = 1;
            object.metadata.generation = 1;
            object.metadata.creation_timestamp = Some(Utc::now());
            object.metadata.deletion_timestamp = None;
            objects.insert(k, object.clone());
        }

        debug!("created {} {}", object.kind, object.metadata.name);
        self.notify(&object.kind, &object.metadata.name, WatchAction::Applied);
        Ok(object)
    }

    async fn replace(&self, mut object: RawObject) -> Result<RawObject, StoreError> {
        let removed = {
            let mut objects = self.objects.write().map_err(poison_err)?;
            let k = key(&object.kind, &object.metadata.name);
            let Some(existing) = objects.get(&k) else {
                return Err(StoreError::NotFound {
                    kind: object.kind,
                    name: object.metadata.name,
                });
            };

            if existing.metadata.resource_version != object.metadata.resource_version {
                return Err(StoreError::Conflict {
                    kind: object.kind,
                    name: object.metadata.name,
                });
            }

            let spec_changed = existing.body.get("spec") != object.body.get("spec");
            object.metadata.uid = existing.metadata.uid.clone();
            object.metadata.creation_timestamp = existing.metadata.creation_timestamp;
            object.metadata.deletion_timestamp = existing.metadata.deletion_timestamp;
            object.metadata.resource_version = existing.metadata.resource_version + 1;
            object.metadata.generation = if spec_changed {
                existing.metadata.generation + 1
            } else {
                existing.metadata.generation
            };

            if object.metadata.is_deleting() && object.metadata.finalizers.is_empty() {
                objects.remove(&k);
                true
            } else {
                objects.insert(k, object.clone());
                false
            }
        };

        let action = if removed {
            debug!("finalized {} {}", object.kind, object.metadata.name);
            WatchAction::Deleted
        } else {
            WatchAction::Applied
        };
        self.notify(&object.kind, &object.metadata.name, action);
        Ok(object)
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<bool, StoreError> {
        let action = {
            let mut objects = self.objects.write().map_err(poison_err)?;
            let k = key(kind, name);
            let Some(existing) = objects.get_mut(&k) else {
                return Ok(false);
            };

            if existing.metadata.finalizers.is_empty() {
                objects.remove(&k);
                WatchAction::Deleted
            } else {
                if existing.metadata.deletion_timestamp.is_none() {
                    existing.metadata.deletion_timestamp = Some(Utc::now());
                    existing.metadata.resource_version += 1;
                }
                WatchAction::Applied
            }
        };

        self.notify(kind, name, action);
        Ok(true)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
