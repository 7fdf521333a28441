use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::flag::Flag;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("operation canceled")]
    Canceled,
}

/// Persistent mapping `(service, name) -> flag`.
///
/// Operations are safe under parallel callers; a reader never observes a
/// partially applied write. Cancellation is by dropping the future before
/// completion, which leaves the state unmodified.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the flags of the given service plus all global flags. An
    /// empty service name returns every flag.
    async fn get(&self, service_name: &str) -> Result<Vec<Flag>, StoreError>;

    /// Upserts the given flags by `(service, name)`. When `initial` is set,
    /// existing entries are left untouched and only absent keys are
    /// inserted.
    async fn save(&self, flags: &[Flag], initial: bool) -> Result<(), StoreError>;

    /// Removes the given flags by `(service, name)`; absent keys are
    /// ignored.
    async fn delete(&self, flags: &[Flag]) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FlagKey {
    service_name: String,
    name: String,
}

impl FlagKey {
    fn of(flag: &Flag) -> FlagKey {
        FlagKey {
            service_name: flag.service_name.clone(),
            name: flag.name.clone(),
        }
    }
}

/// In-memory store: one reader/writer lock over the whole map.
#[derive(Default)]
pub struct MemStore {
    data: RwLock<HashMap<FlagKey, Flag>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, service_name: &str) -> Result<Vec<Flag>, StoreError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);

        let mut flags: Vec<Flag> = data
            .values()
            .filter(|f| {
                f.service_name.is_empty()
                    || f.service_name == service_name
                    || service_name.is_empty()
            })
            .cloned()
            .collect();
        // Deterministic responses regardless of map iteration order.
        flags.sort_by(|a, b| (&a.name, &a.service_name).cmp(&(&b.name, &b.service_name)));

        Ok(flags)
    }

    async fn save(&self, flags: &[Flag], initial: bool) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);

        for flag in flags {
            let key = FlagKey::of(flag);
            if initial && data.contains_key(&key) {
                continue;
            }
            data.insert(key, flag.clone());
        }

        Ok(())
    }

    async fn delete(&self, flags: &[Flag]) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);

        for flag in flags {
            data.remove(&FlagKey::of(flag));
        }

        Ok(())
    }
}
