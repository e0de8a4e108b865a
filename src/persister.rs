//! Saga persister trait and the in-memory optimistic-concurrency store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::{PersisterError, SagaEntity, SagaId, SagaMetaModel, SagaState};

/// Storage for saga state.
///
/// Reads return independent copies tagged with the write token observed at
/// read time; writes are rejected when that token is stale.
pub trait SagaPersister: Send + Sync + 'static {
    /// Load state by id. `None` if absent, completed or of another entity type.
    fn get(&self, entity_name: &str, id: SagaId) -> Result<Option<SagaEntity>, PersisterError>;

    /// Load state whose `property` equals `value`
    fn get_by_property(
        &self,
        entity_name: &str,
        property: &str,
        value: &Value,
    ) -> Result<Option<SagaEntity>, PersisterError>;

    /// Insert new state. On success the entity carries its first write token.
    fn save(&self, entity: &mut SagaEntity) -> Result<(), PersisterError>;

    /// Overwrite state read earlier. On success the entity carries the new token.
    fn update(&self, entity: &mut SagaEntity) -> Result<(), PersisterError>;

    /// Remove state read earlier, releasing its unique values
    fn complete(&self, entity: &SagaEntity) -> Result<(), PersisterError>;
}

/// Typed access on top of any [`SagaPersister`]
pub trait SagaPersisterExt: SagaPersister {
    /// Load typed state by id
    fn get_state<S: SagaState>(&self, id: SagaId) -> Result<Option<S>, PersisterError> {
        self.get(S::entity_name(), id)?
            .map(|entity| entity.to_state())
            .transpose()
    }

    /// Load typed state by property value
    fn find_state_by_property<S: SagaState>(
        &self,
        property: &str,
        value: impl Serialize,
    ) -> Result<Option<S>, PersisterError> {
        let value = serde_json::to_value(value)?;
        self.get_by_property(S::entity_name(), property, &value)?
            .map(|entity| entity.to_state())
            .transpose()
    }

    /// Insert typed state
    fn save_state<S: SagaState>(&self, state: &mut S) -> Result<(), PersisterError> {
        let mut entity = SagaEntity::from_state(state)?;
        self.save(&mut entity)?;
        state.envelope_mut().version = entity.version();
        Ok(())
    }

    /// Overwrite typed state
    fn update_state<S: SagaState>(&self, state: &mut S) -> Result<(), PersisterError> {
        let mut entity = SagaEntity::from_state(state)?;
        self.update(&mut entity)?;
        state.envelope_mut().version = entity.version();
        Ok(())
    }

    /// Remove typed state
    fn complete_state<S: SagaState>(&self, state: &S) -> Result<(), PersisterError> {
        self.complete(&SagaEntity::from_state(state)?)
    }
}

impl<P: SagaPersister + ?Sized> SagaPersisterExt for P {}

/// Label identifying the current writer in conflict diagnostics
pub fn default_owner_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => format!("Worker.{name}"),
        None => format!("Worker.{:?}", thread.id()),
    }
}

/// Options for [`InMemorySagaPersister`]
#[derive(Clone, Debug)]
pub struct PersisterOptions {
    /// Produces the label recorded for each successful write
    pub owner_label: fn() -> String,
}

impl Default for PersisterOptions {
    fn default() -> Self {
        Self {
            owner_label: default_owner_label,
        }
    }
}

/// Owner reported for writes against state that has since been completed
const COMPLETED_OWNER: &str = "completed";

struct StoreEntry {
    entity_name: Box<str>,
    entity: SagaEntity,
    version: u64,
    owner: Box<str>,
}

/// In-memory saga persister with unique-property enforcement and optimistic
/// concurrency.
///
/// A single store-wide lock covers the token check, the uniqueness check and
/// the mutation, so conflicting writes are totally ordered. Write tokens come
/// from one store-wide sequence and are never reused across entries.
pub struct InMemorySagaPersister {
    model: Arc<SagaMetaModel>,
    entries: RwLock<BTreeMap<SagaId, StoreEntry>>,
    last_version: AtomicU64,
    options: PersisterOptions,
}

impl InMemorySagaPersister {
    /// Create a persister enforcing the unique properties of `model`
    pub fn new(model: Arc<SagaMetaModel>) -> Self {
        Self::with_options(model, PersisterOptions::default())
    }

    /// Create a persister with custom options
    pub fn with_options(model: Arc<SagaMetaModel>, options: PersisterOptions) -> Self {
        Self {
            model,
            entries: RwLock::new(BTreeMap::new()),
            last_version: AtomicU64::new(0),
            options,
        }
    }

    /// Number of stored sagas
    pub fn len(&self) -> Result<usize, PersisterError> {
        Ok(self.entries.read().map_err(Self::poisoned)?.len())
    }

    /// True if no sagas are stored
    pub fn is_empty(&self) -> Result<bool, PersisterError> {
        Ok(self.len()? == 0)
    }

    fn poisoned<T>(e: std::sync::PoisonError<T>) -> PersisterError {
        PersisterError::Storage {
            reason: e.to_string().into(),
        }
    }

    /// Next write token; callers hold the write lock
    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_unique_properties(
        &self,
        entries: &BTreeMap<SagaId, StoreEntry>,
        entity: &SagaEntity,
    ) -> Result<(), PersisterError> {
        let Some(metadata) = self.model.find_by_entity_name(entity.entity_name()) else {
            tracing::debug!(entity = %entity.entity_name(), "No saga owns entity, no unique properties");
            return Ok(());
        };

        for property in metadata.unique_properties() {
            let value = match entity.property(property) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            let taken = entries.iter().any(|(id, entry)| {
                *id != entity.id()
                    && &*entry.entity_name == entity.entity_name()
                    && entry.entity.property(property) == Some(value)
            });
            if taken {
                tracing::warn!(
                    entity = %entity.entity_name(),
                    saga_id = %entity.id(),
                    property = %property,
                    "Unique property value already in use"
                );
                return Err(PersisterError::DuplicateUniqueValue {
                    entity: entity.entity_name().into(),
                    property: property.clone(),
                    value: value.to_string().into(),
                });
            }
        }
        Ok(())
    }

    /// Token check shared by update and complete.
    ///
    /// A copy that was read from the store but whose id is gone has been
    /// completed by another writer; that is a conflict, not a missing saga.
    fn check_current<'a>(
        entries: &'a BTreeMap<SagaId, StoreEntry>,
        entity: &SagaEntity,
    ) -> Result<&'a StoreEntry, PersisterError> {
        let id = entity.id();
        let Some(entry) = entries.get(&id) else {
            return match entity.version() {
                Some(_) => {
                    tracing::warn!(entity = %entity.entity_name(), saga_id = %id, "Saga already completed");
                    Err(PersisterError::ConcurrencyConflict {
                        id,
                        owner: COMPLETED_OWNER.into(),
                    })
                }
                None => Err(PersisterError::NotFound { id }),
            };
        };

        if &*entry.entity_name != entity.entity_name() {
            return Err(PersisterError::EntityMismatch {
                id,
                stored: entry.entity_name.clone(),
                requested: entity.entity_name().into(),
            });
        }
        if entity.version() != Some(entry.version) {
            tracing::warn!(
                entity = %entity.entity_name(),
                saga_id = %id,
                read_version = ?entity.version(),
                current_version = entry.version,
                owner = %entry.owner,
                "Concurrency violation"
            );
            return Err(PersisterError::ConcurrencyConflict {
                id,
                owner: entry.owner.clone(),
            });
        }
        Ok(entry)
    }
}

impl SagaPersister for InMemorySagaPersister {
    fn get(&self, entity_name: &str, id: SagaId) -> Result<Option<SagaEntity>, PersisterError> {
        let entries = self.entries.read().map_err(Self::poisoned)?;
        Ok(entries
            .get(&id)
            .filter(|entry| &*entry.entity_name == entity_name)
            .map(|entry| entry.entity.clone().with_version(entry.version)))
    }

    fn get_by_property(
        &self,
        entity_name: &str,
        property: &str,
        value: &Value,
    ) -> Result<Option<SagaEntity>, PersisterError> {
        let entries = self.entries.read().map_err(Self::poisoned)?;
        Ok(entries
            .values()
            .find(|entry| {
                &*entry.entity_name == entity_name && entry.entity.property(property) == Some(value)
            })
            .map(|entry| entry.entity.clone().with_version(entry.version)))
    }

    fn save(&self, entity: &mut SagaEntity) -> Result<(), PersisterError> {
        let id = entity.id();
        if id.is_nil() {
            return Err(PersisterError::MissingId {
                entity: entity.entity_name().into(),
            });
        }

        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        if let Some(existing) = entries.get(&id) {
            tracing::warn!(saga_id = %id, owner = %existing.owner, "Saga already saved");
            return Err(PersisterError::ConcurrencyConflict {
                id,
                owner: existing.owner.clone(),
            });
        }
        self.check_unique_properties(&entries, entity)?;

        let version = self.next_version();
        let stored = entity.clone().with_version(version);
        entries.insert(
            id,
            StoreEntry {
                entity_name: entity.entity_name().into(),
                entity: stored,
                version,
                owner: (self.options.owner_label)().into(),
            },
        );
        entity.set_version(version);

        tracing::debug!(entity = %entity.entity_name(), saga_id = %id, "Saga saved");
        Ok(())
    }

    fn update(&self, entity: &mut SagaEntity) -> Result<(), PersisterError> {
        let id = entity.id();
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        Self::check_current(&entries, entity)?;
        self.check_unique_properties(&entries, entity)?;

        let version = self.next_version();
        let owner: Box<str> = (self.options.owner_label)().into();
        let stored = entity.clone().with_version(version);
        if let Some(entry) = entries.get_mut(&id) {
            entry.entity = stored;
            entry.version = version;
            entry.owner = owner;
        }
        entity.set_version(version);

        tracing::debug!(entity = %entity.entity_name(), saga_id = %id, version, "Saga updated");
        Ok(())
    }

    fn complete(&self, entity: &SagaEntity) -> Result<(), PersisterError> {
        let id = entity.id();
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        Self::check_current(&entries, entity)?;
        entries.remove(&id);

        tracing::debug!(entity = %entity.entity_name(), saga_id = %id, "Saga completed");
        Ok(())
    }
}
