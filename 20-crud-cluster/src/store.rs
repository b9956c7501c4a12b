//! In-memory user storage for a single worker.
//!
//! Each worker owns exactly one [`UserStore`]. It is shared by reference
//! (an `Arc`) between the HTTP handlers and the replication layer.
//!
//! Client-facing operations (`create`, `update`, `delete`) validate their
//! input and, once the change is in place, notify every registered
//! [`StoreObserver`]. The `upsert`/`remove`/`replace_all` family applies
//! changes that already passed validation elsewhere; it never notifies
//! observers, otherwise replicated writes would echo back to their origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use uuid::Uuid;

use crate::error::StoreError;
use crate::user::{User, UserChanges};

/// The effect of a successful client-originated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Created(User),
    Updated(User),
    Deleted(Uuid),
}

/// Post-mutation hook. Called synchronously, after the store lock has been
/// released, once per successful `create`/`update`/`delete`.
pub trait StoreObserver: Send + Sync {
    fn on_mutation(&self, mutation: &Mutation);
}

#[derive(Default)]
pub struct UserStore {
    users: Mutex<HashMap<Uuid, User>>,
    /// Held weakly: an observer usually owns the store it watches.
    observers: RwLock<Vec<Weak<dyn StoreObserver>>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a post-mutation hook for as long as `observer` is alive.
    pub fn subscribe<O: StoreObserver + 'static>(&self, observer: &Arc<O>) {
        let observer: Weak<O> = Arc::downgrade(observer);
        let observer: Weak<dyn StoreObserver> = observer;
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn get(&self, id: &Uuid) -> Result<User, StoreError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound { id: *id })
    }

    pub fn list_all(&self) -> Vec<User> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a user. Fields are validated first, then the username is
    /// checked for uniqueness, compared case-insensitively.
    pub fn create(&self, changes: UserChanges) -> Result<User, StoreError> {
        let user = changes.into_user()?;
        {
            let mut users = self.lock();
            let lowered = user.username.to_lowercase();
            if users.values().any(|u| u.username.to_lowercase() == lowered) {
                return Err(StoreError::validation(
                    format!("User with username '{}' already exists", user.username),
                    "username",
                ));
            }
            users.insert(user.id, user.clone());
        }
        self.notify(&Mutation::Created(user.clone()));
        Ok(user)
    }

    pub fn update(&self, id: &Uuid, changes: UserChanges) -> Result<User, StoreError> {
        let user = {
            let mut users = self.lock();
            let existing = users.get(id).ok_or(StoreError::NotFound { id: *id })?;
            let updated = changes.apply_to(existing);
            users.insert(*id, updated.clone());
            updated
        };
        self.notify(&Mutation::Updated(user.clone()));
        Ok(user)
    }

    pub fn delete(&self, id: &Uuid) -> Result<(), StoreError> {
        if self.lock().remove(id).is_none() {
            return Err(StoreError::NotFound { id: *id });
        }
        self.notify(&Mutation::Deleted(*id));
        Ok(())
    }

    /// Inserts or overwrites by id without validation or hooks.
    pub fn upsert(&self, user: User) {
        self.lock().insert(user.id, user);
    }

    /// Removes by id without hooks. Missing ids are ignored.
    pub fn remove(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    /// Discards every user and installs `users` in their place.
    pub fn replace_all(&self, users: Vec<User>) {
        let mut current = self.lock();
        current.clear();
        current.extend(users.into_iter().map(|user| (user.id, user)));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, User>> {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, mutation: &Mutation) {
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.on_mutation(mutation);
        }
    }
}
