//! Storage collaborators for the user table.
//!
//! The credential store owns the in-memory table; a [`UserRepository`] only
//! has to load the whole table once and accept per-record or whole-table
//! replacement afterwards.

mod json_file;

pub use json_file::JsonFileUserRepository;

use crate::credentials::UserRecord;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

pub type UserTable = BTreeMap<String, UserRecord>;

pub trait UserRepository: Send + Sync {
    /// Read every stored record keyed by username.
    ///
    /// # Errors
    /// Returns an error if the backing store cannot be read or decoded.
    fn load_all(&self) -> Result<UserTable>;

    /// Replace (or insert) a single record.
    ///
    /// # Errors
    /// Returns an error if the write did not reach the backing store.
    fn save_user(&self, record: &UserRecord) -> Result<()>;

    /// Replace the whole table.
    ///
    /// # Errors
    /// Returns an error if the write did not reach the backing store.
    fn replace_all(&self, users: &UserTable) -> Result<()>;
}

/// Volatile repository, also used to simulate storage outages in tests.
#[derive(Debug, Default)]
pub struct MemoryUserRepository {
    users: Mutex<UserTable>,
    unavailable: AtomicBool,
}

impl MemoryUserRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_users(users: UserTable) -> Self {
        Self {
            users: Mutex::new(users),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn get(&self, username: &str) -> Option<UserRecord> {
        self.users.lock().get(username).cloned()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("user repository unavailable");
        }
        Ok(())
    }
}

impl UserRepository for MemoryUserRepository {
    fn load_all(&self) -> Result<UserTable> {
        self.ensure_available()?;
        Ok(self.users.lock().clone())
    }

    fn save_user(&self, record: &UserRecord) -> Result<()> {
        self.ensure_available()?;
        self.users
            .lock()
            .insert(record.username.clone(), record.clone());
        Ok(())
    }

    fn replace_all(&self, users: &UserTable) -> Result<()> {
        self.ensure_available()?;
        *self.users.lock() = users.clone();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rbac::Role;
    use chrono::Utc;

    pub(crate) fn record(username: &str) -> UserRecord {
        UserRecord {
            username: username.to_string(),
            password_hash: "00".to_string(),
            pin_hash: "11".to_string(),
            salt: "22".to_string(),
            email: format!("{username}@example.com"),
            role: Role::User,
            mfa_enabled: false,
            created_at: Utc::now(),
            last_login: None,
            owned_resource_ids: Vec::new(),
        }
    }

    #[test]
    fn memory_repository_round_trip() -> anyhow::Result<()> {
        let repo = MemoryUserRepository::new();
        repo.save_user(&record("alice"))?;
        repo.save_user(&record("bob"))?;
        let all = repo.load_all()?;
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["alice", "bob"]);

        let mut only_bob = UserTable::new();
        only_bob.insert("bob".to_string(), record("bob"));
        repo.replace_all(&only_bob)?;
        assert!(repo.get("alice").is_none());
        Ok(())
    }

    #[test]
    fn outage_fails_writes() {
        let repo = MemoryUserRepository::new();
        repo.set_unavailable(true);
        assert!(repo.save_user(&record("alice")).is_err());
        repo.set_unavailable(false);
        assert!(repo.save_user(&record("alice")).is_ok());
    }
}
