//! Salted-hash storage and verification of password + PIN pairs.
//!
//! The in-memory table is authoritative at runtime and every mutation is
//! followed by a write attempt through the [`UserRepository`]. Hash derivation
//! and repository calls always run with no table guard held. Writes are
//! serialized and always store the record as it is when the write runs, so a
//! slower writer can never put back an older copy.

pub mod hashing;
mod models;
pub mod policy;

pub use models::{NewUser, UserProfile, UserRecord};
pub use policy::PasswordPolicy;

use crate::{
    clock::Clock,
    error::AuthError,
    persistence::{UserRepository, UserTable},
    rbac::Role,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot of what a verification needs, taken under the shard lock.
struct HashMaterial {
    salt: String,
    password_hash: String,
    pin_hash: String,
}

pub struct CredentialStore {
    users: DashMap<String, UserRecord>,
    repository: Arc<dyn UserRepository>,
    write_lock: Mutex<()>,
    policy: PasswordPolicy,
    iterations: u32,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    /// Load the table from `repository`.
    ///
    /// # Errors
    /// Returns [`AuthError::PersistenceUnavailable`] if the table cannot be read.
    pub fn load(
        repository: Arc<dyn UserRepository>,
        iterations: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let table = repository.load_all().map_err(|e| {
            error!("Failed to load users: {e:#}");
            AuthError::PersistenceUnavailable(format!("{e:#}"))
        })?;
        info!(users = table.len(), "user table loaded");

        Ok(Self {
            users: table.into_iter().collect(),
            repository,
            write_lock: Mutex::new(()),
            policy: PasswordPolicy::default(),
            iterations,
            clock,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    fn material(&self, username: &str) -> Option<HashMaterial> {
        self.users.get(username).map(|user| HashMaterial {
            salt: user.salt.clone(),
            password_hash: user.password_hash.clone(),
            pin_hash: user.pin_hash.clone(),
        })
    }

    /// True iff both secrets match the stored hashes.
    ///
    /// Unknown users and mismatches are indistinguishable to the caller; an
    /// unknown user still costs both derivations.
    #[must_use]
    pub fn verify_credentials(&self, username: &str, password: &str, pin: &str) -> bool {
        let Some(material) = self.material(username) else {
            hashing::dummy_verify(password, pin, self.iterations);
            debug!(username, "credential check for unknown user");
            return false;
        };

        // Both derivations always run so timing does not reveal which secret failed.
        let password_ok = hashing::verify(password, &material.salt, &material.password_hash);
        let pin_ok = hashing::verify(pin, &material.salt, &material.pin_hash);

        if !(password_ok && pin_ok) {
            debug!(username, "credential mismatch");
        }
        password_ok && pin_ok
    }

    fn check_new_password(&self, password: &str) -> Result<(), AuthError> {
        self.policy
            .validate(password)
            .map_err(|reasons| AuthError::WeakSecret { reasons })
    }

    fn check_new_pin(pin: &str) -> Result<(), AuthError> {
        policy::validate_pin(pin).map_err(|reasons| AuthError::WeakSecret { reasons })
    }

    /// Write the current record of `username`. Callers must not hold a
    /// table guard.
    fn persist(&self, username: &str) -> Result<(), AuthError> {
        let _write = self.write_lock.lock();
        let Some(record) = self.users.get(username).map(|user| user.clone()) else {
            return Ok(());
        };
        self.repository.save_user(&record).map_err(|e| {
            warn!(username, "Failed to persist user: {e:#}");
            AuthError::PersistenceUnavailable(format!("{e:#}"))
        })
    }

    /// Create a user; the key must be free.
    ///
    /// # Errors
    /// [`AuthError::UserExists`], [`AuthError::WeakSecret`] or
    /// [`AuthError::PersistenceUnavailable`].
    pub fn create_user(&self, new_user: &NewUser) -> Result<UserProfile, AuthError> {
        policy::validate_username(&new_user.username)
            .map_err(|reasons| AuthError::WeakSecret { reasons })?;
        if self.users.contains_key(&new_user.username) {
            return Err(AuthError::UserExists);
        }
        self.check_new_password(new_user.password.expose_secret())?;
        Self::check_new_pin(new_user.pin.expose_secret())?;

        let salt = hashing::generate_salt();
        let record = UserRecord {
            username: new_user.username.clone(),
            password_hash: hashing::derive(new_user.password.expose_secret(), &salt, self.iterations),
            pin_hash: hashing::derive(new_user.pin.expose_secret(), &salt, self.iterations),
            salt,
            email: new_user.email.clone(),
            role: new_user.role,
            mfa_enabled: new_user.mfa_enabled,
            created_at: self.clock.now(),
            last_login: None,
            owned_resource_ids: Vec::new(),
        };

        match self.users.entry(new_user.username.clone()) {
            Entry::Occupied(_) => return Err(AuthError::UserExists),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        info!(username = %record.username, role = %record.role, "user created");
        self.persist(&record.username)?;
        Ok(UserProfile::from(&record))
    }

    /// Seed the first administrator when the table is empty.
    ///
    /// Returns `Ok(false)` when users already exist.
    ///
    /// # Errors
    /// Same as [`CredentialStore::create_user`].
    pub fn bootstrap(&self, admin: &NewUser) -> Result<bool, AuthError> {
        if !self.users.is_empty() {
            return Ok(false);
        }
        self.create_user(admin)?;
        warn!(username = %admin.username, "bootstrap administrator created");
        Ok(true)
    }

    /// Rotate both hashes under a fresh salt after re-verifying the current secrets.
    fn rotate(
        &self,
        username: &str,
        current_password: &str,
        current_pin: &str,
        new_password: &str,
        new_pin: &str,
    ) -> Result<(), AuthError> {
        let Some(material) = self.material(username) else {
            hashing::dummy_verify(current_password, current_pin, self.iterations);
            return Err(AuthError::InvalidCredentials);
        };
        if !self.verify_credentials(username, current_password, current_pin) {
            return Err(AuthError::InvalidCredentials);
        }

        let salt = hashing::generate_salt();
        let password_hash = hashing::derive(new_password, &salt, self.iterations);
        let pin_hash = hashing::derive(new_pin, &salt, self.iterations);

        {
            let mut user = self
                .users
                .get_mut(username)
                .ok_or(AuthError::InvalidCredentials)?;
            // A concurrent rotation won; its caller proved the old secrets first.
            if user.salt != material.salt {
                return Err(AuthError::InvalidCredentials);
            }
            user.salt = salt;
            user.password_hash = password_hash;
            user.pin_hash = pin_hash;
        }

        self.persist(username)
    }

    /// Replace the password; the PIN is re-hashed under the new salt.
    ///
    /// # Errors
    /// [`AuthError::InvalidCredentials`] if the current secrets do not match,
    /// [`AuthError::WeakSecret`] or [`AuthError::PersistenceUnavailable`].
    pub fn change_password(
        &self,
        username: &str,
        old_password: &str,
        pin: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        self.check_new_password(new_password)?;
        self.rotate(username, old_password, pin, new_password, pin)?;
        info!(username, "password changed");
        Ok(())
    }

    /// Replace the PIN; the password is re-hashed under the new salt.
    ///
    /// # Errors
    /// Same as [`CredentialStore::change_password`].
    pub fn change_pin(
        &self,
        username: &str,
        password: &str,
        old_pin: &str,
        new_pin: &str,
    ) -> Result<(), AuthError> {
        Self::check_new_pin(new_pin)?;
        self.rotate(username, password, old_pin, password, new_pin)?;
        info!(username, "pin changed");
        Ok(())
    }

    #[must_use]
    pub fn get_user(&self, username: &str) -> Option<UserProfile> {
        self.users.get(username).map(|user| UserProfile::from(&*user))
    }

    #[must_use]
    pub fn list_users(&self) -> Vec<UserProfile> {
        let mut users: Vec<UserProfile> = self
            .users
            .iter()
            .map(|user| UserProfile::from(user.value()))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    #[must_use]
    pub fn role_of(&self, username: &str) -> Option<Role> {
        self.users.get(username).map(|user| user.role)
    }

    #[must_use]
    pub fn email_of(&self, username: &str) -> Option<String> {
        self.users.get(username).map(|user| user.email.clone())
    }

    #[must_use]
    pub fn mfa_enabled(&self, username: &str) -> bool {
        self.users.get(username).is_some_and(|user| user.mfa_enabled)
    }

    /// Apply `change` to one record under its shard lock, then persist.
    fn update<F>(&self, username: &str, change: F) -> Result<(), AuthError>
    where
        F: FnOnce(&mut UserRecord),
    {
        {
            let mut user = self
                .users
                .get_mut(username)
                .ok_or(AuthError::UnknownUser)?;
            change(user.value_mut());
        }
        self.persist(username)
    }

    /// # Errors
    /// [`AuthError::UnknownUser`] or [`AuthError::PersistenceUnavailable`].
    pub fn set_role(&self, username: &str, role: Role) -> Result<(), AuthError> {
        self.update(username, |user| user.role = role)?;
        info!(username, %role, "role changed");
        Ok(())
    }

    /// # Errors
    /// [`AuthError::UnknownUser`] or [`AuthError::PersistenceUnavailable`].
    pub fn set_mfa_enabled(&self, username: &str, enabled: bool) -> Result<(), AuthError> {
        self.update(username, |user| user.mfa_enabled = enabled)
    }

    /// # Errors
    /// [`AuthError::UnknownUser`] or [`AuthError::PersistenceUnavailable`].
    pub fn record_login(&self, username: &str) -> Result<(), AuthError> {
        let now = self.clock.now();
        self.update(username, |user| user.last_login = Some(now))
    }

    /// Append a resource id; duplicates are ignored.
    ///
    /// # Errors
    /// [`AuthError::UnknownUser`] or [`AuthError::PersistenceUnavailable`].
    pub fn add_owned_resource(&self, username: &str, resource_id: &str) -> Result<(), AuthError> {
        self.update(username, |user| {
            if !user.owned_resource_ids.iter().any(|id| id == resource_id) {
                user.owned_resource_ids.push(resource_id.to_string());
            }
        })
    }

    /// # Errors
    /// [`AuthError::UnknownUser`] or [`AuthError::PersistenceUnavailable`].
    pub fn remove_owned_resource(&self, username: &str, resource_id: &str) -> Result<(), AuthError> {
        self.update(username, |user| {
            user.owned_resource_ids.retain(|id| id != resource_id);
        })
    }

    /// Write the whole table back, e.g. after a storage outage.
    ///
    /// # Errors
    /// [`AuthError::PersistenceUnavailable`].
    pub fn flush(&self) -> Result<(), AuthError> {
        let _write = self.write_lock.lock();
        let table: UserTable = self
            .users
            .iter()
            .map(|user| (user.key().clone(), user.value().clone()))
            .collect();
        self.repository
            .replace_all(&table)
            .map_err(|e| AuthError::PersistenceUnavailable(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, config::MIN_PBKDF2_ITERATIONS, persistence::MemoryUserRepository};
    use secrecy::SecretString;

    const PASSWORD: &str = "Sup3r-Secret!pw";
    const PIN: &str = "4821";

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: SecretString::from(PASSWORD),
            pin: SecretString::from(PIN),
            role: Role::User,
            mfa_enabled: true,
        }
    }

    fn store() -> anyhow::Result<(CredentialStore, Arc<MemoryUserRepository>, Arc<ManualClock>)> {
        let repo = Arc::new(MemoryUserRepository::new());
        let clock = Arc::new(ManualClock::at_noon());
        let store = CredentialStore::load(repo.clone(), MIN_PBKDF2_ITERATIONS, clock.clone())?;
        Ok((store, repo, clock))
    }

    #[test]
    fn verify_requires_both_secrets() -> anyhow::Result<()> {
        let (store, repo, _) = store()?;
        store.create_user(&new_user("alice"))?;

        assert!(store.verify_credentials("alice", PASSWORD, PIN));
        assert!(!store.verify_credentials("alice", "Sup3r-Secret!pX", PIN));
        assert!(!store.verify_credentials("alice", PASSWORD, "4822"));
        assert!(!store.verify_credentials("mallory", PASSWORD, PIN));

        let stored = repo.get("alice").ok_or_else(|| anyhow::anyhow!("not persisted"))?;
        assert_ne!(stored.password_hash, PASSWORD);
        assert_eq!(stored.salt.len(), 64);
        Ok(())
    }

    #[test]
    fn unknown_user_costs_the_same_derivations() -> anyhow::Result<()> {
        let (store, _, _) = store()?;
        store.create_user(&new_user("alice"))?;

        let start = hashing::derivations();
        assert!(!store.verify_credentials("alice", "Sup3r-Secret!pX", PIN));
        let known = hashing::derivations() - start;

        let start = hashing::derivations();
        assert!(!store.verify_credentials("mallory", PASSWORD, PIN));
        let unknown = hashing::derivations() - start;

        assert_eq!(known, 2);
        assert_eq!(unknown, known);

        let start = hashing::derivations();
        assert_eq!(
            store.change_pin("mallory", PASSWORD, PIN, "990011"),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(hashing::derivations() - start, known);
        Ok(())
    }

    #[test]
    fn concurrent_updates_leave_the_latest_record_stored() -> anyhow::Result<()> {
        let (store, repo, _) = store()?;
        store.create_user(&new_user("alice"))?;

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    for item in 0..20 {
                        let _ = store.add_owned_resource("alice", &format!("doc-{worker}-{item}"));
                        let role = if item % 2 == 0 { Role::Admin } else { Role::User };
                        let _ = store.set_role("alice", role);
                    }
                });
            }
        });

        let stored = repo.get("alice").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let live = store.users.get("alice").map(|user| user.clone());
        assert_eq!(stored.owned_resource_ids.len(), 160);
        assert_eq!(Some(stored), live);
        Ok(())
    }

    #[test]
    fn configured_cost_is_kept_with_each_hash() -> anyhow::Result<()> {
        let repo = Arc::new(MemoryUserRepository::new());
        let clock = Arc::new(ManualClock::at_noon());
        let store = CredentialStore::load(repo.clone(), 120_000, clock.clone())?;
        store.create_user(&new_user("alice"))?;

        let stored = repo.get("alice").ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert!(stored.password_hash.starts_with("120000$"));
        assert!(stored.pin_hash.starts_with("120000$"));

        // A restart at the default cost still verifies the older hashes.
        let store = CredentialStore::load(repo, MIN_PBKDF2_ITERATIONS, clock)?;
        assert!(store.verify_credentials("alice", PASSWORD, PIN));
        Ok(())
    }

    #[test]
    fn duplicate_user_is_rejected() -> anyhow::Result<()> {
        let (store, _, _) = store()?;
        store.create_user(&new_user("alice"))?;
        assert_eq!(store.create_user(&new_user("alice")), Err(AuthError::UserExists));
        Ok(())
    }

    #[test]
    fn weak_secrets_are_rejected() -> anyhow::Result<()> {
        let (store, _, _) = store()?;
        let mut user = new_user("alice");
        user.password = SecretString::from("password");
        assert!(matches!(store.create_user(&user), Err(AuthError::WeakSecret { .. })));

        let mut user = new_user("alice");
        user.pin = SecretString::from("12");
        assert!(matches!(store.create_user(&user), Err(AuthError::WeakSecret { .. })));
        assert!(store.get_user("alice").is_none());
        Ok(())
    }

    #[test]
    fn change_password_resalts_both_hashes() -> anyhow::Result<()> {
        let (store, repo, _) = store()?;
        store.create_user(&new_user("alice"))?;
        let before = repo.get("alice").ok_or_else(|| anyhow::anyhow!("missing"))?;

        assert_eq!(
            store.change_password("alice", "Wrong-Passw0rd!", PIN, "N3w-Passw0rd!!"),
            Err(AuthError::InvalidCredentials)
        );
        store.change_password("alice", PASSWORD, PIN, "N3w-Passw0rd!!")?;

        let after = repo.get("alice").ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_ne!(before.salt, after.salt);
        assert_ne!(before.pin_hash, after.pin_hash);
        assert!(store.verify_credentials("alice", "N3w-Passw0rd!!", PIN));
        assert!(!store.verify_credentials("alice", PASSWORD, PIN));
        Ok(())
    }

    #[test]
    fn change_pin_keeps_password() -> anyhow::Result<()> {
        let (store, _, _) = store()?;
        store.create_user(&new_user("alice"))?;
        store.change_pin("alice", PASSWORD, PIN, "990011")?;
        assert!(store.verify_credentials("alice", PASSWORD, "990011"));
        Ok(())
    }

    #[test]
    fn profile_updates_are_persisted() -> anyhow::Result<()> {
        let (store, repo, clock) = store()?;
        store.create_user(&new_user("alice"))?;

        store.set_role("alice", Role::Admin)?;
        store.set_mfa_enabled("alice", false)?;
        store.record_login("alice")?;
        store.add_owned_resource("alice", "notes.md")?;
        store.add_owned_resource("alice", "notes.md")?;
        store.add_owned_resource("alice", "plan.txt")?;
        store.remove_owned_resource("alice", "notes.md")?;

        let stored = repo.get("alice").ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(stored.role, Role::Admin);
        assert!(!stored.mfa_enabled);
        assert_eq!(stored.last_login, Some(clock.now()));
        assert_eq!(stored.owned_resource_ids, vec!["plan.txt"]);

        assert_eq!(store.set_role("nobody", Role::Admin), Err(AuthError::UnknownUser));
        Ok(())
    }

    #[test]
    fn persistence_failure_is_reported_after_memory_update() -> anyhow::Result<()> {
        let (store, repo, _) = store()?;
        store.create_user(&new_user("alice"))?;
        repo.set_unavailable(true);

        let result = store.set_role("alice", Role::Guest);
        assert!(matches!(result, Err(AuthError::PersistenceUnavailable(_))));
        assert_eq!(store.role_of("alice"), Some(Role::Guest));

        repo.set_unavailable(false);
        store.flush()?;
        assert_eq!(repo.get("alice").map(|u| u.role), Some(Role::Guest));
        Ok(())
    }

    #[test]
    fn bootstrap_only_seeds_empty_table() -> anyhow::Result<()> {
        let (store, _, _) = store()?;
        let mut admin = new_user("root-admin");
        admin.role = Role::SuperAdmin;
        assert!(store.bootstrap(&admin)?);
        assert!(!store.bootstrap(&new_user("second"))?);
        assert_eq!(store.len(), 1);
        Ok(())
    }
}
