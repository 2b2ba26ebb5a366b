use super::{UserRepository, UserTable};
use crate::credentials::UserRecord;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, error};

/// Pretty-printed JSON object keyed by username.
///
/// Writes go to a temporary sibling file which is then renamed over the
/// target, so readers never observe a half-written table.
#[derive(Debug)]
pub struct JsonFileUserRepository {
    path: PathBuf,
    // Serializes read-modify-write cycles of `save_user`.
    write_lock: Mutex<()>,
}

impl JsonFileUserRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<UserTable> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "user file missing, starting empty");
                return Ok(UserTable::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read user file: {}", self.path.display()))
            }
        };

        let mut users: UserTable = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid user file: {}", self.path.display()))?;

        // The key is authoritative; older files do not repeat it in the record.
        for (username, record) in &mut users {
            record.username.clone_from(username);
        }
        Ok(users)
    }

    fn write(&self, users: &UserTable) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let payload = serde_json::to_vec_pretty(users).context("Failed to encode user table")?;
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", rand::random::<u32>()));

        let written = fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(&payload)?;
                file.sync_all()
            })
            .with_context(|| format!("Failed to write temporary file: {}", temp_path.display()));

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            error!(
                "Failed to rename '{}' to '{}': {e}",
                temp_path.display(),
                self.path.display()
            );
            let _ = fs::remove_file(&temp_path);
            return Err(e).context("Failed to replace user file");
        }

        debug!(path = %self.path.display(), users = users.len(), "user file saved");
        Ok(())
    }
}

impl UserRepository for JsonFileUserRepository {
    fn load_all(&self) -> Result<UserTable> {
        self.read()
    }

    fn save_user(&self, record: &UserRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut users = self.read()?;
        users.insert(record.username.clone(), record.clone());
        self.write(&users)
    }

    fn replace_all(&self, users: &UserTable) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write(users)
    }
}
