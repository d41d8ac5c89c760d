//! Profile persistence.
//!
//! The engine treats persistence as an opaque load/save of the serialized
//! profile. Two stores are provided: a JSON file written atomically, and a
//! small SQLite key/value table for hosts that already keep their state in a
//! database.

use anyhow::{Context, Result};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::UserProfile;

/// Opaque load/save of the user profile.
pub trait ProfileStore {
    /// `Ok(None)` when nothing was saved yet.
    fn load(&self) -> Result<Option<UserProfile>>;

    fn save(&self, profile: &UserProfile) -> Result<()>;

    fn load_or_default(&self) -> Result<UserProfile> {
        Ok(self.load()?.unwrap_or_default())
    }
}

/// Profile stored as a JSON document.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Result<Option<UserProfile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read profile {}", self.path.display()))?;
        let profile = serde_json::from_str(&text)
            .with_context(|| format!("Corrupt profile {}", self.path.display()))?;
        Ok(Some(profile))
    }

    fn save(&self, profile: &UserProfile) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        // Write next to the target and rename so a crash never leaves a
        // half-written profile behind.
        let mut file = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary profile file")?;
        serde_json::to_writer(&mut file, profile).context("Failed to serialize profile")?;
        file.flush()?;
        file.persist(&self.path)
            .with_context(|| format!("Failed to write profile {}", self.path.display()))?;
        debug!("Saved profile to {}", self.path.display());
        Ok(())
    }
}

const PROFILE_KEY: &str = "user_profile";

/// Profile stored as a JSON blob in a SQLite key/value table.
#[derive(Debug, Clone)]
pub struct SqliteProfileStore {
    path: PathBuf,
}

impl SqliteProfileStore {
    /// Open (and create if needed) the state database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        let conn = store.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS engine_state (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .context("Failed to create engine_state table")?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("Failed to open state database {}", self.path.display()))
    }
}

impl ProfileStore for SqliteProfileStore {
    fn load(&self) -> Result<Option<UserProfile>> {
        let conn = self.connect()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                [PROFILE_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query profile")?;

        value
            .map(|text| serde_json::from_str(&text).context("Corrupt profile row"))
            .transpose()
    }

    fn save(&self, profile: &UserProfile) -> Result<()> {
        let text = serde_json::to_string(profile).context("Failed to serialize profile")?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![PROFILE_KEY, text, chrono::Utc::now().timestamp()],
        )
        .context("Failed to save profile")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_profile() -> UserProfile {
        let mut profile = UserProfile::default();
        let track = Track::new("t1", "Song")
            .with_artist("a1", "Artist")
            .with_genre("jazz")
            .with_duration_ms(180_000);
        profile.record_listen(&track, 180_000, Utc::now());
        profile.record_like(&track, Utc::now());
        profile
    }

    #[test]
    fn test_json_store_missing_file_is_none() -> Result<()> {
        let dir = TempDir::new()?;
        let store = JsonProfileStore::new(dir.path().join("profile.json"));
        assert!(store.load()?.is_none());
        assert_eq!(store.load_or_default()?, UserProfile::default());
        Ok(())
    }

    #[test]
    fn test_json_store_persists_profile() -> Result<()> {
        let dir = TempDir::new()?;
        let store = JsonProfileStore::new(dir.path().join("nested/profile.json"));
        let profile = sample_profile();
        store.save(&profile)?;
        assert_eq!(store.load()?, Some(profile));
        Ok(())
    }

    #[test]
    fn test_sqlite_store_overwrites_previous_save() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SqliteProfileStore::open(dir.path().join("state.db"))?;
        assert!(store.load()?.is_none());

        store.save(&UserProfile::default())?;
        let profile = sample_profile();
        store.save(&profile)?;
        assert_eq!(store.load()?, Some(profile));
        Ok(())
    }
}
