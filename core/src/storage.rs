//! Local key-value storage using SQLite
//!
//! Offline cache and lightweight preferences. Values are JSON text under
//! string keys, mirroring the browser store the web client used.

use crate::error::Result;
use crate::profile::Profile;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const LISTINGS_KEY: &str = "listings";
pub const USERS_KEY: &str = "users";
pub const CURRENT_USER_KEY: &str = "current-user";
pub const THEME_KEY: &str = "theme";
pub const LANGUAGE_KEY: &str = "language";

pub fn listing_template_key(landlord_id: &str) -> String {
    format!("listing-template:{}", landlord_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub theme: Theme,
    pub language: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            language: "en".to_string(),
        }
    }
}

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("rentroom.db"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ========================================================================
    // Raw keys
    // ========================================================================

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Typed read. A value that no longer parses is treated as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Discarding unreadable value under {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?)
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub fn current_user(&self) -> Result<Option<Profile>> {
        self.get_json(CURRENT_USER_KEY)
    }

    pub fn set_current_user(&self, profile: &Profile) -> Result<()> {
        self.set_json(CURRENT_USER_KEY, profile)?;
        self.cache_user(profile)
    }

    pub fn clear_current_user(&self) -> Result<()> {
        self.remove(CURRENT_USER_KEY)
    }

    pub fn cached_users(&self) -> Result<Vec<Profile>> {
        Ok(self.get_json(USERS_KEY)?.unwrap_or_default())
    }

    pub fn cached_user(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self
            .cached_users()?
            .into_iter()
            .find(|p| p.user_id == user_id))
    }

    pub fn cache_user(&self, profile: &Profile) -> Result<()> {
        let mut users = self.cached_users()?;
        match users.iter_mut().find(|p| p.user_id == profile.user_id) {
            Some(existing) => *existing = profile.clone(),
            None => users.push(profile.clone()),
        }
        self.set_json(USERS_KEY, &users)
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    pub fn preferences(&self) -> Result<Preferences> {
        let defaults = Preferences::default();
        Ok(Preferences {
            theme: self.get_json(THEME_KEY)?.unwrap_or(defaults.theme),
            language: self.get(LANGUAGE_KEY)?.unwrap_or(defaults.language),
        })
    }

    pub fn save_preferences(&self, prefs: &Preferences) -> Result<()> {
        self.set_json(THEME_KEY, &prefs.theme)?;
        self.set(LANGUAGE_KEY, &prefs.language)
    }

    // ========================================================================
    // Listings cache
    // ========================================================================

    pub fn listing_template(&self, landlord_id: &str) -> Result<Option<Value>> {
        self.get_json(&listing_template_key(landlord_id))
    }

    pub fn save_listing_template(&self, landlord_id: &str, template: &Value) -> Result<()> {
        self.set_json(&listing_template_key(landlord_id), template)
    }

    /// Replaces the offline listings snapshot (`SYNC_LISTINGS`).
    pub fn sync_listings(&self, listings: Vec<Value>) -> Result<usize> {
        let count = listings.len();
        self.set_json(LISTINGS_KEY, &listings)?;
        tracing::debug!("Cached {} listings for offline reads", count);
        Ok(count)
    }

    /// Cached listings as a JSON array body; `[]` when nothing was synced.
    pub fn cached_listings_response(&self) -> Result<String> {
        Ok(self.get(LISTINGS_KEY)?.unwrap_or_else(|| "[]".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Role;
    use serde_json::json;

    fn profile(id: &str, name: &str) -> Profile {
        Profile {
            user_id: id.to_string(),
            display_name: name.to_string(),
            email: None,
            avatar_url: None,
            role: Role::Renter,
        }
    }

    #[test]
    fn test_set_get_remove() {
        let storage = LocalStorage::open_in_memory().unwrap();
        assert_eq!(storage.get("missing").unwrap(), None);

        storage.set("k", "v1").unwrap();
        storage.set("k", "v2").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v2"));

        storage.remove("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn test_corrupt_json_reads_as_absent() {
        let storage = LocalStorage::open_in_memory().unwrap();
        storage.set(USERS_KEY, "{not json").unwrap();
        assert!(storage.cached_users().unwrap().is_empty());
    }

    #[test]
    fn test_current_user_is_also_cached() {
        let storage = LocalStorage::open_in_memory().unwrap();
        storage.set_current_user(&profile("rita", "Rita")).unwrap();
        storage.cache_user(&profile("rita", "Rita R.")).unwrap();

        assert_eq!(storage.current_user().unwrap().unwrap().display_name, "Rita");
        assert_eq!(storage.cached_users().unwrap().len(), 1);
        assert_eq!(storage.cached_user("rita").unwrap().unwrap().display_name, "Rita R.");
    }

    #[test]
    fn test_preferences_default_and_roundtrip() {
        let storage = LocalStorage::open_in_memory().unwrap();
        assert_eq!(storage.preferences().unwrap(), Preferences::default());

        let prefs = Preferences {
            theme: Theme::Dark,
            language: "es".to_string(),
        };
        storage.save_preferences(&prefs).unwrap();
        assert_eq!(storage.preferences().unwrap(), prefs);
        assert_eq!(storage.get(THEME_KEY).unwrap().as_deref(), Some("\"dark\""));
    }

    #[test]
    fn test_listings_shim_serves_synced_array() {
        let storage = LocalStorage::open_in_memory().unwrap();
        assert_eq!(storage.cached_listings_response().unwrap(), "[]");

        let synced = storage
            .sync_listings(vec![json!({ "id": "room-1", "price": 450 }), json!({ "id": "room-2" })])
            .unwrap();
        assert_eq!(synced, 2);

        let body: Vec<Value> =
            serde_json::from_str(&storage.cached_listings_response().unwrap()).unwrap();
        assert_eq!(body[0]["price"], 450);
    }

    #[test]
    fn test_listing_template_per_landlord() {
        let storage = LocalStorage::open_in_memory().unwrap();
        storage
            .save_listing_template("lars", &json!({ "title": "Sunny room" }))
            .unwrap();

        assert_eq!(
            storage.listing_template("lars").unwrap(),
            Some(json!({ "title": "Sunny room" }))
        );
        assert_eq!(storage.listing_template("lena").unwrap(), None);
    }
}
