//! User profile record
//!
//! A profile is assembled from up to three places: the auth user (id, email,
//! free-form metadata), the `profiles` row, and the copy cached in local
//! storage. [`Profile::normalize`] is the single place that merges them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const FALLBACK_NAME: &str = "User";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Renter,
    Landlord,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "renter" => Some(Role::Renter),
            "landlord" => Some(Role::Landlord),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Role,
}

/// Signed-in user as reported by the auth service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Value,
}

/// Row of the `profiles` table. Every column may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileSources {
    pub auth: Option<AuthUser>,
    pub row: Option<ProfileRow>,
    pub cached: Option<Profile>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn metadata_str<'a>(metadata: &'a Value, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

impl Profile {
    /// Merges the sources, most authoritative first: profile row, auth
    /// metadata, cached copy.
    pub fn normalize(sources: ProfileSources) -> Result<Self> {
        let ProfileSources { auth, row, cached } = sources;
        let row = row.unwrap_or_default();
        let metadata = auth
            .as_ref()
            .map(|a| a.user_metadata.clone())
            .unwrap_or(Value::Null);

        let user_id = non_empty(auth.as_ref().map(|a| a.id.as_str()))
            .or_else(|| non_empty(row.id.as_deref()))
            .or_else(|| non_empty(cached.as_ref().map(|c| c.user_id.as_str())))
            .ok_or_else(|| Error::validation("profile", "user id is missing"))?;

        // A cached record of somebody else must not leak into this profile.
        let cached = cached.filter(|c| c.user_id == user_id);

        let email = non_empty(auth.as_ref().and_then(|a| a.email.as_deref()))
            .or_else(|| cached.as_ref().and_then(|c| c.email.clone()));

        let display_name = non_empty(row.display_name.as_deref())
            .or_else(|| non_empty(row.full_name.as_deref()))
            .or_else(|| non_empty(metadata_str(&metadata, "full_name")))
            .or_else(|| non_empty(metadata_str(&metadata, "name")))
            .or_else(|| non_empty(cached.as_ref().map(|c| c.display_name.as_str())))
            .or_else(|| {
                email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .and_then(|local| non_empty(Some(local)))
            })
            .unwrap_or_else(|| FALLBACK_NAME.to_string());

        let avatar_url = non_empty(row.avatar_url.as_deref())
            .or_else(|| non_empty(metadata_str(&metadata, "avatar_url")))
            .or_else(|| cached.as_ref().and_then(|c| c.avatar_url.clone()));

        let role = row
            .role
            .as_deref()
            .and_then(Role::parse)
            .or_else(|| metadata_str(&metadata, "role").and_then(Role::parse))
            .or_else(|| cached.as_ref().map(|c| c.role))
            .unwrap_or_default();

        Ok(Self {
            user_id,
            display_name,
            email,
            avatar_url,
            role,
        })
    }

    pub fn is_landlord(&self) -> bool {
        self.role == Role::Landlord
    }
}
