// ABOUTME: Entity records persisted by the launcher: logins, favorites, engine installs, filters, hubs, policies.
// ABOUTME: Each cached record implements Keyed so the observable cache can index it by its natural key.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::cache::Keyed;

/// Tokens this close to expiry should be refreshed.
const TOKEN_REFRESH_WINDOW_DAYS: i64 = 15;

/// An auth token and the absolute time it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginToken {
    pub token: String,
    pub expire_time: DateTime<Utc>,
}

impl LoginToken {
    pub fn new(token: impl Into<String>, expire_time: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expire_time,
        }
    }

    pub fn is_time_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }

    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expire_time - now <= Duration::days(TOKEN_REFRESH_WINDOW_DAYS)
    }
}

/// A saved account login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub user_id: Uuid,
    pub username: String,
    pub token: LoginToken,
}

impl Keyed for LoginInfo {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.user_id
    }
}

impl fmt::Display for LoginInfo {
    // Never print the token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.user_id)
    }
}

/// A server the user pinned to their favorites list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteServer {
    pub address: String,
    pub name: Option<String>,
    /// Last time the user raised this favorite to the top of the list.
    pub raise_time: DateTime<Utc>,
}

impl FavoriteServer {
    pub fn new(address: impl Into<String>, name: Option<String>, raise_time: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            name,
            raise_time,
        }
    }
}

impl Keyed for FavoriteServer {
    type Key = String;

    fn key(&self) -> String {
        self.address.clone()
    }
}

/// An engine build installed on disk. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledEngineVersion {
    pub version: String,
    pub signature: Vec<u8>,
}

impl Keyed for InstalledEngineVersion {
    type Key = String;

    fn key(&self) -> String {
        self.version.clone()
    }
}

/// An installed engine module, identified by (name, version).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstalledEngineModule {
    pub name: String,
    pub version: String,
}

/// A server-list filter. Membership only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerFilter {
    pub category: String,
    pub data: String,
}

impl ServerFilter {
    pub fn new(category: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            data: data.into(),
        }
    }
}

/// A custom server hub. Lower priority values are queried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub address: Url,
    pub priority: i32,
}

impl Hub {
    pub fn new(address: Url, priority: i32) -> Self {
        Self { address, priority }
    }
}

/// Record of the user accepting a server's privacy policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedPrivacyPolicy {
    pub identifier: String,
    pub version: String,
    pub accepted_time: DateTime<Utc>,
    pub last_connected: DateTime<Utc>,
}
