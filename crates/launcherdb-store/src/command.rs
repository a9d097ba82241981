// ABOUTME: Typed persistence commands, one variant per SQL statement the write-behind layer can run.
// ABOUTME: Commands own snapshots of their data so later in-memory mutation never leaks into a batch.

use chrono::{DateTime, Utc};
use launcherdb_core::{
    Change, FavoriteServer, Hub, InstalledEngineModule, InstalledEngineVersion, LoginInfo,
    ServerFilter, Value,
};
use rusqlite::{Transaction, params};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{CodecError, encode_value, timestamp_column, uuid_column};

/// Errors that can occur while applying a command inside a transaction.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A single deferred write.
#[derive(Debug, Clone, PartialEq)]
pub enum DbCommand {
    UpsertConfig { key: String, value: Value },

    InsertLogin(LoginInfo),
    UpdateLogin(LoginInfo),
    DeleteLogin { user_id: Uuid },

    InsertFavorite(FavoriteServer),
    UpdateFavorite(FavoriteServer),
    DeleteFavorite { address: String },

    InsertEngineInstallation(InstalledEngineVersion),
    UpdateEngineInstallation(InstalledEngineVersion),
    DeleteEngineInstallation { version: String },

    InsertEngineModule(InstalledEngineModule),
    DeleteEngineModule(InstalledEngineModule),

    InsertFilter(ServerFilter),
    DeleteFilter(ServerFilter),
    ClearFilters,

    ClearHubs,
    InsertHub(Hub),

    UpsertPrivacyPolicy {
        identifier: String,
        version: String,
        at: DateTime<Utc>,
    },
    UpdatePrivacyPolicyVersion {
        identifier: String,
        version: String,
        at: DateTime<Utc>,
    },
    TouchPrivacyPolicy {
        identifier: String,
        at: DateTime<Utc>,
    },
}

impl DbCommand {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            DbCommand::UpsertConfig { .. } => "upsert_config",
            DbCommand::InsertLogin(_) => "insert_login",
            DbCommand::UpdateLogin(_) => "update_login",
            DbCommand::DeleteLogin { .. } => "delete_login",
            DbCommand::InsertFavorite(_) => "insert_favorite",
            DbCommand::UpdateFavorite(_) => "update_favorite",
            DbCommand::DeleteFavorite { .. } => "delete_favorite",
            DbCommand::InsertEngineInstallation(_) => "insert_engine_installation",
            DbCommand::UpdateEngineInstallation(_) => "update_engine_installation",
            DbCommand::DeleteEngineInstallation { .. } => "delete_engine_installation",
            DbCommand::InsertEngineModule(_) => "insert_engine_module",
            DbCommand::DeleteEngineModule(_) => "delete_engine_module",
            DbCommand::InsertFilter(_) => "insert_filter",
            DbCommand::DeleteFilter(_) => "delete_filter",
            DbCommand::ClearFilters => "clear_filters",
            DbCommand::ClearHubs => "clear_hubs",
            DbCommand::InsertHub(_) => "insert_hub",
            DbCommand::UpsertPrivacyPolicy { .. } => "upsert_privacy_policy",
            DbCommand::UpdatePrivacyPolicyVersion { .. } => "update_privacy_policy_version",
            DbCommand::TouchPrivacyPolicy { .. } => "touch_privacy_policy",
        }
    }

    /// Command persisting a login cache change.
    pub fn for_login(change: &Change<LoginInfo>) -> Self {
        match change {
            Change::Added(login) => DbCommand::InsertLogin(login.clone()),
            Change::Updated(login) => DbCommand::UpdateLogin(login.clone()),
            Change::Removed(login) => DbCommand::DeleteLogin {
                user_id: login.user_id,
            },
        }
    }

    /// Command persisting a favorite server cache change.
    pub fn for_favorite(change: &Change<FavoriteServer>) -> Self {
        match change {
            Change::Added(fav) => DbCommand::InsertFavorite(fav.clone()),
            Change::Updated(fav) => DbCommand::UpdateFavorite(fav.clone()),
            Change::Removed(fav) => DbCommand::DeleteFavorite {
                address: fav.address.clone(),
            },
        }
    }

    /// Command persisting an engine installation cache change.
    pub fn for_engine_installation(change: &Change<InstalledEngineVersion>) -> Self {
        match change {
            Change::Added(engine) => DbCommand::InsertEngineInstallation(engine.clone()),
            Change::Updated(engine) => DbCommand::UpdateEngineInstallation(engine.clone()),
            Change::Removed(engine) => DbCommand::DeleteEngineInstallation {
                version: engine.version.clone(),
            },
        }
    }

    /// Run this command's statement inside `tx`.
    pub fn apply(&self, tx: &Transaction<'_>) -> Result<(), CommandError> {
        match self {
            DbCommand::UpsertConfig { key, value } => {
                tx.execute(
                    "INSERT OR REPLACE INTO Config (Key, Value) VALUES (?1, ?2)",
                    params![key, encode_value(value)?],
                )?;
            }

            DbCommand::InsertLogin(login) => {
                tx.execute(
                    "INSERT INTO Login (UserId, UserName, Token, Expires) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        uuid_column(&login.user_id),
                        login.username,
                        login.token.token,
                        timestamp_column(&login.token.expire_time),
                    ],
                )?;
            }
            DbCommand::UpdateLogin(login) => {
                tx.execute(
                    "UPDATE Login SET UserName = ?2, Token = ?3, Expires = ?4 WHERE UserId = ?1",
                    params![
                        uuid_column(&login.user_id),
                        login.username,
                        login.token.token,
                        timestamp_column(&login.token.expire_time),
                    ],
                )?;
            }
            DbCommand::DeleteLogin { user_id } => {
                tx.execute(
                    "DELETE FROM Login WHERE UserId = ?1",
                    params![uuid_column(user_id)],
                )?;
            }

            DbCommand::InsertFavorite(fav) => {
                tx.execute(
                    "INSERT INTO FavoriteServer (Address, Name, RaiseTime) VALUES (?1, ?2, ?3)",
                    params![fav.address, fav.name, timestamp_column(&fav.raise_time)],
                )?;
            }
            DbCommand::UpdateFavorite(fav) => {
                tx.execute(
                    "UPDATE FavoriteServer SET Name = ?2, RaiseTime = ?3 WHERE Address = ?1",
                    params![fav.address, fav.name, timestamp_column(&fav.raise_time)],
                )?;
            }
            DbCommand::DeleteFavorite { address } => {
                tx.execute(
                    "DELETE FROM FavoriteServer WHERE Address = ?1",
                    params![address],
                )?;
            }

            DbCommand::InsertEngineInstallation(engine) => {
                tx.execute(
                    "INSERT INTO EngineInstallation (Version, Signature) VALUES (?1, ?2)",
                    params![engine.version, engine.signature],
                )?;
            }
            DbCommand::UpdateEngineInstallation(engine) => {
                tx.execute(
                    "UPDATE EngineInstallation SET Signature = ?2 WHERE Version = ?1",
                    params![engine.version, engine.signature],
                )?;
            }
            DbCommand::DeleteEngineInstallation { version } => {
                tx.execute(
                    "DELETE FROM EngineInstallation WHERE Version = ?1",
                    params![version],
                )?;
            }

            DbCommand::InsertEngineModule(module) => {
                tx.execute(
                    "INSERT INTO EngineModule (Name, Version) VALUES (?1, ?2)",
                    params![module.name, module.version],
                )?;
            }
            DbCommand::DeleteEngineModule(module) => {
                tx.execute(
                    "DELETE FROM EngineModule WHERE Name = ?1 AND Version = ?2",
                    params![module.name, module.version],
                )?;
            }

            DbCommand::InsertFilter(filter) => {
                tx.execute(
                    "INSERT INTO ServerFilter (Category, Data) VALUES (?1, ?2)",
                    params![filter.category, filter.data],
                )?;
            }
            DbCommand::DeleteFilter(filter) => {
                tx.execute(
                    "DELETE FROM ServerFilter WHERE Category = ?1 AND Data = ?2",
                    params![filter.category, filter.data],
                )?;
            }
            DbCommand::ClearFilters => {
                tx.execute("DELETE FROM ServerFilter", [])?;
            }

            DbCommand::ClearHubs => {
                tx.execute("DELETE FROM Hub", [])?;
            }
            DbCommand::InsertHub(hub) => {
                tx.execute(
                    "INSERT INTO Hub (Address, Priority) VALUES (?1, ?2)",
                    params![hub.address.as_str(), hub.priority],
                )?;
            }

            DbCommand::UpsertPrivacyPolicy {
                identifier,
                version,
                at,
            } => {
                let at = timestamp_column(at);
                tx.execute(
                    "INSERT OR REPLACE INTO AcceptedPrivacyPolicy (Identifier, Version, AcceptedTime, LastConnected)
                     VALUES (?1, ?2, ?3, ?3)",
                    params![identifier, version, at],
                )?;
            }
            DbCommand::UpdatePrivacyPolicyVersion {
                identifier,
                version,
                at,
            } => {
                tx.execute(
                    "UPDATE AcceptedPrivacyPolicy SET Version = ?2, LastConnected = ?3 WHERE Identifier = ?1",
                    params![identifier, version, timestamp_column(at)],
                )?;
            }
            DbCommand::TouchPrivacyPolicy { identifier, at } => {
                tx.execute(
                    "UPDATE AcceptedPrivacyPolicy SET LastConnected = ?2 WHERE Identifier = ?1",
                    params![identifier, timestamp_column(at)],
                )?;
            }
        }
        Ok(())
    }
}
