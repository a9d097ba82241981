// ABOUTME: Reads persisted rows back into memory during bootstrap.
// ABOUTME: Config values are decoded with the codec of each key's registered type; bad rows are skipped.

use std::collections::HashMap;

use launcherdb_core::{
    AcceptedPrivacyPolicy, FavoriteServer, Hub, InstalledEngineModule, InstalledEngineVersion,
    LoginInfo, LoginToken, ServerFilter, SettingRegistry,
};
use rusqlite::{Connection, params};

use crate::codec::{decode_value, read_timestamp, read_uri, read_uuid};

/// Everything stored outside the Config table.
#[derive(Debug, Default)]
pub struct LoadedCollections {
    pub logins: Vec<LoginInfo>,
    pub favorites: Vec<FavoriteServer>,
    pub engine_installations: Vec<InstalledEngineVersion>,
    pub engine_modules: Vec<InstalledEngineModule>,
    pub filters: Vec<ServerFilter>,
    pub hubs: Vec<Hub>,
    pub privacy_policies: HashMap<String, AcceptedPrivacyPolicy>,
}

/// Counts reported by `hydrate_settings`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SettingsLoad {
    pub loaded: usize,
    pub unknown: usize,
    pub skipped: usize,
}

/// Load Config rows into the registry without raising change events.
/// Rows for unregistered keys are ignored.
pub fn hydrate_settings(
    conn: &Connection,
    registry: &mut SettingRegistry,
) -> Result<SettingsLoad, rusqlite::Error> {
    hydrate_settings_where(conn, registry, |_| true)
}

/// Like `hydrate_settings`, limited to keys accepted by `wanted`.
pub fn hydrate_settings_where(
    conn: &Connection,
    registry: &mut SettingRegistry,
    wanted: impl Fn(&str) -> bool,
) -> Result<SettingsLoad, rusqlite::Error> {
    let mut stats = SettingsLoad::default();
    let mut stmt = conn.prepare("SELECT Key, Value FROM Config")?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        if !wanted(&key) {
            continue;
        }
        let Some(tag) = registry.tag_of(&key) else {
            stats.unknown += 1;
            continue;
        };

        let value = match decode_value(tag, row.get_ref(1)?) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "skipping undecodable setting");
                stats.skipped += 1;
                continue;
            }
        };

        match registry.hydrate(&key, value) {
            Ok(_) => stats.loaded += 1,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "skipping setting");
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

/// Read every entity table.
pub fn load_collections(conn: &Connection) -> Result<LoadedCollections, rusqlite::Error> {
    Ok(LoadedCollections {
        logins: load_logins(conn)?,
        favorites: load_favorites(conn)?,
        engine_installations: load_engine_installations(conn)?,
        engine_modules: load_engine_modules(conn)?,
        filters: load_filters(conn)?,
        hubs: load_hubs(conn)?,
        privacy_policies: load_privacy_policies(conn)?,
    })
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![], map)?;
    rows.collect()
}

pub fn load_logins(conn: &Connection) -> Result<Vec<LoginInfo>, rusqlite::Error> {
    collect(conn, "SELECT UserId, UserName, Token, Expires FROM Login", |row| {
        Ok(LoginInfo {
            user_id: read_uuid(row, 0)?,
            username: row.get(1)?,
            token: LoginToken::new(row.get::<_, String>(2)?, read_timestamp(row, 3)?),
        })
    })
}

pub fn load_favorites(conn: &Connection) -> Result<Vec<FavoriteServer>, rusqlite::Error> {
    collect(conn, "SELECT Address, Name, RaiseTime FROM FavoriteServer", |row| {
        Ok(FavoriteServer::new(
            row.get::<_, String>(0)?,
            row.get(1)?,
            read_timestamp(row, 2)?,
        ))
    })
}

pub fn load_engine_installations(
    conn: &Connection,
) -> Result<Vec<InstalledEngineVersion>, rusqlite::Error> {
    collect(conn, "SELECT Version, Signature FROM EngineInstallation", |row| {
        Ok(InstalledEngineVersion {
            version: row.get(0)?,
            signature: row.get(1)?,
        })
    })
}

pub fn load_engine_modules(
    conn: &Connection,
) -> Result<Vec<InstalledEngineModule>, rusqlite::Error> {
    collect(conn, "SELECT Name, Version FROM EngineModule", |row| {
        Ok(InstalledEngineModule {
            name: row.get(0)?,
            version: row.get(1)?,
        })
    })
}

pub fn load_filters(conn: &Connection) -> Result<Vec<ServerFilter>, rusqlite::Error> {
    collect(conn, "SELECT Category, Data FROM ServerFilter", |row| {
        Ok(ServerFilter::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })
}

/// Hubs ordered by priority.
pub fn load_hubs(conn: &Connection) -> Result<Vec<Hub>, rusqlite::Error> {
    collect(conn, "SELECT Address, Priority FROM Hub ORDER BY Priority", |row| {
        Ok(Hub::new(read_uri(row, 0)?, row.get(1)?))
    })
}

pub fn load_privacy_policies(
    conn: &Connection,
) -> Result<HashMap<String, AcceptedPrivacyPolicy>, rusqlite::Error> {
    let policies = collect(
        conn,
        "SELECT Identifier, Version, AcceptedTime, LastConnected FROM AcceptedPrivacyPolicy",
        |row| {
            Ok(AcceptedPrivacyPolicy {
                identifier: row.get(0)?,
                version: row.get(1)?,
                accepted_time: read_timestamp(row, 2)?,
                last_connected: read_timestamp(row, 3)?,
            })
        },
    )?;
    Ok(policies
        .into_iter()
        .map(|policy| (policy.identifier.clone(), policy))
        .collect())
}
