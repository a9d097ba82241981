// ABOUTME: DataManager facade owning the setting registry, entity caches, and write-behind persistence.
// ABOUTME: Every effective mutation enqueues exactly one command; commit() flushes them in the background.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use launcherdb_core::{
    ACCOUNT_CVARS, AcceptedPrivacyPolicy, BASE_CVARS, CVarDef, CacheError, Change, ChangeKind,
    FavoriteServer, Hub, InstalledEngineModule, InstalledEngineVersion, LoginInfo, LoginToken,
    ObservableCache, RegistryError, ServerFilter, SettingChanged, SettingRegistry, SettingValue, Value,
    cvars,
};
use rusqlite::Connection;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::command::DbCommand;
use crate::config::StoreConfig;
use crate::load::{hydrate_settings, hydrate_settings_where, load_collections};
use crate::migrations::{EmbeddedMigrations, MigrationError, MigrationRunner, SETTINGS_MIGRATION_SET};
use crate::queue::CommandQueue;
use crate::writer::{CommitTicket, FlushWriter, StoreTarget, WriterError};

const FINGERPRINT_CHANNEL_CAPACITY: usize = 8;

/// Errors surfaced by DataManager operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("no saved login for account {0}")]
    ReferentialViolation(Uuid),

    #[error("migrations failed: {0}")]
    MigrationFailed(#[from] MigrationError),

    #[error("store write failed: {0}")]
    IoFailure(#[from] WriterError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("setting {key} does not hold a valid id: {value:?}")]
    InvalidId { key: &'static str, value: String },

    #[error("no tokio runtime available for the flush worker")]
    NoRuntime,
}

/// Owns all launcher state and its durable mirror.
pub struct DataManager {
    registry: SettingRegistry,
    logins: ObservableCache<LoginInfo>,
    favorites: ObservableCache<FavoriteServer>,
    engine_installations: ObservableCache<InstalledEngineVersion>,
    engine_modules: Vec<InstalledEngineModule>,
    filters: HashSet<ServerFilter>,
    hubs: Vec<Hub>,
    privacy_policies: HashMap<String, AcceptedPrivacyPolicy>,
    queue: CommandQueue,
    writer: FlushWriter,
    target: StoreTarget,
    active_account: Option<Uuid>,
    spoofed_fingerprint: Uuid,
    spoofed_changes: broadcast::Sender<Uuid>,
}

impl DataManager {
    /// Open the store described by `config` on the current tokio runtime.
    pub fn open(config: &StoreConfig) -> Result<Self, DataError> {
        let handle = Handle::try_current().map_err(|_| DataError::NoRuntime)?;
        Self::open_with(config, &EmbeddedMigrations, handle)
    }

    /// Open with an explicit migration runner and runtime handle.
    pub fn open_with(
        config: &StoreConfig,
        migrations: &dyn MigrationRunner,
        handle: Handle,
    ) -> Result<Self, DataError> {
        let mut registry = SettingRegistry::new();
        registry.register_table(BASE_CVARS, false)?;

        std::fs::create_dir_all(&config.home)?;
        let target = StoreTarget::new(config.db_path(), config.busy_timeout);
        let mut conn = target.open()?;
        migrations.migrate(&mut conn, SETTINGS_MIGRATION_SET)?;

        let settings = hydrate_settings(&conn, &mut registry)?;
        let loaded = load_collections(&conn)?;
        drop(conn);

        tracing::info!(
            path = %target.path.display(),
            settings = settings.loaded,
            unknown_settings = settings.unknown,
            skipped_settings = settings.skipped,
            logins = loaded.logins.len(),
            favorites = loaded.favorites.len(),
            "loaded launcher data"
        );

        let queue = CommandQueue::new();

        let mut logins = ObservableCache::new();
        logins.hydrate(loaded.logins);
        let mut favorites = ObservableCache::new();
        favorites.hydrate(loaded.favorites);
        let mut engine_installations = ObservableCache::new();
        engine_installations.hydrate(loaded.engine_installations);

        let mut hubs = loaded.hubs;
        hubs.sort_by_key(|hub| hub.priority);

        let listener_queue = queue.clone();
        registry.set_listener(Box::new(move |change: &SettingChanged| {
            listener_queue.push(DbCommand::UpsertConfig {
                key: change.key.clone(),
                value: change.value.clone(),
            });
        }));
        let listener_queue = queue.clone();
        logins.set_listener(Box::new(move |change: &Change<LoginInfo>| {
            listener_queue.push(DbCommand::for_login(change));
        }));
        let listener_queue = queue.clone();
        favorites.set_listener(Box::new(move |change: &Change<FavoriteServer>| {
            listener_queue.push(DbCommand::for_favorite(change));
        }));
        let listener_queue = queue.clone();
        engine_installations.set_listener(Box::new(
            move |change: &Change<InstalledEngineVersion>| {
                listener_queue.push(DbCommand::for_engine_installation(change));
            },
        ));

        let writer = FlushWriter::spawn(target.clone(), queue.clone(), handle);
        let (spoofed_changes, _) = broadcast::channel(FINGERPRINT_CHANNEL_CAPACITY);

        let mut manager = Self {
            registry,
            logins,
            favorites,
            engine_installations,
            engine_modules: loaded.engine_modules,
            filters: loaded.filters.into_iter().collect(),
            hubs,
            privacy_policies: loaded.privacy_policies,
            queue,
            writer,
            target,
            active_account: None,
            spoofed_fingerprint: Uuid::new_v4(),
            spoofed_changes,
        };

        // Loading must not write anything back.
        manager.queue.clear();

        manager.regenerate_spoofed_fingerprint();
        if manager.registry.get_cvar(&cvars::FINGERPRINT)?.is_empty() {
            let fingerprint = Uuid::new_v4().to_string();
            tracing::info!(fingerprint = %fingerprint, "generated launcher fingerprint");
            manager.registry.set_cvar(&cvars::FINGERPRINT, fingerprint)?;
        }
        drop(manager.commit());

        Ok(manager)
    }

    pub fn registry(&self) -> &SettingRegistry {
        &self.registry
    }

    pub fn get(&self, key: &str) -> Result<Value, DataError> {
        Ok(self.registry.get(key)?)
    }

    /// Returns false when the value was already current.
    pub fn set(&mut self, key: &str, value: Value) -> Result<bool, DataError> {
        Ok(self.registry.set(key, value)?)
    }

    pub fn get_cvar<T: SettingValue>(&self, def: &CVarDef<T>) -> Result<T, DataError> {
        Ok(self.registry.get_cvar(def)?)
    }

    pub fn set_cvar<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        value: T,
    ) -> Result<bool, DataError> {
        Ok(self.registry.set_cvar(def, value)?)
    }

    pub fn subscribe_cvar<T: SettingValue>(
        &self,
        def: &CVarDef<T>,
    ) -> Result<broadcast::Receiver<Value>, DataError> {
        Ok(self.registry.subscribe(def.name())?)
    }

    /// Register an extra setting. A newly created entry picks up the value
    /// already stored on disk, if any.
    pub fn register_cvar<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        overwrite: bool,
    ) -> Result<bool, DataError> {
        if !self.registry.register_def(def, overwrite)? {
            return Ok(false);
        }
        let conn = self.target.open()?;
        hydrate_settings_where(&conn, &mut self.registry, |key| key == def.name())?;
        Ok(true)
    }

    /// Register the per-account settings for each account. Newly created
    /// keys pick up any value already stored on disk.
    pub fn assign_account_cvars(
        &mut self,
        accounts: &[Uuid],
        overwrite: bool,
    ) -> Result<Vec<String>, DataError> {
        let written = self
            .registry
            .register_account_table(ACCOUNT_CVARS, accounts, overwrite)?;
        if written.is_empty() {
            return Ok(written);
        }

        let conn = self.target.open()?;
        let stats = hydrate_settings_where(&conn, &mut self.registry, |key| {
            written.iter().any(|w| w == key)
        })?;
        tracing::debug!(
            registered = written.len(),
            loaded = stats.loaded,
            "assigned account settings"
        );
        Ok(written)
    }

    /// Track the active account. A newly active account gets its settings
    /// registered without clobbering values already in memory.
    pub fn on_active_account_changed(&mut self, account: Option<Uuid>) -> Result<(), DataError> {
        self.active_account = account;
        let Some(account) = account else {
            return Ok(());
        };

        self.assign_account_cvars(&[account], false)?;
        if self.registry.get_cvar(&cvars::SPOOF_FINGERPRINT_ON_LOGIN)? {
            self.regenerate_spoofed_fingerprint();
        }
        Ok(())
    }

    pub fn active_account(&self) -> Option<Uuid> {
        self.active_account
    }

    pub fn get_account_cvar<T: SettingValue>(
        &self,
        def: &CVarDef<T>,
        account: Uuid,
    ) -> Result<T, DataError> {
        Ok(self.registry.get_account(def, account)?)
    }

    pub fn get_account_cvar_or_default<T: SettingValue>(
        &self,
        def: &CVarDef<T>,
        account: Option<Uuid>,
    ) -> T {
        self.registry.get_account_or_default(def, account)
    }

    pub fn get_active_account_cvar_or_default<T: SettingValue>(&self, def: &CVarDef<T>) -> T {
        self.registry.get_account_or_default(def, self.active_account)
    }

    pub fn set_account_cvar<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        account: Uuid,
        value: T,
    ) -> Result<bool, DataError> {
        Ok(self.registry.set_account(def, account, value)?)
    }

    /// Set the active account's variant. Returns false when no account is active.
    pub fn try_set_active_account_cvar<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        value: T,
    ) -> Result<bool, DataError> {
        match self.active_account {
            Some(account) => {
                self.set_account_cvar(def, account, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the account's HWID seed with a fresh random value.
    pub fn regenerate_hwid_seed(&mut self, account: Uuid) -> Result<i64, DataError> {
        let seed: i64 = rand::random();
        self.set_account_cvar(
            &launcherdb_core::account_cvars::SPOOFED_HWID_SEED,
            account,
            seed,
        )?;
        Ok(seed)
    }

    pub fn selected_login_id(&self) -> Result<Option<Uuid>, DataError> {
        let raw = self.registry.get_cvar(&cvars::SELECTED_LOGIN)?;
        parse_optional_id(cvars::SELECTED_LOGIN.name(), raw)
    }

    /// Select a saved login (or clear the selection) and commit.
    pub fn set_selected_login_id(&mut self, id: Option<Uuid>) -> Result<CommitTicket, DataError> {
        if let Some(id) = id {
            if !self.logins.contains(&id) {
                return Err(DataError::ReferentialViolation(id));
            }
        }
        let raw = id.map(|id| id.to_string()).unwrap_or_default();
        self.registry.set_cvar(&cvars::SELECTED_LOGIN, raw)?;
        Ok(self.commit())
    }

    /// The persistent install fingerprint.
    pub fn fingerprint(&self) -> Result<Uuid, DataError> {
        let raw = self.registry.get_cvar(&cvars::FINGERPRINT)?;
        parse_optional_id(cvars::FINGERPRINT.name(), raw.clone())?.ok_or(DataError::InvalidId {
            key: cvars::FINGERPRINT.name(),
            value: raw,
        })
    }

    pub fn spoofed_fingerprint(&self) -> Uuid {
        self.spoofed_fingerprint
    }

    pub fn regenerate_spoofed_fingerprint(&mut self) -> Uuid {
        self.spoofed_fingerprint = Uuid::new_v4();
        // No subscribers is fine
        let _ = self.spoofed_changes.send(self.spoofed_fingerprint);
        self.spoofed_fingerprint
    }

    pub fn subscribe_spoofed_fingerprint(&self) -> broadcast::Receiver<Uuid> {
        self.spoofed_changes.subscribe()
    }

    /// The fingerprint to present: spoofed when `SpoofFingerprint` is on.
    pub fn dynamic_fingerprint(&self) -> Result<Uuid, DataError> {
        if self.registry.get_cvar(&cvars::PASS_SPOOFED_FINGERPRINT)? {
            Ok(self.spoofed_fingerprint)
        } else {
            self.fingerprint()
        }
    }

    pub fn add_login(&mut self, login: LoginInfo) -> Result<(), DataError> {
        Ok(self.logins.add(login)?)
    }

    /// Remove a login, clearing the selection when it pointed at it.
    pub fn remove_login(&mut self, user_id: Uuid) -> Result<Option<LoginInfo>, DataError> {
        // A selection that is not a valid id never matches.
        let selected = self.registry.get_cvar(&cvars::SELECTED_LOGIN)?;
        let was_selected = Uuid::parse_str(selected.trim()).ok() == Some(user_id);

        let Some(removed) = self.logins.remove(&user_id) else {
            return Ok(None);
        };
        if was_selected {
            drop(self.set_selected_login_id(None)?);
        }
        Ok(Some(removed))
    }

    /// Returns whether the stored token changed.
    pub fn update_login_token(&mut self, user_id: Uuid, token: LoginToken) -> Result<bool, DataError> {
        let changed = self.logins.modify(&user_id, |login| login.token = token)?;
        Ok(changed.unwrap_or(false))
    }

    pub fn login(&self, user_id: Uuid) -> Option<&LoginInfo> {
        self.logins.get(&user_id)
    }

    pub fn logins(&self) -> Vec<LoginInfo> {
        self.logins.items()
    }

    pub fn subscribe_logins(&self) -> broadcast::Receiver<Change<LoginInfo>> {
        self.logins.subscribe()
    }

    /// Add a favorite whose address is not a favorite yet.
    pub fn add_favorite_server(&mut self, server: FavoriteServer) -> Result<(), DataError> {
        Ok(self.favorites.add(server)?)
    }

    pub fn update_favorite_server(&mut self, server: FavoriteServer) -> ChangeKind {
        self.favorites.add_or_update(server)
    }

    pub fn remove_favorite_server(&mut self, address: &str) -> Option<FavoriteServer> {
        self.favorites.remove(&address.to_string())
    }

    /// Move a favorite to the top by stamping it with the current time.
    pub fn raise_favorite_server(&mut self, address: &str) -> Result<bool, DataError> {
        let now = Utc::now();
        let changed = self
            .favorites
            .modify(&address.to_string(), |server| server.raise_time = now)?;
        Ok(changed.unwrap_or(false))
    }

    /// Favorites, most recently raised first.
    pub fn favorite_servers(&self) -> Vec<FavoriteServer> {
        let mut servers = self.favorites.items();
        servers.sort_by(|a, b| {
            b.raise_time
                .cmp(&a.raise_time)
                .then_with(|| a.address.cmp(&b.address))
        });
        servers
    }

    pub fn subscribe_favorites(&self) -> broadcast::Receiver<Change<FavoriteServer>> {
        self.favorites.subscribe()
    }

    pub fn add_engine_installation(&mut self, engine: InstalledEngineVersion) -> ChangeKind {
        self.engine_installations.add_or_update(engine)
    }

    pub fn remove_engine_installation(&mut self, version: &str) -> Option<InstalledEngineVersion> {
        self.engine_installations.remove(&version.to_string())
    }

    pub fn engine_installations(&self) -> Vec<InstalledEngineVersion> {
        self.engine_installations.items()
    }

    pub fn subscribe_engine_installations(
        &self,
    ) -> broadcast::Receiver<Change<InstalledEngineVersion>> {
        self.engine_installations.subscribe()
    }

    /// Returns false when the module is already recorded.
    pub fn add_engine_module(&mut self, module: InstalledEngineModule) -> bool {
        if self.engine_modules.contains(&module) {
            return false;
        }
        self.queue.push(DbCommand::InsertEngineModule(module.clone()));
        self.engine_modules.push(module);
        true
    }

    pub fn remove_engine_module(&mut self, module: &InstalledEngineModule) -> bool {
        let Some(index) = self.engine_modules.iter().position(|m| m == module) else {
            return false;
        };
        let removed = self.engine_modules.remove(index);
        self.queue.push(DbCommand::DeleteEngineModule(removed));
        true
    }

    pub fn engine_modules(&self) -> &[InstalledEngineModule] {
        &self.engine_modules
    }

    pub fn add_filter(&mut self, filter: ServerFilter) -> bool {
        if !self.filters.insert(filter.clone()) {
            return false;
        }
        self.queue.push(DbCommand::InsertFilter(filter));
        true
    }

    pub fn remove_filter(&mut self, filter: &ServerFilter) -> bool {
        if !self.filters.remove(filter) {
            return false;
        }
        self.queue.push(DbCommand::DeleteFilter(filter.clone()));
        true
    }

    pub fn clear_filters(&mut self) {
        if self.filters.is_empty() {
            return;
        }
        self.filters.clear();
        self.queue.push(DbCommand::ClearFilters);
    }

    pub fn has_filter(&self, filter: &ServerFilter) -> bool {
        self.filters.contains(filter)
    }

    pub fn filters(&self) -> Vec<ServerFilter> {
        let mut filters: Vec<ServerFilter> = self.filters.iter().cloned().collect();
        filters.sort_by(|a, b| (&a.category, &a.data).cmp(&(&b.category, &b.data)));
        filters
    }

    /// Saved hubs in priority order.
    pub fn hubs(&self) -> &[Hub] {
        &self.hubs
    }

    /// Replace the saved hub list and commit.
    pub fn set_hubs(&mut self, hubs: Vec<Hub>) -> Result<CommitTicket, DataError> {
        let mut seen = HashSet::new();
        for hub in &hubs {
            if !seen.insert(hub.address.as_str()) {
                return Err(CacheError::DuplicateKey(hub.address.to_string()).into());
            }
        }

        let mut hubs = hubs;
        hubs.sort_by_key(|hub| hub.priority);

        self.queue.push(DbCommand::ClearHubs);
        for hub in &hubs {
            self.queue.push(DbCommand::InsertHub(hub.clone()));
        }
        self.hubs = hubs;
        Ok(self.commit())
    }

    // A saved list always includes the stock hub once edited.
    pub fn has_custom_hubs(&self) -> bool {
        self.hubs.len() > 1
    }

    /// The accepted version of a policy, if any.
    pub fn has_accepted_privacy_policy(&self, identifier: &str) -> Option<&str> {
        self.privacy_policies
            .get(identifier)
            .map(|policy| policy.version.as_str())
    }

    pub fn privacy_policy(&self, identifier: &str) -> Option<&AcceptedPrivacyPolicy> {
        self.privacy_policies.get(identifier)
    }

    pub fn accept_privacy_policy(&mut self, identifier: &str, version: &str) {
        let now = Utc::now();
        match self.privacy_policies.get_mut(identifier) {
            Some(policy) => {
                policy.version = version.to_string();
                policy.last_connected = now;
                self.queue.push(DbCommand::UpdatePrivacyPolicyVersion {
                    identifier: identifier.to_string(),
                    version: version.to_string(),
                    at: now,
                });
            }
            None => {
                self.privacy_policies.insert(
                    identifier.to_string(),
                    AcceptedPrivacyPolicy {
                        identifier: identifier.to_string(),
                        version: version.to_string(),
                        accepted_time: now,
                        last_connected: now,
                    },
                );
                self.queue.push(DbCommand::UpsertPrivacyPolicy {
                    identifier: identifier.to_string(),
                    version: version.to_string(),
                    at: now,
                });
            }
        }
    }

    /// Record a connection to a server under an accepted policy.
    /// Returns false when the policy was never accepted.
    pub fn update_connected_to_privacy_policy(&mut self, identifier: &str) -> bool {
        let Some(policy) = self.privacy_policies.get_mut(identifier) else {
            return false;
        };
        let now = Utc::now();
        policy.last_connected = now;
        self.queue.push(DbCommand::TouchPrivacyPolicy {
            identifier: identifier.to_string(),
            at: now,
        });
        true
    }

    /// Queue a raw command for the next commit.
    pub fn enqueue(&self, command: DbCommand) {
        self.queue.push(command);
    }

    pub fn pending_commands(&self) -> Vec<DbCommand> {
        self.queue.snapshot()
    }

    /// Flush pending commands in the background.
    pub fn commit(&self) -> CommitTicket {
        self.writer.commit()
    }

    /// Flush everything and wait for the disk to catch up.
    pub async fn shutdown(&self) -> Result<usize, DataError> {
        let written = self.writer.shutdown().await?;
        tracing::info!(written, "launcher data flushed");
        Ok(written)
    }

    /// Blocking `shutdown` for callers outside the runtime.
    pub fn shutdown_blocking(&self) -> Result<usize, DataError> {
        let written = self.writer.shutdown_blocking()?;
        tracing::info!(written, "launcher data flushed");
        Ok(written)
    }

    /// Open a fresh connection to the store file, for read-only inspection.
    pub fn connection(&self) -> Result<Connection, DataError> {
        Ok(self.target.open()?)
    }
}

fn parse_optional_id(key: &'static str, raw: String) -> Result<Option<Uuid>, DataError> {
    if raw.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(&raw)
        .map(Some)
        .map_err(|_| DataError::InvalidId { key, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use launcherdb_core::account_cvars;
    use tempfile::TempDir;
    use url::Url;

    fn open(dir: &TempDir) -> DataManager {
        DataManager::open(&StoreConfig::in_dir(dir.path())).unwrap()
    }

    fn login(name: &str) -> LoginInfo {
        LoginInfo {
            user_id: Uuid::new_v4(),
            username: name.to_string(),
            token: LoginToken::new("token", Utc::now() + Duration::days(30)),
        }
    }

    fn t(hour: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn fresh_store_gets_a_fingerprint() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let fingerprint = manager.fingerprint().unwrap();
        assert!(manager.pending_commands().is_empty());
        manager.shutdown().await.unwrap();
        drop(manager);

        let reopened = open(&dir);
        assert_eq!(reopened.fingerprint().unwrap(), fingerprint);
    }

    #[tokio::test]
    async fn reopening_enqueues_nothing() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        manager.add_login(login("alice")).unwrap();
        manager.add_filter(ServerFilter::new("language", "en"));
        manager.set_cvar(&cvars::COMPAT_MODE, true).unwrap();
        manager.shutdown().await.unwrap();
        drop(manager);

        let reopened = open(&dir);
        assert!(reopened.pending_commands().is_empty());
        assert_eq!(reopened.logins().len(), 1);
        assert!(reopened.has_filter(&ServerFilter::new("language", "en")));
    }

    #[tokio::test]
    async fn compat_mode_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        manager.set_cvar(&cvars::COMPAT_MODE, true).unwrap();
        assert_eq!(manager.commit().wait().await.unwrap(), 1);
        manager.shutdown().await.unwrap();
        drop(manager);

        let reopened = open(&dir);
        assert!(reopened.get_cvar(&cvars::COMPAT_MODE).unwrap());
    }

    #[tokio::test]
    async fn identical_sets_enqueue_once() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        assert!(manager.set_cvar(&cvars::ALLOW_HWID, true).unwrap());
        assert!(!manager.set_cvar(&cvars::ALLOW_HWID, true).unwrap());
        assert_eq!(
            manager.pending_commands(),
            vec![DbCommand::UpsertConfig {
                key: "AllowHwid".to_string(),
                value: Value::Bool(true),
            }]
        );
    }

    #[tokio::test]
    async fn wrong_type_set_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let err = manager.set("CompatMode", Value::Long(1)).unwrap_err();
        assert!(matches!(
            err,
            DataError::Registry(RegistryError::TypeMismatch { .. })
        ));
        assert!(manager.pending_commands().is_empty());
    }

    #[tokio::test]
    async fn favorite_add_then_update_is_two_commands() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        manager.update_favorite_server(FavoriteServer::new("foo:1234", Some("A".into()), t(0)));
        manager.update_favorite_server(FavoriteServer::new("foo:1234", Some("B".into()), t(1)));

        let favorites = manager.favorite_servers();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].name.as_deref(), Some("B"));
        assert_eq!(favorites[0].raise_time, t(1));

        let pending = manager.pending_commands();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].label(), "insert_favorite");
        assert_eq!(pending[1].label(), "update_favorite");

        assert_eq!(manager.commit().wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn strict_favorite_add_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        manager
            .add_favorite_server(FavoriteServer::new("foo:1234", Some("A".into()), t(0)))
            .unwrap();

        let err = manager
            .add_favorite_server(FavoriteServer::new("foo:1234", Some("B".into()), t(1)))
            .unwrap_err();
        assert!(matches!(err, DataError::Cache(CacheError::DuplicateKey(_))));
        assert_eq!(manager.favorite_servers()[0].name.as_deref(), Some("A"));
        assert_eq!(manager.pending_commands().len(), 1);
    }

    #[tokio::test]
    async fn raising_a_favorite_updates_its_time() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        manager.update_favorite_server(FavoriteServer::new("old:1", None, t(0)));
        manager.update_favorite_server(FavoriteServer::new("new:1", None, t(5)));
        manager.commit().wait().await.unwrap();

        assert!(manager.raise_favorite_server("old:1").unwrap());
        assert!(!manager.raise_favorite_server("missing:1").unwrap());
        assert_eq!(manager.favorite_servers()[0].address, "old:1");

        let pending = manager.pending_commands();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].label(), "update_favorite");
    }

    #[tokio::test]
    async fn selecting_unknown_login_fails() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let stranger = Uuid::new_v4();
        let err = manager.set_selected_login_id(Some(stranger)).unwrap_err();
        assert!(matches!(err, DataError::ReferentialViolation(id) if id == stranger));
        assert_eq!(manager.selected_login_id().unwrap(), None);
        assert!(manager.pending_commands().is_empty());
    }

    #[tokio::test]
    async fn removing_selected_login_clears_selection() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let alice = login("alice");
        let id = alice.user_id;
        manager.add_login(alice).unwrap();
        manager.set_selected_login_id(Some(id)).unwrap().wait().await.unwrap();
        assert_eq!(manager.selected_login_id().unwrap(), Some(id));

        let removed = manager.remove_login(id).unwrap().unwrap();
        assert_eq!(removed.username, "alice");
        assert_eq!(manager.selected_login_id().unwrap(), None);

        manager.shutdown().await.unwrap();
        drop(manager);
        let reopened = open(&dir);
        assert!(reopened.logins().is_empty());
        assert_eq!(reopened.selected_login_id().unwrap(), None);
    }

    #[tokio::test]
    async fn token_updates_go_through_modify() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let alice = login("alice");
        let id = alice.user_id;
        manager.add_login(alice.clone()).unwrap();
        manager.commit().wait().await.unwrap();

        assert!(!manager.update_login_token(id, alice.token.clone()).unwrap());
        let fresh = LoginToken::new("refreshed", Utc::now() + Duration::days(60));
        assert!(manager.update_login_token(id, fresh.clone()).unwrap());
        assert_eq!(manager.pending_commands().len(), 1);
        manager.shutdown().await.unwrap();
        drop(manager);

        let reopened = open(&dir);
        assert_eq!(reopened.login(id).unwrap().token.token, "refreshed");
    }

    #[tokio::test]
    async fn account_settings_load_when_account_becomes_active() {
        let dir = TempDir::new().unwrap();
        let account = Uuid::new_v4();
        let mut manager = open(&dir);
        manager.on_active_account_changed(Some(account)).unwrap();
        assert_eq!(
            manager.get_active_account_cvar_or_default(&account_cvars::SPOOFED_HWID_SEED),
            1
        );
        let seed = manager.regenerate_hwid_seed(account).unwrap();
        manager.shutdown().await.unwrap();
        drop(manager);

        let mut reopened = open(&dir);
        assert_eq!(
            reopened.get_active_account_cvar_or_default(&account_cvars::SPOOFED_HWID_SEED),
            1
        );
        reopened.on_active_account_changed(Some(account)).unwrap();
        assert_eq!(
            reopened
                .get_account_cvar(&account_cvars::SPOOFED_HWID_SEED, account)
                .unwrap(),
            seed
        );
        assert!(reopened.pending_commands().is_empty());
    }

    #[tokio::test]
    async fn active_account_change_keeps_unsaved_values() {
        let dir = TempDir::new().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut manager = open(&dir);
        manager.on_active_account_changed(Some(first)).unwrap();
        assert!(manager
            .try_set_active_account_cvar(&account_cvars::SPOOFED_HWID_SEED, 42)
            .unwrap());

        manager.on_active_account_changed(Some(second)).unwrap();
        manager.on_active_account_changed(Some(first)).unwrap();
        assert_eq!(
            manager
                .get_account_cvar(&account_cvars::SPOOFED_HWID_SEED, first)
                .unwrap(),
            42
        );

        manager.on_active_account_changed(None).unwrap();
        assert!(!manager
            .try_set_active_account_cvar(&account_cvars::SPOOFED_HWID_SEED, 7)
            .unwrap());
    }

    #[tokio::test]
    async fn dynamic_fingerprint_follows_spoof_setting() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let real = manager.fingerprint().unwrap();
        assert_eq!(manager.dynamic_fingerprint().unwrap(), real);

        manager
            .set_cvar(&cvars::PASS_SPOOFED_FINGERPRINT, true)
            .unwrap();
        let mut rx = manager.subscribe_spoofed_fingerprint();
        let spoofed = manager.regenerate_spoofed_fingerprint();
        assert_eq!(rx.try_recv().unwrap(), spoofed);
        assert_eq!(manager.dynamic_fingerprint().unwrap(), spoofed);
        assert_ne!(spoofed, real);
    }

    #[tokio::test]
    async fn hubs_are_replaced_and_ordered() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let hub = |addr: &str, priority| Hub::new(Url::parse(addr).unwrap(), priority);

        manager
            .set_hubs(vec![hub("https://b.example/", 1), hub("https://a.example/", 0)])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(manager.has_custom_hubs());
        manager
            .set_hubs(vec![hub("https://c.example/", 0)])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(!manager.has_custom_hubs());

        let err = manager
            .set_hubs(vec![hub("https://d.example/", 0), hub("https://d.example/", 1)])
            .unwrap_err();
        assert!(matches!(err, DataError::Cache(CacheError::DuplicateKey(_))));

        manager.shutdown().await.unwrap();
        drop(manager);
        let reopened = open(&dir);
        let addresses: Vec<&str> = reopened.hubs().iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addresses, vec!["https://c.example/"]);
    }

    #[tokio::test]
    async fn modules_and_filters_are_sets() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let module = InstalledEngineModule {
            name: "WebView".to_string(),
            version: "1.0".to_string(),
        };
        assert!(manager.add_engine_module(module.clone()));
        assert!(!manager.add_engine_module(module.clone()));
        assert!(manager.add_filter(ServerFilter::new("region", "eu")));
        assert!(!manager.add_filter(ServerFilter::new("region", "eu")));
        assert_eq!(manager.pending_commands().len(), 2);
        manager.commit().wait().await.unwrap();

        assert!(manager.remove_engine_module(&module));
        manager.clear_filters();
        manager.clear_filters();
        assert_eq!(manager.pending_commands().len(), 2);
        manager.shutdown().await.unwrap();
        drop(manager);

        let reopened = open(&dir);
        assert!(reopened.engine_modules().is_empty());
        assert!(reopened.filters().is_empty());
    }

    #[tokio::test]
    async fn engine_installations_persist() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let mut rx = manager.subscribe_engine_installations();
        let engine = InstalledEngineVersion {
            version: "0.9.1".to_string(),
            signature: vec![7, 7, 7],
        };
        assert_eq!(manager.add_engine_installation(engine.clone()), ChangeKind::Added);
        assert_eq!(rx.try_recv().unwrap(), Change::Added(engine.clone()));
        manager.shutdown().await.unwrap();
        drop(manager);

        let mut reopened = open(&dir);
        assert_eq!(reopened.engine_installations(), vec![engine]);
        assert!(reopened.remove_engine_installation("0.9.1").is_some());
        assert!(reopened.remove_engine_installation("0.9.1").is_none());
    }

    #[tokio::test]
    async fn privacy_policies_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        assert!(!manager.update_connected_to_privacy_policy("wizden"));
        manager.accept_privacy_policy("wizden", "v1");
        manager.accept_privacy_policy("wizden", "v2");
        assert!(manager.update_connected_to_privacy_policy("wizden"));
        assert_eq!(manager.pending_commands().len(), 3);
        manager.shutdown().await.unwrap();
        drop(manager);

        let reopened = open(&dir);
        assert_eq!(reopened.has_accepted_privacy_policy("wizden"), Some("v2"));
        assert_eq!(reopened.has_accepted_privacy_policy("other"), None);
        let policy = reopened.privacy_policy("wizden").unwrap();
        assert!(policy.last_connected >= policy.accepted_time);
    }

    static LAST_SERVER: CVarDef<Uuid> = CVarDef::new("LastServerId", Uuid::nil);
    static LAST_LAUNCH: CVarDef<chrono::DateTime<Utc>> =
        CVarDef::new("LastLaunch", chrono::DateTime::<Utc>::default);
    static NEWS_FEED: CVarDef<Url> = CVarDef::new("NewsFeed", || {
        Url::parse("https://news.example.org/").unwrap()
    });

    fn register_extra(manager: &mut DataManager) {
        assert!(manager.register_cvar(&LAST_SERVER, false).unwrap());
        assert!(manager.register_cvar(&LAST_LAUNCH, false).unwrap());
        assert!(manager.register_cvar(&NEWS_FEED, false).unwrap());
    }

    #[tokio::test]
    async fn uuid_timestamp_and_uri_settings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        register_extra(&mut manager);
        assert_eq!(manager.get_cvar(&LAST_SERVER).unwrap(), Uuid::nil());
        assert!(!manager.register_cvar(&LAST_SERVER, false).unwrap());

        let server = Uuid::new_v4();
        let launched = Utc::now();
        let feed = Url::parse("https://feed.example.org/launcher?lang=en").unwrap();
        manager.set_cvar(&LAST_SERVER, server).unwrap();
        manager.set_cvar(&LAST_LAUNCH, launched).unwrap();
        manager.set_cvar(&NEWS_FEED, feed.clone()).unwrap();
        assert_eq!(manager.commit().wait().await.unwrap(), 3);
        manager.shutdown().await.unwrap();
        drop(manager);

        let mut reopened = open(&dir);
        register_extra(&mut reopened);
        assert!(reopened.pending_commands().is_empty());
        assert_eq!(reopened.get_cvar(&LAST_SERVER).unwrap(), server);
        assert_eq!(reopened.get_cvar(&LAST_LAUNCH).unwrap(), launched);
        assert_eq!(reopened.get_cvar(&NEWS_FEED).unwrap(), feed);
    }

    #[tokio::test]
    async fn removing_login_with_garbled_selection_still_removes() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        let alice = login("alice");
        let id = alice.user_id;
        manager.add_login(alice).unwrap();
        manager
            .set_cvar(&cvars::SELECTED_LOGIN, "not-a-uuid".to_string())
            .unwrap();

        assert!(manager.remove_login(id).unwrap().is_some());
        assert!(manager.login(id).is_none());
        assert_eq!(
            manager.get_cvar(&cvars::SELECTED_LOGIN).unwrap(),
            "not-a-uuid"
        );
    }

    #[tokio::test]
    async fn failed_commit_keeps_commands_pending() {
        let dir = TempDir::new().unwrap();
        let mut manager = open(&dir);
        manager.set_cvar(&cvars::COMPAT_MODE, true).unwrap();
        let filter = ServerFilter::new("language", "en");
        manager.enqueue(DbCommand::InsertFilter(filter.clone()));
        manager.enqueue(DbCommand::InsertFilter(filter));

        let err = manager.commit().wait().await.unwrap_err();
        assert!(matches!(err, WriterError::Sqlite(_)));
        assert_eq!(manager.pending_commands().len(), 3);

        let conn = manager.connection().unwrap();
        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM Config WHERE Key = 'CompatMode'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, 0);
    }

    struct BrokenMigrations;

    impl MigrationRunner for BrokenMigrations {
        fn migrate(&self, _conn: &mut Connection, set: &str) -> Result<(), MigrationError> {
            Err(MigrationError::UnknownSet(set.to_string()))
        }
    }

    #[tokio::test]
    async fn failed_migrations_abort_open() {
        let dir = TempDir::new().unwrap();
        let result = DataManager::open_with(
            &StoreConfig::in_dir(dir.path()),
            &BrokenMigrations,
            Handle::current(),
        );
        assert!(matches!(result, Err(DataError::MigrationFailed(_))));
    }

    #[test]
    fn open_without_runtime_fails() {
        let dir = TempDir::new().unwrap();
        let result = DataManager::open(&StoreConfig::in_dir(dir.path()));
        assert!(matches!(result, Err(DataError::NoRuntime)));
    }

    #[test]
    fn blocking_shutdown_drains() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::in_dir(dir.path());

        let mut manager =
            DataManager::open_with(&config, &EmbeddedMigrations, rt.handle().clone()).unwrap();
        manager.set_cvar(&cvars::START_LOGGED_IN, true).unwrap();
        manager.shutdown_blocking().unwrap();
        drop(manager);

        let reopened =
            DataManager::open_with(&config, &EmbeddedMigrations, rt.handle().clone()).unwrap();
        assert!(reopened.get_cvar(&cvars::START_LOGGED_IN).unwrap());
    }
}
