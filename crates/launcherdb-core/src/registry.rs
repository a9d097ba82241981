// ABOUTME: Typed setting registry holding every CVar entry with its default, current value, and change stream.
// ABOUTME: Account-scoped accessors derive a namespaced key and delegate to the same register/get/set primitives.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cvar::{CVarDef, Definition, account_key};
use crate::value::{SettingValue, TypeTag, Value};

/// Capacity of each per-setting broadcast channel.
const SETTING_CHANNEL_CAPACITY: usize = 16;

/// Errors raised by registry reads and writes.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("setting not registered: {0}")]
    NotRegistered(String),

    #[error("type mismatch for setting {key}: registered as {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: TypeTag,
        actual: TypeTag,
    },
}

/// Immutable snapshot of a setting change, handed to the registry listener.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChanged {
    pub key: String,
    pub value: Value,
}

/// Callback invoked synchronously for every effective `set`.
pub type SettingListener = Box<dyn Fn(&SettingChanged) + Send + Sync>;

/// One registered setting.
pub struct SettingEntry {
    key: String,
    tag: TypeTag,
    default: Value,
    current: Value,
    changes: broadcast::Sender<Value>,
}

impl SettingEntry {
    fn new(key: String, tag: TypeTag, default: Value) -> Self {
        let (changes, _) = broadcast::channel(SETTING_CHANNEL_CAPACITY);
        Self {
            key,
            tag,
            current: default.clone(),
            default,
            changes,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn current(&self) -> &Value {
        &self.current
    }
}

/// Holds all scalar configuration entries keyed by their string identifier.
#[derive(Default)]
pub struct SettingRegistry {
    entries: HashMap<String, SettingEntry>,
    listener: Option<SettingListener>,
}

impl SettingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the listener that observes every effective change.
    /// Replaces any previous listener.
    pub fn set_listener(&mut self, listener: SettingListener) {
        self.listener = Some(listener);
    }

    /// Create an entry for `key`. When the key already exists, `overwrite`
    /// replaces it (resetting the value to `default`); otherwise the existing
    /// entry is left untouched. Returns whether an entry was written.
    pub fn register(
        &mut self,
        key: &str,
        tag: TypeTag,
        default: Value,
        overwrite: bool,
    ) -> Result<bool, RegistryError> {
        if default.tag() != tag {
            return Err(RegistryError::TypeMismatch {
                key: key.to_string(),
                expected: tag,
                actual: default.tag(),
            });
        }

        if !overwrite && self.entries.contains_key(key) {
            return Ok(false);
        }

        self.entries
            .insert(key.to_string(), SettingEntry::new(key.to_string(), tag, default));
        Ok(true)
    }

    /// Register a typed definition under its own name.
    pub fn register_def<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        overwrite: bool,
    ) -> Result<bool, RegistryError> {
        self.register(def.name(), T::TAG, def.default_value().into_value(), overwrite)
    }

    /// Register every definition of a static table.
    pub fn register_table(
        &mut self,
        defs: &[&dyn Definition],
        overwrite: bool,
    ) -> Result<usize, RegistryError> {
        let mut written = 0;
        for def in defs {
            if self.register(def.name(), def.tag(), def.default_as_value(), overwrite)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Register the account-scoped variant of every definition in `defs` for
    /// each account. Returns the keys that were written.
    pub fn register_account_table(
        &mut self,
        defs: &[&dyn Definition],
        accounts: &[Uuid],
        overwrite: bool,
    ) -> Result<Vec<String>, RegistryError> {
        let mut written = Vec::new();
        for def in defs {
            for account in accounts {
                let key = account_key(def.name(), *account);
                if self.register(&key, def.tag(), def.default_as_value(), overwrite)? {
                    written.push(key);
                }
            }
        }
        Ok(written)
    }

    pub fn register_account<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        account: Uuid,
        overwrite: bool,
    ) -> Result<bool, RegistryError> {
        self.register(
            &def.account_key(account),
            T::TAG,
            def.default_value().into_value(),
            overwrite,
        )
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn tag_of(&self, key: &str) -> Option<TypeTag> {
        self.entries.get(key).map(SettingEntry::tag)
    }

    pub fn entry(&self, key: &str) -> Option<&SettingEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn get(&self, key: &str) -> Result<Value, RegistryError> {
        self.entries
            .get(key)
            .map(|entry| entry.current.clone())
            .ok_or_else(|| RegistryError::NotRegistered(key.to_string()))
    }

    /// Update a setting. Returns false (and does nothing else) when the value
    /// is unchanged. Otherwise the change is broadcast to subscribers and
    /// handed to the listener.
    pub fn set(&mut self, key: &str, value: Value) -> Result<bool, RegistryError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotRegistered(key.to_string()))?;

        if entry.current == value {
            return Ok(false);
        }

        if entry.tag != value.tag() {
            return Err(RegistryError::TypeMismatch {
                key: key.to_string(),
                expected: entry.tag,
                actual: value.tag(),
            });
        }

        entry.current = value.clone();
        // No subscribers is fine
        let _ = entry.changes.send(value.clone());

        if let Some(listener) = &self.listener {
            listener(&SettingChanged {
                key: key.to_string(),
                value,
            });
        }

        Ok(true)
    }

    /// Load a persisted value without notifying anyone. Unknown keys are
    /// ignored and reported as `Ok(false)`.
    pub fn hydrate(&mut self, key: &str, value: Value) -> Result<bool, RegistryError> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };

        if entry.tag != value.tag() {
            return Err(RegistryError::TypeMismatch {
                key: key.to_string(),
                expected: entry.tag,
                actual: value.tag(),
            });
        }

        entry.current = value;
        Ok(true)
    }

    /// Subscribe to value changes of a single setting.
    pub fn subscribe(&self, key: &str) -> Result<broadcast::Receiver<Value>, RegistryError> {
        self.entries
            .get(key)
            .map(|entry| entry.changes.subscribe())
            .ok_or_else(|| RegistryError::NotRegistered(key.to_string()))
    }

    pub fn get_cvar<T: SettingValue>(&self, def: &CVarDef<T>) -> Result<T, RegistryError> {
        self.get_typed(def.name())
    }

    pub fn set_cvar<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        value: T,
    ) -> Result<bool, RegistryError> {
        self.set(def.name(), value.into_value())
    }

    pub fn get_account<T: SettingValue>(
        &self,
        def: &CVarDef<T>,
        account: Uuid,
    ) -> Result<T, RegistryError> {
        self.get_typed(&def.account_key(account))
    }

    /// Value of the account variant, or the definition default when there
    /// is no account or the account variant was never registered.
    pub fn get_account_or_default<T: SettingValue>(
        &self,
        def: &CVarDef<T>,
        account: Option<Uuid>,
    ) -> T {
        account
            .and_then(|id| self.get_account(def, id).ok())
            .unwrap_or_else(|| def.default_value())
    }

    pub fn set_account<T: SettingValue>(
        &mut self,
        def: &CVarDef<T>,
        account: Uuid,
        value: T,
    ) -> Result<bool, RegistryError> {
        self.set(&def.account_key(account), value.into_value())
    }

    fn get_typed<T: SettingValue>(&self, key: &str) -> Result<T, RegistryError> {
        let value = self.get(key)?;
        let actual = value.tag();
        T::from_value(value).ok_or_else(|| RegistryError::TypeMismatch {
            key: key.to_string(),
            expected: T::TAG,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cvar::{ACCOUNT_CVARS, BASE_CVARS, account_cvars, cvars};

    fn recording_registry() -> (SettingRegistry, Arc<Mutex<Vec<SettingChanged>>>) {
        let mut registry = SettingRegistry::new();
        registry.register_table(BASE_CVARS, false).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.set_listener(Box::new(move |change: &SettingChanged| {
            sink.lock().unwrap().push(change.clone());
        }));
        (registry, seen)
    }

    #[test]
    fn register_respects_overwrite_flag() {
        let mut registry = SettingRegistry::new();
        assert!(registry.register("Volume", TypeTag::Int, Value::Int(5), false).unwrap());
        registry.set("Volume", Value::Int(9)).unwrap();

        assert!(!registry.register("Volume", TypeTag::Int, Value::Int(5), false).unwrap());
        assert_eq!(registry.get("Volume").unwrap(), Value::Int(9));

        assert!(registry.register("Volume", TypeTag::Int, Value::Int(5), true).unwrap());
        assert_eq!(registry.get("Volume").unwrap(), Value::Int(5));
    }

    #[test]
    fn register_rejects_mismatched_default() {
        let mut registry = SettingRegistry::new();
        let err = registry
            .register("Broken", TypeTag::Bool, Value::Long(1), false)
            .unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
        assert!(!registry.contains("Broken"));
    }

    #[test]
    fn get_unknown_key_is_not_registered() {
        let registry = SettingRegistry::new();
        assert_eq!(
            registry.get("Nope").unwrap_err(),
            RegistryError::NotRegistered("Nope".to_string())
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let (mut registry, _) = recording_registry();
        registry.set_cvar(&cvars::COMPAT_MODE, true).unwrap();
        assert!(registry.get_cvar(&cvars::COMPAT_MODE).unwrap());

        registry.set_cvar(&cvars::FINGERPRINT, "abc".to_string()).unwrap();
        assert_eq!(registry.get_cvar(&cvars::FINGERPRINT).unwrap(), "abc");
    }

    #[test]
    fn set_same_value_twice_notifies_once() {
        let (mut registry, seen) = recording_registry();
        assert!(registry.set_cvar(&cvars::COMPAT_MODE, true).unwrap());
        assert!(!registry.set_cvar(&cvars::COMPAT_MODE, true).unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, "CompatMode");
        assert_eq!(seen[0].value, Value::Bool(true));
    }

    #[test]
    fn set_to_default_value_is_a_no_op() {
        let (mut registry, seen) = recording_registry();
        assert!(!registry.set_cvar(&cvars::PASS_FINGERPRINT, true).unwrap());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn set_with_wrong_type_fails_without_notifying() {
        let (mut registry, seen) = recording_registry();
        let err = registry.set("CompatMode", Value::Long(1)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::TypeMismatch {
                key: "CompatMode".to_string(),
                expected: TypeTag::Bool,
                actual: TypeTag::Long,
            }
        );
        assert_eq!(registry.get("CompatMode").unwrap(), Value::Bool(false));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn subscribers_receive_new_values() {
        let (mut registry, _) = recording_registry();
        let mut rx = registry.subscribe("CompatMode").unwrap();
        registry.set_cvar(&cvars::COMPAT_MODE, true).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Value::Bool(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hydrate_is_silent_and_ignores_unknown_keys() {
        let (mut registry, seen) = recording_registry();
        let mut rx = registry.subscribe("CompatMode").unwrap();

        assert!(registry.hydrate("CompatMode", Value::Bool(true)).unwrap());
        assert!(!registry.hydrate("SomeRemovedSetting", Value::Bool(true)).unwrap());

        assert_eq!(registry.get("CompatMode").unwrap(), Value::Bool(true));
        assert!(seen.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn account_settings_are_independent_entries() {
        let (mut registry, seen) = recording_registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let written = registry
            .register_account_table(ACCOUNT_CVARS, &[alice, bob], false)
            .unwrap();
        assert_eq!(written.len(), 2);

        registry
            .set_account(&account_cvars::SPOOFED_HWID_SEED, alice, 77)
            .unwrap();

        assert_eq!(registry.get_account(&account_cvars::SPOOFED_HWID_SEED, alice).unwrap(), 77);
        assert_eq!(registry.get_account(&account_cvars::SPOOFED_HWID_SEED, bob).unwrap(), 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, account_key("SpoofedHwidSeed", alice));
    }

    #[test]
    fn account_reregistration_without_overwrite_keeps_value() {
        let mut registry = SettingRegistry::new();
        let alice = Uuid::new_v4();
        registry
            .register_account(&account_cvars::SPOOFED_HWID_SEED, alice, false)
            .unwrap();
        registry
            .set_account(&account_cvars::SPOOFED_HWID_SEED, alice, 5)
            .unwrap();

        let written = registry
            .register_account_table(ACCOUNT_CVARS, &[alice], false)
            .unwrap();
        assert!(written.is_empty());
        assert_eq!(registry.get_account(&account_cvars::SPOOFED_HWID_SEED, alice).unwrap(), 5);
    }

    #[test]
    fn account_or_default_falls_back() {
        let registry = SettingRegistry::new();
        let def = &account_cvars::SPOOFED_HWID_SEED;
        assert_eq!(registry.get_account_or_default(def, None), 1);
        assert_eq!(registry.get_account_or_default(def, Some(Uuid::new_v4())), 1);
    }

    #[test]
    fn keys_are_sorted() {
        let mut registry = SettingRegistry::new();
        registry.register("b", TypeTag::Bool, Value::Bool(false), false).unwrap();
        registry.register("a", TypeTag::Bool, Value::Bool(false), false).unwrap();
        assert_eq!(registry.keys(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}
