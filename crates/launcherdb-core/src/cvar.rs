// ABOUTME: Static definitions of every launcher setting (CVar) and the per-account setting table.
// ABOUTME: CVarDef<T> carries a key and typed default; the erased Definition trait drives bulk registration.

use std::marker::PhantomData;

use uuid::Uuid;

use crate::value::{SettingValue, TypeTag, Value};

/// Separator between the account id and the base key in account-scoped keys.
pub const ACCOUNT_SEPARATOR: &str = "::ACCOUNT::";

/// A typed setting definition: a stable key plus a default value factory.
pub struct CVarDef<T> {
    name: &'static str,
    default: fn() -> T,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SettingValue> CVarDef<T> {
    pub const fn new(name: &'static str, default: fn() -> T) -> Self {
        Self {
            name,
            default,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> T {
        (self.default)()
    }

    /// The key this setting is stored under for the given account.
    pub fn account_key(&self, account: Uuid) -> String {
        account_key(self.name, account)
    }
}

/// Type-erased view of a CVarDef, used by the static definition tables.
pub trait Definition: Sync {
    fn name(&self) -> &'static str;
    fn tag(&self) -> TypeTag;
    fn default_as_value(&self) -> Value;
}

impl<T: SettingValue> Definition for CVarDef<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn tag(&self) -> TypeTag {
        T::TAG
    }

    fn default_as_value(&self) -> Value {
        self.default_value().into_value()
    }
}

/// Build the key of an account-scoped setting: `{account}::ACCOUNT::{base}`.
pub fn account_key(base: &str, account: Uuid) -> String {
    format!("{}{}{}", account.hyphenated(), ACCOUNT_SEPARATOR, base)
}

/// Split an account-scoped key back into its account id and base key.
pub fn parse_account_key(key: &str) -> Option<(Uuid, &str)> {
    let (account, base) = key.split_once(ACCOUNT_SEPARATOR)?;
    let account = Uuid::parse_str(account).ok()?;
    Some((account, base))
}

/// Settings shared by the whole launcher.
pub mod cvars {
    use super::CVarDef;

    /// Persistent random fingerprint identifying this launcher install.
    pub static FINGERPRINT: CVarDef<String> = CVarDef::new("Fingerprint", String::new);
    /// Id of the selected login, or empty when none is selected.
    pub static SELECTED_LOGIN: CVarDef<String> = CVarDef::new("SelectedLogin", String::new);
    pub static MULTI_ACCOUNTS: CVarDef<bool> = CVarDef::new("MultiAccounts", || false);
    pub static COMPAT_MODE: CVarDef<bool> = CVarDef::new("CompatMode", || false);
    pub static LOG_LAUNCHER_VERBOSE: CVarDef<bool> = CVarDef::new("LogLauncherVerbose", || false);
    pub static DISABLE_SIGNING: CVarDef<bool> = CVarDef::new("DisableSigning", || false);
    pub static OVERRIDE_ASSETS: CVarDef<bool> = CVarDef::new("OverrideAssets", || false);
    pub static HAS_DISMISSED_EARLY_ACCESS_WARNING: CVarDef<bool> =
        CVarDef::new("HasDismissedEarlyAccessWarning", || false);
    pub static HAS_DISMISSED_INTEL_DEGRADATION: CVarDef<bool> =
        CVarDef::new("HasDismissedIntelDegradation", || false);
    pub static HAS_DISMISSED_ROSETTA_WARNING: CVarDef<bool> =
        CVarDef::new("HasDismissedRosettaWarning", || false);

    /// Send the launcher fingerprint header with outgoing requests.
    pub static PASS_FINGERPRINT: CVarDef<bool> = CVarDef::new("PassFingerprint", || true);
    /// Send the per-session spoofed fingerprint instead of the stored one.
    pub static PASS_SPOOFED_FINGERPRINT: CVarDef<bool> =
        CVarDef::new("SpoofFingerprint", || false);
    /// Regenerate the spoofed fingerprint whenever an account logs in.
    pub static SPOOF_FINGERPRINT_ON_LOGIN: CVarDef<bool> =
        CVarDef::new("SpoofFingerprintOnLogin", || true);
    pub static ALLOW_HWID: CVarDef<bool> = CVarDef::new("AllowHwid", || false);
    pub static START_ON_LOGIN_MENU: CVarDef<bool> = CVarDef::new("StartOnLoginMenu", || false);
    pub static START_LOGGED_IN: CVarDef<bool> = CVarDef::new("StartLoggedIn", || false);
    pub static ENABLE_STOCK_HUB: CVarDef<bool> = CVarDef::new("EnableStockHub", || true);
    pub static PATCHING_ENABLED: CVarDef<bool> = CVarDef::new("PatchingEnabled", || false);
    /// false patches the engine only, true patches content as well.
    pub static PATCHING_LEVEL: CVarDef<bool> = CVarDef::new("PatchingLevel", || false);
    pub static HWID_PATCH_ENABLED: CVarDef<bool> = CVarDef::new("HwidPatchEnabled", || true);
    pub static LOAD_INTERNAL_MODS: CVarDef<bool> = CVarDef::new("LoadInternalMods", || false);
    pub static LOAD_EXTERNAL_MODS: CVarDef<bool> = CVarDef::new("LoadExternalMods", || false);
}

/// Settings instantiated once per account under a derived key.
pub mod account_cvars {
    use super::CVarDef;

    /// Seed for HWID generation. Stored as i64; callers reinterpret the bits as u64.
    pub static SPOOFED_HWID_SEED: CVarDef<i64> = CVarDef::new("SpoofedHwidSeed", || 1);
}

/// Every launcher-wide setting, registered at startup.
pub static BASE_CVARS: &[&dyn Definition] = &[
    &cvars::FINGERPRINT,
    &cvars::SELECTED_LOGIN,
    &cvars::MULTI_ACCOUNTS,
    &cvars::COMPAT_MODE,
    &cvars::LOG_LAUNCHER_VERBOSE,
    &cvars::DISABLE_SIGNING,
    &cvars::OVERRIDE_ASSETS,
    &cvars::HAS_DISMISSED_EARLY_ACCESS_WARNING,
    &cvars::HAS_DISMISSED_INTEL_DEGRADATION,
    &cvars::HAS_DISMISSED_ROSETTA_WARNING,
    &cvars::PASS_FINGERPRINT,
    &cvars::PASS_SPOOFED_FINGERPRINT,
    &cvars::SPOOF_FINGERPRINT_ON_LOGIN,
    &cvars::ALLOW_HWID,
    &cvars::START_ON_LOGIN_MENU,
    &cvars::START_LOGGED_IN,
    &cvars::ENABLE_STOCK_HUB,
    &cvars::PATCHING_ENABLED,
    &cvars::PATCHING_LEVEL,
    &cvars::HWID_PATCH_ENABLED,
    &cvars::LOAD_INTERNAL_MODS,
    &cvars::LOAD_EXTERNAL_MODS,
];

/// Settings cloned for every account that becomes active.
pub static ACCOUNT_CVARS: &[&dyn Definition] = &[&account_cvars::SPOOFED_HWID_SEED];
