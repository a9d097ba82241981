// ABOUTME: Core library for launcherdb: typed settings, entity records, and observable caches.
// ABOUTME: Everything here is in-memory; persistence lives in launcherdb-store.

pub mod cache;
pub mod cvar;
pub mod model;
pub mod registry;
pub mod value;

pub use cache::{CacheError, Change, ChangeKind, ChangeListener, Keyed, ObservableCache};
pub use cvar::{
    ACCOUNT_CVARS, BASE_CVARS, CVarDef, Definition, account_cvars, account_key, cvars,
    parse_account_key,
};
pub use model::{
    AcceptedPrivacyPolicy, FavoriteServer, Hub, InstalledEngineModule, InstalledEngineVersion,
    LoginInfo, LoginToken, ServerFilter,
};
pub use registry::{RegistryError, SettingChanged, SettingEntry, SettingListener, SettingRegistry};
pub use value::{ParseValueError, SettingValue, TypeTag, Value};
