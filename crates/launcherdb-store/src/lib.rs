// ABOUTME: Persistence layer for launcherdb: SQLite schema, write-behind command queue, and bootstrap loading.
// ABOUTME: DataManager is the entry point tying the core registry and caches to durable storage.

pub mod codec;
pub mod command;
pub mod config;
pub mod load;
pub mod manager;
pub mod migrations;
pub mod queue;
pub mod writer;

pub use codec::{CodecError, ColumnCodec, codec_for, decode_value, encode_value};
pub use command::{CommandError, DbCommand};
pub use config::{ConfigError, StoreConfig};
pub use load::{LoadedCollections, SettingsLoad, hydrate_settings, load_collections};
pub use manager::{DataError, DataManager};
pub use migrations::{
    EmbeddedMigrations, Migration, MigrationError, MigrationRunner, SETTINGS_MIGRATION_SET,
    schema_version,
};
pub use queue::CommandQueue;
pub use writer::{CommitTicket, FlushWriter, StoreTarget, WriterError};
