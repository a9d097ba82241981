// ABOUTME: Entry point for the launcherdb binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and inspects or edits the launcher data store.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use launcherdb_core::Value;
use launcherdb_store::{DataManager, StoreConfig};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "launcherdb", version, about = "Inspect and edit launcher settings and saved data")]
struct Cli {
    /// Data directory; overrides LAUNCHERDB_HOME.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Every registered setting with its current value.
    List,
    /// Print one setting.
    Get { key: String },
    /// Change one setting. The value is parsed according to the setting's type.
    Set { key: String, value: String },
    /// Saved logins (tokens are never printed).
    Logins,
    /// Favorite servers, most recently raised first.
    Favorites,
    /// Saved hubs in priority order.
    Hubs,
    /// Installed engine versions and modules.
    Engines,
}

#[derive(Debug, Serialize)]
struct SettingRow<'a> {
    key: &'a str,
    #[serde(rename = "type")]
    tag: &'static str,
    value: String,
    default: String,
}

#[derive(Debug, Serialize)]
struct LoginRow {
    user_id: Uuid,
    username: String,
    expires: String,
    selected: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("launcherdb=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::from_env()?;
    if let Some(home) = cli.home {
        config = config.with_home(home);
    }

    tracing::info!(path = %config.db_path().display(), "launcherdb starting up");
    let mut manager = DataManager::open(&config)?;

    let output = run(&mut manager, cli.command).await;
    manager.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

async fn run(manager: &mut DataManager, command: Command) -> Result<serde_json::Value, anyhow::Error> {
    match command {
        Command::List => {
            let registry = manager.registry();
            let rows: Vec<SettingRow<'_>> = registry
                .keys()
                .into_iter()
                .filter_map(|key| registry.entry(key))
                .map(|entry| SettingRow {
                    key: entry.key(),
                    tag: entry.tag().name(),
                    value: entry.current().to_string(),
                    default: entry.default_value().to_string(),
                })
                .collect();
            Ok(serde_json::to_value(rows)?)
        }

        Command::Get { key } => {
            let value = manager.get(&key)?;
            Ok(json!({ "key": key, "type": value.tag().name(), "value": value.to_string() }))
        }

        Command::Set { key, value } => {
            let tag = manager
                .registry()
                .tag_of(&key)
                .ok_or_else(|| anyhow::anyhow!("unknown setting: {}", key))?;
            let parsed = Value::parse_as(tag, &value)?;
            let changed = manager.set(&key, parsed.clone())?;
            let written = manager.commit().wait().await?;
            tracing::debug!(key = %key, changed, written, "setting updated");
            Ok(json!({ "key": key, "value": parsed.to_string(), "changed": changed }))
        }

        Command::Logins => {
            let selected = manager.selected_login_id()?;
            let mut rows: Vec<LoginRow> = manager
                .logins()
                .into_iter()
                .map(|login| LoginRow {
                    selected: selected == Some(login.user_id),
                    user_id: login.user_id,
                    username: login.username,
                    expires: login.token.expire_time.to_rfc3339(),
                })
                .collect();
            rows.sort_by(|a, b| a.username.cmp(&b.username));
            Ok(serde_json::to_value(rows)?)
        }

        Command::Favorites => Ok(serde_json::to_value(manager.favorite_servers())?),

        Command::Hubs => Ok(serde_json::to_value(manager.hubs())?),

        Command::Engines => {
            let mut versions = manager.engine_installations();
            versions.sort_by(|a, b| a.version.cmp(&b.version));
            let versions: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
            Ok(json!({ "versions": versions, "modules": manager.engine_modules() }))
        }
    }
}
