use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub const APP_ID: &str = "murmur";

/// Storage key of the persisted conversation.
pub const HISTORY_KEY: &str = "chat-history";

/// Storage key of the serialized `AppSettings`.
pub const SETTINGS_KEY: &str = "app_settings";

pub fn data_dir() -> Result<PathBuf> {
    let base = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").map_err(|_| anyhow!("HOME not set"))?;
            PathBuf::from(home).join(".local/share")
        }
    };
    Ok(base.join(APP_ID))
}

pub fn db_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(format!("{APP_ID}.db")))
}
