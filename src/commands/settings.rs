use std::collections::HashMap;

use crate::api::Mode;
use crate::db::Database;

const SETTING_KEYS: &[&str] = &["api_base_url", "default_mode"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub fn get_settings(db: &Database) -> Result<HashMap<String, String>, SettingsError> {
    let mut map = HashMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key)? {
            map.insert(key.to_string(), value);
        }
    }
    Ok(map)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), SettingsError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(SettingsError::UnknownKey(key.to_string()));
    }
    let value = value.trim();
    match key {
        "default_mode" => {
            let mode: Mode = value.parse().map_err(|reason| SettingsError::InvalidValue {
                key: key.to_string(),
                reason,
            })?;
            db.set_setting(key, mode.as_str())?;
        }
        "api_base_url" => {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                return Err(SettingsError::InvalidValue {
                    key: key.to_string(),
                    reason: "must start with http:// or https://".to_string(),
                });
            }
            db.set_setting(key, value.trim_end_matches('/'))?;
        }
        _ => db.set_setting(key, value)?,
    }
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<(), SettingsError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(SettingsError::UnknownKey(key.to_string()));
    }
    db.delete_setting(key)?;
    Ok(())
}
