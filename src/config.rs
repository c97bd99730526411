use crate::api::Mode;
use crate::db::Database;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const API_BASE_URL_ENV: &str = "HAFA_API_BASE_URL";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub default_mode: Mode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            default_mode: Mode::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Stored setting first, then the environment, then the built-in default.
    pub fn load(db: &Database) -> Self {
        let api_base_url = db
            .get_setting("api_base_url")
            .ok()
            .flatten()
            .or_else(|| std::env::var(API_BASE_URL_ENV).ok())
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let default_mode = db
            .get_setting("default_mode")
            .ok()
            .flatten()
            .and_then(|mode| mode.parse().ok())
            .unwrap_or_default();

        Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            default_mode,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }
}
