use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_READ_RECEIPT_QUIET_PERIOD: Duration = Duration::from_millis(2000);
pub const DEFAULT_REFRESH_SAFETY_BUFFER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub database_url: String,
    pub push_url: Option<String>,
    pub page_size: u32,
    pub read_receipt_quiet_period: Duration,
    pub refresh_safety_buffer: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            database_url: "sqlite://./data/client.db".into(),
            push_url: None,
            page_size: DEFAULT_PAGE_SIZE,
            read_receipt_quiet_period: DEFAULT_READ_RECEIPT_QUIET_PERIOD,
            refresh_safety_buffer: DEFAULT_REFRESH_SAFETY_BUFFER,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    database_url: Option<String>,
    push_url: Option<String>,
    page_size: Option<u32>,
    read_receipt_quiet_ms: Option<u64>,
    refresh_safety_buffer_secs: Option<u64>,
}

pub fn load_settings() -> ClientSettings {
    let settings = load_settings_from(Path::new("client.toml"));
    apply_overrides(settings, |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    let Ok(raw) = fs::read_to_string(path) else {
        return settings;
    };
    let file_cfg = match toml::from_str::<FileSettings>(&raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!("config: ignoring unreadable {}: {err}", path.display());
            return settings;
        }
    };

    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.push_url {
        settings.push_url = Some(v);
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.read_receipt_quiet_ms {
        settings.read_receipt_quiet_period = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.refresh_safety_buffer_secs {
        settings.refresh_safety_buffer = Duration::from_secs(v);
    }

    settings
}

pub fn apply_overrides(
    mut settings: ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    if let Some(v) = lookup("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("APP__PUSH_URL") {
        settings.push_url = Some(v);
    }

    if let Some(v) = lookup("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed;
        }
    }
    if let Some(v) = lookup("APP__READ_RECEIPT_QUIET_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.read_receipt_quiet_period = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = lookup("APP__REFRESH_SAFETY_BUFFER_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.refresh_safety_buffer = Duration::from_secs(parsed);
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
