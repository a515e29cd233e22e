use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

use crate::{transport::endpoint_for, widgets_manager::DEFAULT_SETTLE_DELAY};

pub const SETTINGS_FILE: &str = "console.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorSettings {
    pub server_url: String,
    pub settle_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub fn load_settings() -> EditorSettings {
    let mut settings = EditorSettings::default();
    apply_file(&mut settings, Path::new(SETTINGS_FILE));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_file(settings: &mut EditorSettings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    match toml::from_str::<HashMap<String, String>>(&raw) {
        Ok(file_cfg) => {
            if let Some(v) = file_cfg.get("server_url") {
                set_server_url(settings, "server_url", v);
            }
            if let Some(v) = file_cfg.get("settle_delay_ms") {
                set_millis(&mut settings.settle_delay, "settle_delay_ms", v);
            }
            if let Some(v) = file_cfg.get("request_timeout_secs") {
                set_secs(&mut settings.request_timeout, "request_timeout_secs", v);
            }
        }
        Err(error) => warn!(path = %path.display(), %error, "ignoring unreadable settings file"),
    }
}

pub fn apply_env(settings: &mut EditorSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("EDITOR_SERVER_URL") {
        set_server_url(settings, "EDITOR_SERVER_URL", &v);
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        set_server_url(settings, "APP__SERVER_URL", &v);
    }
    if let Some(v) = lookup("APP__SETTLE_DELAY_MS") {
        set_millis(&mut settings.settle_delay, "APP__SETTLE_DELAY_MS", &v);
    }
    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
        set_secs(&mut settings.request_timeout, "APP__REQUEST_TIMEOUT_SECS", &v);
    }
}

fn set_server_url(settings: &mut EditorSettings, key: &str, raw: &str) {
    match endpoint_for(raw) {
        Ok(_) => settings.server_url = raw.trim().trim_end_matches('/').to_string(),
        Err(error) => warn!(key, %error, "ignoring invalid server url"),
    }
}

fn set_millis(target: &mut Duration, key: &str, raw: &str) {
    match raw.trim().parse::<u64>() {
        Ok(ms) => *target = Duration::from_millis(ms),
        Err(_) => warn!(key, value = raw, "ignoring invalid millisecond setting"),
    }
}

fn set_secs(target: &mut Duration, key: &str, raw: &str) {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => *target = Duration::from_secs(secs),
        _ => warn!(key, value = raw, "ignoring invalid timeout setting"),
    }
}
