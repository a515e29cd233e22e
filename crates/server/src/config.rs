use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub seed_demo_data: bool,
    pub max_batch_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            seed_demo_data: true,
            max_batch_bytes: 1024 * 1024,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    apply_file(&mut settings, Path::new(SETTINGS_FILE));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    match toml::from_str::<HashMap<String, String>>(&raw) {
        Ok(file_cfg) => {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("seed_demo_data") {
                set_flag(&mut settings.seed_demo_data, "seed_demo_data", v);
            }
            if let Some(v) = file_cfg.get("max_batch_bytes") {
                set_size(&mut settings.max_batch_bytes, "max_batch_bytes", v);
            }
        }
        Err(error) => warn!(path = %path.display(), %error, "ignoring unreadable settings file"),
    }
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__SEED_DEMO_DATA") {
        set_flag(&mut settings.seed_demo_data, "APP__SEED_DEMO_DATA", &v);
    }
    if let Some(v) = lookup("APP__MAX_BATCH_BYTES") {
        set_size(&mut settings.max_batch_bytes, "APP__MAX_BATCH_BYTES", &v);
    }
}

fn set_flag(target: &mut bool, key: &str, raw: &str) {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        _ => warn!(key, value = raw, "ignoring invalid boolean setting"),
    }
}

fn set_size(target: &mut usize, key: &str, raw: &str) {
    match raw.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => *target = parsed,
        _ => warn!(key, value = raw, "ignoring invalid size setting"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
