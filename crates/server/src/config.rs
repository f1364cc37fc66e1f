use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

pub const DEV_JWT_SECRET: &str = "socialvibe-dev-secret";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/socialvibe.db".into(),
            jwt_secret: DEV_JWT_SECRET.into(),
            token_ttl_seconds: 7 * 24 * 3600,
        }
    }
}

impl Settings {
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `server.toml` contents, then environment. Later sources win.
pub fn load_settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) {
            if let Some(v) = file_cfg.get("bind_addr").and_then(toml::Value::as_str) {
                settings.bind_addr = v.to_string();
            }
            if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
                settings.database_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("jwt_secret").and_then(toml::Value::as_str) {
                settings.jwt_secret = v.to_string();
            }
            if let Some(v) = file_cfg
                .get("token_ttl_seconds")
                .and_then(toml::Value::as_integer)
            {
                settings.token_ttl_seconds = v;
            }
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__JWT_SECRET").filter(|v| !v.is_empty()) {
        settings.jwt_secret = v;
    }

    if let Some(v) = env("APP__TOKEN_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.token_ttl_seconds = parsed.max(60);
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        let path = path.replace('\\', "/");
        if is_drive_path(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if is_drive_path(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url.replace('\\', "/");
    if is_drive_path(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

/// `C:/...` style paths, which must not get a `//` authority.
fn is_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
