use std::{fs, io, path::Path, time::Duration};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub app_id: i32,
    pub app_hash: String,
    pub database_url: String,
    pub log_level: String,
    /// Exact title of the chat the bot works in.
    pub target_chat: Option<String>,
    pub announce_text: Option<String>,
    pub watch_username: Option<String>,
    pub watch_min: Duration,
    pub watch_max: Duration,
    pub forget_state: bool,
}

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8443";
const DEFAULT_DATABASE_URL: &str = "sqlite://./data/bot.db";
const DEFAULT_WATCH_MIN_SECS: u64 = 60;
const DEFAULT_WATCH_MAX_SECS: u64 = 300;

/// One configuration layer. Later layers override earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialSettings {
    pub server_url: Option<String>,
    pub app_id: Option<String>,
    pub app_hash: Option<String>,
    pub database_url: Option<String>,
    pub session_path: Option<String>,
    pub log_level: Option<String>,
    pub target_chat: Option<String>,
    pub announce_text: Option<String>,
    pub watch_username: Option<String>,
    pub watch_min_secs: Option<u64>,
    pub watch_max_secs: Option<u64>,
    pub forget_state: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    app_id: Option<i64>,
    app_hash: Option<String>,
    database_url: Option<String>,
    session_path: Option<String>,
    log_level: Option<String>,
    target_chat: Option<String>,
    announce_text: Option<String>,
    watch_username: Option<String>,
    watch_min_secs: Option<u64>,
    watch_max_secs: Option<u64>,
    forget_state: Option<bool>,
}

impl PartialSettings {
    pub fn merge(self, over: PartialSettings) -> PartialSettings {
        PartialSettings {
            server_url: over.server_url.or(self.server_url),
            app_id: over.app_id.or(self.app_id),
            app_hash: over.app_hash.or(self.app_hash),
            database_url: over.database_url.or(self.database_url),
            session_path: over.session_path.or(self.session_path),
            log_level: over.log_level.or(self.log_level),
            target_chat: over.target_chat.or(self.target_chat),
            announce_text: over.announce_text.or(self.announce_text),
            watch_username: over.watch_username.or(self.watch_username),
            watch_min_secs: over.watch_min_secs.or(self.watch_min_secs),
            watch_max_secs: over.watch_max_secs.or(self.watch_max_secs),
            forget_state: over.forget_state.or(self.forget_state),
        }
    }
}

pub fn parse_file(raw: &str) -> anyhow::Result<PartialSettings> {
    let file: FileSettings = toml::from_str(raw).context("invalid bot config file")?;
    Ok(PartialSettings {
        server_url: file.server_url,
        app_id: file.app_id.map(|id| id.to_string()),
        app_hash: file.app_hash,
        database_url: file.database_url,
        session_path: file.session_path,
        log_level: file.log_level,
        target_chat: file.target_chat,
        announce_text: file.announce_text,
        watch_username: file.watch_username,
        watch_min_secs: file.watch_min_secs,
        watch_max_secs: file.watch_max_secs,
        forget_state: file.forget_state,
    })
}

/// Reads `NAME`, letting `APP__NAME` take precedence.
fn lookup_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(&format!("APP__{name}"))
        .or_else(|| lookup(name))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<PartialSettings> {
    let number = |name: &str| -> anyhow::Result<Option<u64>> {
        lookup_var(&lookup, name)
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("{name} must be a whole number of seconds"))
            })
            .transpose()
    };
    let flag = lookup_var(&lookup, "FORGET_STATE")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

    Ok(PartialSettings {
        server_url: lookup_var(&lookup, "SERVER_URL"),
        app_id: lookup_var(&lookup, "APP_ID"),
        app_hash: lookup_var(&lookup, "APP_HASH"),
        database_url: lookup_var(&lookup, "DATABASE_URL"),
        session_path: lookup_var(&lookup, "SESSION_PATH"),
        log_level: lookup_var(&lookup, "LOG_LEVEL"),
        target_chat: lookup_var(&lookup, "TARGET_CHAT"),
        announce_text: lookup_var(&lookup, "ANNOUNCE_TEXT"),
        watch_username: lookup_var(&lookup, "WATCH_USERNAME"),
        watch_min_secs: number("WATCH_MIN_SECS")?,
        watch_max_secs: number("WATCH_MAX_SECS")?,
        forget_state: flag,
    })
}

impl Settings {
    pub fn resolve(partial: PartialSettings) -> anyhow::Result<Settings> {
        let raw_app_id = partial
            .app_id
            .ok_or_else(|| anyhow!("APP_ID is required (set it in bot.toml, .env or the environment)"))?;
        let app_id = raw_app_id
            .trim()
            .parse::<i32>()
            .with_context(|| format!("APP_ID must be an integer, got '{raw_app_id}'"))?;
        let app_hash = partial
            .app_hash
            .ok_or_else(|| anyhow!("APP_HASH is required (set it in bot.toml, .env or the environment)"))?;

        let database_url = match (partial.database_url, partial.session_path) {
            (Some(url), _) => normalize_database_url(&url),
            (None, Some(path)) => normalize_database_url(&path),
            (None, None) => DEFAULT_DATABASE_URL.to_string(),
        };

        let watch_min = partial.watch_min_secs.unwrap_or(DEFAULT_WATCH_MIN_SECS);
        let watch_max = partial.watch_max_secs.unwrap_or(DEFAULT_WATCH_MAX_SECS);
        if watch_min == 0 || watch_min > watch_max {
            bail!("watch interval must satisfy 0 < min <= max, got {watch_min}..{watch_max}");
        }

        Ok(Settings {
            server_url: partial
                .server_url
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            app_id,
            app_hash,
            database_url,
            log_level: partial.log_level.unwrap_or_else(|| "info".to_string()),
            target_chat: partial.target_chat,
            announce_text: partial.announce_text,
            watch_username: partial
                .watch_username
                .map(|name| name.trim_start_matches('@').to_string()),
            watch_min: Duration::from_secs(watch_min),
            watch_max: Duration::from_secs(watch_max),
            forget_state: partial.forget_state.unwrap_or(false),
        })
    }
}

/// Defaults, then `config_path`, then `.env` and the process environment,
/// then `overrides` from the command line.
pub fn load_settings(config_path: &Path, overrides: PartialSettings) -> anyhow::Result<Settings> {
    let file = match fs::read_to_string(config_path) {
        Ok(raw) => parse_file(&raw)
            .with_context(|| format!("failed to parse '{}'", config_path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => PartialSettings::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", config_path.display()))
        }
    };

    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let env = from_env(|name| std::env::var(name).ok())?;

    Settings::resolve(file.merge(env).merge(overrides))
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return DEFAULT_DATABASE_URL.to_string();
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
