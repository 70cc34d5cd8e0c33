use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::error::EngineError;

pub const DEFAULT_SETTINGS_FILE: &str = "circles.toml";
const ENV_PREFIX: &str = "CIRCLES__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub matching_window_ms: u64,
    pub send_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout_ms: u64,
    pub history_limit: u32,
    pub anonymous_alias: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".into(),
            matching_window_ms: 10_000,
            send_timeout_ms: 15_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 5,
            handshake_timeout_ms: 5_000,
            history_limit: 50,
            anonymous_alias: "Anonymous User".into(),
        }
    }
}

impl ClientSettings {
    pub fn matching_window(&self) -> Duration {
        Duration::from_millis(self.matching_window_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.server_url.trim().is_empty() {
            return Err(EngineError::Config("server_url must not be empty".into()));
        }
        if self.matching_window_ms == 0 || self.send_timeout_ms == 0 {
            return Err(EngineError::Config(
                "matching window and send timeout must be non-zero".into(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(EngineError::Config(
                "max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(EngineError::Config(format!(
                "reconnect cap ({}ms) must be >= non-zero base ({}ms)",
                self.reconnect_cap_ms, self.reconnect_base_ms
            )));
        }
        if self.anonymous_alias.trim().is_empty() {
            return Err(EngineError::Config("anonymous_alias must not be empty".into()));
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("ANONYMOUS_ALIAS") {
            self.anonymous_alias = v;
        }
        apply_parsed(&mut self.matching_window_ms, var("MATCHING_WINDOW_MS"));
        apply_parsed(&mut self.send_timeout_ms, var("SEND_TIMEOUT_MS"));
        apply_parsed(&mut self.reconnect_base_ms, var("RECONNECT_BASE_MS"));
        apply_parsed(&mut self.reconnect_cap_ms, var("RECONNECT_CAP_MS"));
        apply_parsed(
            &mut self.max_reconnect_attempts,
            var("MAX_RECONNECT_ATTEMPTS"),
        );
        apply_parsed(&mut self.handshake_timeout_ms, var("HANDSHAKE_TIMEOUT_MS"));
        apply_parsed(&mut self.history_limit, var("HISTORY_LIMIT"));
    }
}

fn apply_parsed<T: std::str::FromStr>(slot: &mut T, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(value = %raw, "config: ignoring unparsable override"),
    }
}

/// Exponential backoff with a fixed cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based): base, 2*base, 4*base, ... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ClientSettings::default().reconnect_policy()
    }
}

/// Loads settings from defaults, then the TOML file, then `CIRCLES__*` env vars.
///
/// A missing default file is fine; an explicitly requested file must exist.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None => {
            let default_path = Path::new(DEFAULT_SETTINGS_FILE);
            if default_path.exists() {
                read_settings_file(default_path)?
            } else {
                ClientSettings::default()
            }
        }
    };

    settings.apply_env(|name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> anyhow::Result<ClientSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    parse_settings(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

pub fn parse_settings(raw: &str) -> anyhow::Result<ClientSettings> {
    Ok(toml::from_str::<ClientSettings>(raw)?)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
