use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::{poller::PollPolicy, transport::ReconnectPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub page_size: u32,
    pub reconnect: ReconnectPolicy,
    pub message_poll: PollPolicy,
    pub list_poll: PollPolicy,
    /// How long a remote typing indicator survives without a refresh.
    pub typing_window: Duration,
    /// Idle time after the last keystroke before `typing_stop` is emitted.
    pub composing_idle: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            page_size: 20,
            reconnect: ReconnectPolicy::default(),
            message_poll: PollPolicy::messages(),
            list_poll: PollPolicy::conversation_list(),
            typing_window: Duration::from_secs(3),
            composing_idle: Duration::from_secs(3),
        }
    }
}

/// Flat, millisecond-based shape accepted from files and the environment.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawClientSettings {
    server_url: String,
    page_size: u32,
    reconnect_base_delay_ms: u64,
    reconnect_max_delay_ms: u64,
    reconnect_max_attempts: u32,
    connect_timeout_ms: u64,
    message_poll_grace_ms: u64,
    message_poll_interval_ms: u64,
    list_poll_grace_ms: u64,
    list_poll_interval_ms: u64,
    typing_window_ms: u64,
    composing_idle_ms: u64,
}

impl Default for RawClientSettings {
    fn default() -> Self {
        let defaults = ClientSettings::default();
        Self {
            server_url: defaults.server_url,
            page_size: defaults.page_size,
            reconnect_base_delay_ms: millis(defaults.reconnect.base_delay),
            reconnect_max_delay_ms: millis(defaults.reconnect.max_delay),
            reconnect_max_attempts: defaults.reconnect.max_attempts,
            connect_timeout_ms: millis(defaults.reconnect.connect_timeout),
            message_poll_grace_ms: millis(defaults.message_poll.grace),
            message_poll_interval_ms: millis(defaults.message_poll.interval),
            list_poll_grace_ms: millis(defaults.list_poll.grace),
            list_poll_interval_ms: millis(defaults.list_poll.interval),
            typing_window_ms: millis(defaults.typing_window),
            composing_idle_ms: millis(defaults.composing_idle),
        }
    }
}

impl From<RawClientSettings> for ClientSettings {
    fn from(raw: RawClientSettings) -> Self {
        Self {
            server_url: raw.server_url.trim_end_matches('/').to_string(),
            page_size: raw.page_size.clamp(1, 100),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(raw.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(raw.reconnect_max_delay_ms),
                max_attempts: raw.reconnect_max_attempts.max(1),
                connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
            },
            message_poll: PollPolicy {
                grace: Duration::from_millis(raw.message_poll_grace_ms),
                interval: Duration::from_millis(raw.message_poll_interval_ms.max(1)),
            },
            list_poll: PollPolicy {
                grace: Duration::from_millis(raw.list_poll_grace_ms),
                interval: Duration::from_millis(raw.list_poll_interval_ms.max(1)),
            },
            typing_window: Duration::from_millis(raw.typing_window_ms),
            composing_idle: Duration::from_millis(raw.composing_idle_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Loads settings from an optional TOML file, then `SOCIALVIBE__*` environment
/// variables (e.g. `SOCIALVIBE__SERVER_URL`, `SOCIALVIBE__PAGE_SIZE`).
pub fn load_client_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    let raw: RawClientSettings = builder
        .add_source(
            config::Environment::with_prefix("SOCIALVIBE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to assemble client settings")?
        .try_deserialize()
        .context("invalid client settings")?;
    Ok(raw.into())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
