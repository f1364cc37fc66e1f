use std::path::PathBuf;

use super::*;

struct TempToml(PathBuf);

impl TempToml {
    fn new(contents: &str) -> Self {
        let path = std::env::temp_dir().join(format!("client-settings-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).expect("write settings file");
        Self(path)
    }
}

impl Drop for TempToml {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[test]
fn defaults_match_documented_timings() {
    let settings = ClientSettings::default();
    assert_eq!(settings.page_size, 20);
    assert_eq!(settings.reconnect.base_delay, Duration::from_secs(1));
    assert_eq!(settings.reconnect.max_delay, Duration::from_secs(10));
    assert_eq!(settings.reconnect.max_attempts, 5);
    assert_eq!(settings.reconnect.connect_timeout, Duration::from_secs(20));
    assert_eq!(settings.message_poll, PollPolicy::messages());
    assert_eq!(settings.list_poll, PollPolicy::conversation_list());
    assert_eq!(settings.typing_window, Duration::from_secs(3));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let path = std::env::temp_dir().join("client-settings-that-does-not-exist.toml");
    let settings = load_client_settings(Some(&path)).expect("load");
    assert_eq!(settings.page_size, ClientSettings::default().page_size);
    assert_eq!(settings.reconnect, ClientSettings::default().reconnect);
}

#[test]
fn file_values_are_normalized() {
    let file = TempToml::new(
        r#"
server_url = "https://chat.example.com/"
page_size = 500
reconnect_max_attempts = 0
message_poll_interval_ms = 2500
typing_window_ms = 1500
"#,
    );
    let settings = load_client_settings(Some(&file.0)).expect("load");
    assert_eq!(settings.server_url, "https://chat.example.com");
    assert_eq!(settings.page_size, 100);
    assert_eq!(settings.reconnect.max_attempts, 1);
    assert_eq!(settings.message_poll.interval, Duration::from_millis(2500));
    assert_eq!(settings.message_poll.grace, Duration::from_secs(3));
    assert_eq!(settings.typing_window, Duration::from_millis(1500));
    assert_eq!(settings.list_poll, PollPolicy::conversation_list());
}
