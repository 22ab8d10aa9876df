//! Unit tests for reconnection settings and backoff.

use std::collections::HashMap;
use std::time::Duration;

use proxy_session::models::instance::{
    ReconnectionMode, RuntimeValues, FORCE_FULL_RELOAD_KEY, RECONNECTION_MODE_KEY,
};
use proxy_session::orchestrator::reconnect::{backoff_delay, ReconnectSettings};
use proxy_session::ClientConfig;

#[test]
fn backoff_grows_one_second_per_failed_attempt() {
    assert_eq!(backoff_delay(1), Duration::from_secs(1));
    assert_eq!(backoff_delay(2), Duration::from_secs(2));
    assert_eq!(backoff_delay(7), Duration::from_secs(7));
}

#[test]
fn settings_combine_config_and_runtime_values() {
    let config = ClientConfig::from_toml_str(
        r#"
server_url = "http://localhost/"
app_name = "demo"

[reconnect]
max_attempts = 5
check_count = 4
check_interval_ms = 200
liveness_timeout_ms = 1500
"#,
    )
    .expect("config");
    let values = RuntimeValues::new(HashMap::from([
        (RECONNECTION_MODE_KEY.to_owned(), "Auto".to_owned()),
        (FORCE_FULL_RELOAD_KEY.to_owned(), "true".to_owned()),
    ]));

    let settings = ReconnectSettings::resolve(&config, &values);

    assert_eq!(
        settings,
        ReconnectSettings {
            mode: ReconnectionMode::Auto,
            force_full_reload: true,
            max_attempts: 5,
            check_count: 4,
            check_interval: Duration::from_millis(200),
            liveness_timeout: Duration::from_millis(1500),
        }
    );
}

#[test]
fn missing_runtime_values_mean_confirm_with_reconnect_primitive() {
    let config = ClientConfig::from_toml_str("server_url = \"http://localhost/\"\napp_name = \"demo\"\n")
        .expect("config");
    let settings = ReconnectSettings::resolve(&config, &RuntimeValues::default());

    assert_eq!(settings.mode, ReconnectionMode::Confirm);
    assert!(!settings.force_full_reload);
}
