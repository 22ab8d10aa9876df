use std::time::Duration;

use proxy_session::{AppError, ClientConfig};

fn sample_toml() -> &'static str {
    r#"
server_url = "https://proxy.example.com/shiny"
app_name = "dashboard"
app_instance = "team-a"
container_sub_path = "index.html"
timezone = "Europe/Brussels"
instance_override = "blue"

[heartbeat]
rate_ms = 5000

[reconnect]
max_attempts = 4
check_count = 6
check_interval_ms = 100
liveness_timeout_ms = 2000

[long_poll]
timeout_seconds = 20
request_margin_ms = 1500

[injector]
poll_interval_ms = 25
"#
}

#[test]
fn parses_valid_config() {
    let config = ClientConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.server_url, "https://proxy.example.com/shiny/");
    assert_eq!(config.app_name, "dashboard");
    assert_eq!(config.app_instance, "team-a");
    assert_eq!(config.container_sub_path, "index.html");
    assert_eq!(config.timezone, "Europe/Brussels");
    assert_eq!(config.instance_override.as_deref(), Some("blue"));
    assert_eq!(config.heartbeat_rate(), Duration::from_secs(5));
    assert_eq!(config.reconnect.max_attempts, 4);
    assert_eq!(config.reconnect.check_count, 6);
    assert_eq!(config.check_interval(), Duration::from_millis(100));
    assert_eq!(config.liveness_timeout(), Duration::from_secs(2));
    assert_eq!(config.long_poll.timeout_seconds, 20);
    assert_eq!(config.long_poll_margin(), Duration::from_millis(1500));
    assert_eq!(config.injector_poll_interval(), Duration::from_millis(25));
}

#[test]
fn minimal_config_uses_defaults() {
    let config = ClientConfig::from_toml_str(
        r#"
server_url = "http://localhost:8080/"
app_name = "demo"
"#,
    )
    .expect("config parses");

    assert_eq!(config.app_instance, "_");
    assert_eq!(config.container_sub_path, "");
    assert_eq!(config.timezone, "UTC");
    assert!(config.instance_override.is_none());
    assert_eq!(config.heartbeat_rate(), Duration::from_secs(10));
    assert_eq!(config.reconnect.max_attempts, 10);
    assert_eq!(config.reconnect.check_count, 10);
    assert_eq!(config.check_interval(), Duration::from_millis(250));
    assert_eq!(config.liveness_timeout(), Duration::from_secs(3));
    assert_eq!(config.long_poll.timeout_seconds, 10);
    assert_eq!(config.long_poll_margin(), Duration::from_secs(10));
    assert_eq!(config.injector_poll_interval(), Duration::from_millis(50));
}

#[test]
fn rejects_non_http_server_url() {
    let result = ClientConfig::from_toml_str(
        r#"
server_url = "ftp://proxy.example.com/"
app_name = "demo"
"#,
    );
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("server_url")));
}

#[test]
fn rejects_empty_app_name() {
    let result = ClientConfig::from_toml_str(
        r#"
server_url = "http://localhost/"
app_name = "  "
"#,
    );
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("app_name")));
}

#[test]
fn rejects_zero_intervals() {
    let cases = [
        ("[heartbeat]\nrate_ms = 0", "heartbeat.rate_ms"),
        ("[reconnect]\nmax_attempts = 0", "reconnect.max_attempts"),
        ("[reconnect]\ncheck_count = 0", "reconnect.check_count"),
        ("[long_poll]\ntimeout_seconds = 0", "long_poll.timeout_seconds"),
        ("[injector]\npoll_interval_ms = 0", "injector.poll_interval_ms"),
    ];
    for (section, field) in cases {
        let raw = format!("server_url = \"http://localhost/\"\napp_name = \"demo\"\n{section}\n");
        let result = ClientConfig::from_toml_str(&raw);
        assert!(
            matches!(&result, Err(AppError::Config(msg)) if msg.contains(field)),
            "{field}: {result:?}"
        );
    }
}

#[test]
fn rejects_invalid_toml() {
    let result = ClientConfig::from_toml_str("server_url = ");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.starts_with("invalid config")));
}

#[test]
fn loads_from_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = ClientConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.app_name, "dashboard");
}

#[test]
fn missing_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = ClientConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("failed to read config")));
}
