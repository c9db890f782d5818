use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use super::*;

const MINIMAL: &str = r#"
[topics]
app_subscribe = "a/sub"
app_publish = "a/pub"
embedded_subscribe = "e/sub"
embedded_publish = "e/pub"
"#;

#[test]
fn test_minimal_config_defaults() {
    let config = Config::parse(MINIMAL).unwrap();

    assert_eq!(config.log.level, "info");
    assert_eq!(config.broker.address, "localhost:1883");
    assert_eq!(config.broker.keepalive, 60);
    assert!(config.broker.clean_session);
    assert_eq!(config.broker.reconnect_interval, 1);
    assert_eq!(config.broker.max_reconnect_interval, 60);
    assert_eq!(config.broker.auth_retry_limit, 3);
    assert_eq!(config.topics.qos, 1);
    assert!(!config.topics.case_insensitive);
    assert_eq!(config.relay.publish_timeout, Duration::from_secs(5));
    assert_eq!(config.relay.max_inflight_publishes, 64);
    assert_eq!(config.relay.command_queue_capacity, 1024);
    assert!(!config.metrics.enabled);
}

#[test]
fn test_full_config() {
    let content = r#"
[log]
level = "debug"

[broker]
address = "broker.example.com:8883"
client_id = "bridge-1"
username = "relay"
password = "secret"
keepalive = 2
clean_session = false
reconnect_interval = 2
max_reconnect_interval = 120
auth_retry_limit = 5

[topics]
app_subscribe = "a/sub"
app_publish = "a/pub"
embedded_subscribe = "e/sub"
embedded_publish = "e/pub"
qos = 0
case_insensitive = true

[relay]
publish_timeout = "30s"
max_inflight_publishes = 8
command_queue_capacity = 256
shutdown_grace = "2s"

[metrics]
enabled = true
bind = "0.0.0.0:9100"
"#;

    let config = Config::parse(content).unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.broker.address, "broker.example.com:8883");
    assert_eq!(config.broker.client_id, "bridge-1");
    assert_eq!(config.broker.username.as_deref(), Some("relay"));
    assert_eq!(config.broker.password.as_deref(), Some("secret"));
    assert_eq!(config.broker.keepalive, 2);
    assert!(!config.broker.clean_session);
    assert_eq!(config.topics.qos, 0);
    assert!(config.topics.case_insensitive);
    assert_eq!(config.relay.publish_timeout, Duration::from_secs(30));
    assert_eq!(config.relay.shutdown_grace, Duration::from_secs(2));
    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.bind, "0.0.0.0:9100".parse().unwrap());
}

#[test]
fn test_missing_topics_rejected() {
    let content = r#"
[topics]
app_subscribe = "a/sub"
app_publish = "a/pub"
embedded_subscribe = "e/sub"
"#;
    let err = Config::parse(content).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("embedded_publish"));
}

#[test]
fn test_invalid_qos_rejected() {
    let content = format!("{}\nqos = 2\n", MINIMAL.trim_end());
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_zero_inflight_rejected() {
    let content = format!("{}\n[relay]\nmax_inflight_publishes = 0\n", MINIMAL);
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_backoff_ceiling_below_floor_rejected() {
    let content = format!(
        "{}\n[broker]\nreconnect_interval = 10\nmax_reconnect_interval = 5\n",
        MINIMAL
    );
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_parse_address() {
    let mut config = Config::parse(MINIMAL).unwrap();

    config.broker.address = "broker.local:8883".to_string();
    assert_eq!(config.broker.parse_address(), ("broker.local".to_string(), 8883));

    config.broker.address = "broker.local".to_string();
    assert_eq!(config.broker.parse_address(), ("broker.local".to_string(), 1883));
}

#[test]
fn test_derived_routes() {
    let content = format!(
        "{}\n[[routes]]\norigin = \"extra/out\"\ndestination = \"extra/in\"\n",
        MINIMAL
    );
    let config = Config::parse(&content).unwrap();
    let routes = config.routes();

    assert_eq!(routes.len(), 3);
    assert_eq!(routes[0].origin, "a/pub");
    assert_eq!(routes[0].destination, "e/sub");
    assert_eq!(routes[1].origin, "e/pub");
    assert_eq!(routes[1].destination, "a/sub");
    assert_eq!(routes[2].origin, "extra/out");
    assert_eq!(routes[2].destination, "extra/in");
}

#[test]
fn test_env_var_substitution() {
    std::env::set_var("RELAYMQ_TEST_SUBST_ADDR", "envhost:1884");
    let substituted = substitute_env_vars(
        "address = \"${RELAYMQ_TEST_SUBST_ADDR}\"\nother = \"${RELAYMQ_TEST_UNSET:-fallback}\"",
    );
    std::env::remove_var("RELAYMQ_TEST_SUBST_ADDR");

    assert!(substituted.contains("envhost:1884"));
    assert!(substituted.contains("fallback"));
}

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    file.flush().unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.topics.app_publish, "a/pub");
    assert_eq!(config.broker.address, "localhost:1883");
}

#[test]
fn test_load_missing_file_requires_topics() {
    // Defaults alone cannot satisfy the topic requirements
    let err = Config::load("/nonexistent/relaymq.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}
