//! Config module tests

use super::*;
use test_case::test_case;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("RELAYMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("RELAYMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("RELAYMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("RELAYMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("RELAYMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("RELAYMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("relaymq.toml");

    std::env::set_var("RELAYMQ_TEST_NODE", "node-sub");
    std::env::set_var("RELAYMQ_TEST_PEER_PORT", "7100");

    let config_content = r#"
[node]
id = "${RELAYMQ_TEST_NODE}"

[cluster]
enabled = true
peer_addr = "127.0.0.1:${RELAYMQ_TEST_PEER_PORT}"
ack_timeout = "${RELAYMQ_TEST_ACK_TIMEOUT:-3s}"
"#;

    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.node.id.as_deref(), Some("node-sub"));
    assert_eq!(config.cluster.peer_addr.to_string(), "127.0.0.1:7100");
    assert_eq!(config.cluster.ack_timeout, Duration::from_secs(3));

    std::env::remove_var("RELAYMQ_TEST_NODE");
    std::env::remove_var("RELAYMQ_TEST_PEER_PORT");
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.queues.consumer_window, 1024);
    assert!(config.redistribution.enabled);
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.queues.consumer_window, 1024);
    assert_eq!(config.queues.load_balancing, LoadBalancing::OnDemand);
    assert!(config.redistribution.enabled);
    assert_eq!(config.redistribution.delay, Duration::ZERO);
    assert_eq!(config.relay.chunk_size, 64 * 1024);
    assert_eq!(config.relay.large_message_threshold, 100 * 1024);
    assert!(!config.cluster.enabled);
    assert!(!config.metrics.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[node]
id = "a"

[queues]
consumer_window = 16
load_balancing = "off"

[[queue]]
name = "orders"

[[queue]]
name = "invoices"

[redistribution]
delay = "500ms"
recheck_interval = "2s"
failure_cooldown = "10s"

[relay]
chunk_size = 4096
large_message_threshold = 8192
spool_dir = "/var/spool/relaymq"

[cluster]
enabled = true
peer_addr = "0.0.0.0:7001"
max_reconnect_attempts = 3

[[cluster.peers]]
id = "b"
addr = "127.0.0.1:7002"

[metrics]
enabled = true
bind = "127.0.0.1:9100"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.node.get_node_id(), "a");
    assert_eq!(config.queues.consumer_window, 16);
    assert_eq!(config.queues.load_balancing, LoadBalancing::Off);
    assert_eq!(
        config.queue,
        vec![
            QueueDeclaration {
                name: "orders".to_string()
            },
            QueueDeclaration {
                name: "invoices".to_string()
            },
        ]
    );
    assert_eq!(config.redistribution.delay, Duration::from_millis(500));
    assert_eq!(config.redistribution.recheck_interval, Duration::from_secs(2));
    assert_eq!(config.redistribution.failure_cooldown, Duration::from_secs(10));
    assert_eq!(config.relay.chunk_size, 4096);
    assert_eq!(config.relay.spool_dir, PathBuf::from("/var/spool/relaymq"));
    assert!(config.cluster.enabled);
    assert_eq!(config.cluster.max_reconnect_attempts, 3);
    assert_eq!(
        config.cluster.peers,
        vec![StaticPeer {
            id: "b".to_string(),
            addr: "127.0.0.1:7002".parse().unwrap()
        }]
    );
    assert!(config.metrics.enabled);
}

#[test_case("[[queue]]\nname = \"has space\"" ; "invalid queue name")]
#[test_case("[relay]\nchunk_size = 0" ; "zero chunk size")]
#[test_case("[relay]\nchunk_size = 4096\nlarge_message_threshold = 1024" ; "threshold below chunk")]
#[test_case("[relay]\nchunk_size = 8388608\nlarge_message_threshold = 8388608" ; "chunk exceeds frame")]
#[test_case("[queues]\nconsumer_window = 0" ; "zero window")]
#[test_case("[cluster]\nmax_reconnect_attempts = 0" ; "zero reconnect attempts")]
#[test_case("[cluster]\nretry_interval = \"1m\"\nmax_retry_interval = \"1s\"" ; "retry above max")]
#[test_case("[[cluster.peers]]\nid = \"b\"\naddr = \"0.0.0.0:7002\"" ; "unspecified peer address")]
#[test_case("[[cluster.peers]]\nid = \"b\"\naddr = \"127.0.0.1:0\"" ; "peer port zero")]
#[test_case("[[cluster.peers]]\nid = \"\"\naddr = \"127.0.0.1:7002\"" ; "empty peer id")]
#[test_case("[node]\nid = \"a\"\n[[cluster.peers]]\nid = \"a\"\naddr = \"127.0.0.1:7002\"" ; "peer is self")]
#[test_case("[[cluster.peers]]\nid = \"b\"\naddr = \"127.0.0.1:7002\"\n[[cluster.peers]]\nid = \"b\"\naddr = \"127.0.0.1:7003\"" ; "duplicate peer")]
#[test_case("[cluster]\nseeds = [\"h:7946\"]\ngossip_addr = \"0.0.0.0:0\"" ; "gossip without port")]
fn test_validation_rejects(content: &str) {
    assert!(matches!(
        Config::parse(content),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_malformed_peer_address_is_parse_error() {
    let result = Config::parse("[[cluster.peers]]\nid = \"b\"\naddr = \"not-an-address\"");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_node_id_falls_back_to_hostname() {
    let node = NodeConfig::default();
    assert!(!node.get_node_id().is_empty());
}
