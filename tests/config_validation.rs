//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use dcerpc_engine::config::{ClientConfig, LoggingConfig, RpcConfig, SecurityConfig, ServerConfig};
use dcerpc_engine::core::syntax::TransferSyntax;
use dcerpc_engine::security::AuthLevel;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = RpcConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_client_binding() {
    let mut config = RpcConfig::default();
    config.client.binding = "tcp://127.0.0.1:135".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("binding")));
}

#[test]
fn test_empty_server_binding() {
    let mut config = RpcConfig::default();
    config.server.binding = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_non_numeric_tcp_endpoint() {
    let config = RpcConfig::default_with_overrides(|c| {
        c.server.binding = "ncacn_ip_tcp:0.0.0.0[epmapper]".to_string();
    });
    assert!(!config.validate().is_empty());
}

#[test]
fn test_fragment_sizes_below_minimum() {
    let client = ClientConfig {
        max_xmit_frag: 1000,
        ..ClientConfig::default()
    };
    let errors = client.validate();
    assert!(errors.iter().any(|e| e.contains("too small")));

    let server = ServerConfig {
        max_recv_frag: 16,
        ..ServerConfig::default()
    };
    assert!(!server.validate().is_empty());
}

#[test]
fn test_transfer_syntax_lists() {
    let empty = ClientConfig {
        transfer_syntaxes: Vec::new(),
        ..ClientConfig::default()
    };
    assert!(empty
        .validate()
        .iter()
        .any(|e| e.contains("at least one transfer syntax")));

    let duplicated = ServerConfig {
        transfer_syntaxes: vec![TransferSyntax::Ndr64, TransferSyntax::Ndr64],
        ..ServerConfig::default()
    };
    assert!(duplicated
        .validate()
        .iter()
        .any(|e| e.contains("more than once")));
}

#[test]
fn test_call_timeout_bounds() {
    let config = ClientConfig {
        call_timeout: Duration::from_millis(1),
        ..ClientConfig::default()
    };
    assert!(config.validate().iter().any(|e| e.contains("Call timeout")));

    let config = ClientConfig {
        connect_timeout: Duration::from_secs(600),
        ..ClientConfig::default()
    };
    assert!(config.validate().iter().any(|e| e.contains("too long")));
}

#[test]
fn test_server_limits() {
    let config = ServerConfig {
        max_concurrent_calls: 0,
        max_connections: 0,
        shutdown_timeout: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("concurrent calls")));
    assert!(errors.iter().any(|e| e.contains("Max connections")));
    assert!(errors.iter().any(|e| e.contains("Shutdown timeout")));
}

#[test]
fn test_security_level_needs_mechanism() {
    let config = SecurityConfig {
        level: AuthLevel::Integrity,
        mechanisms: Vec::new(),
        ..SecurityConfig::default()
    };
    assert!(config.validate().iter().any(|e| e.contains("requires")));

    let config = SecurityConfig {
        level: AuthLevel::Privacy,
        allow_unauthenticated_fallback: true,
        ..SecurityConfig::default()
    };
    assert!(config.validate().iter().any(|e| e.contains("fallback")));

    let config = SecurityConfig {
        mechanisms: vec!["ecdh".into(), "ecdh".into()],
        ..SecurityConfig::default()
    };
    assert!(config.validate().iter().any(|e| e.contains("more than once")));
}

#[test]
fn test_logging_file_requires_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path")));
}

#[test]
fn test_validate_strict_reports_all() {
    let config = RpcConfig::default_with_overrides(|c| {
        c.client.binding = String::new();
        c.server.max_connections = 0;
    });
    let err = config.validate_strict().expect_err("Invalid config should fail");
    let message = err.to_string();
    assert!(message.contains("cannot be empty"));
    assert!(message.contains("Max connections"));
}

#[test]
fn test_toml_overrides_defaults() {
    let text = r#"
        [client]
        binding = "ncacn_ip_tcp:rpc.example.net[49664]"
        transfer_syntaxes = ["ndr64", "ndr20"]
        integer_order = "big"
        max_xmit_frag = 5840
        max_recv_frag = 5840
        assoc_group_id = 0
        call_timeout = 2500
        connect_timeout = 1000
        max_call_size = 1048576

        [server]
        binding = "ncalrpc:[/tmp/dcerpc.sock]"
        transfer_syntaxes = ["ndr20"]
        max_xmit_frag = 4280
        max_recv_frag = 4280
        max_concurrent_calls = 8
        max_connections = 32
        max_call_size = 1048576
        min_auth_level = "integrity"
        shutdown_timeout = 5000

        [security]
        level = "privacy"
        mechanisms = ["ecdh"]
        target_name = "host/rpc.example.net"
        allow_unauthenticated_fallback = false

        [logging]
        app_name = "rpc-test"
        log_level = "debug"
        log_to_console = true
        log_to_file = false
        json_format = false
    "#;
    let config = RpcConfig::from_toml(text).expect("TOML should parse");
    assert_eq!(config.client.call_timeout, Duration::from_millis(2500));
    assert_eq!(
        config.client.transfer_syntaxes,
        vec![TransferSyntax::Ndr64, TransferSyntax::Ndr20]
    );
    assert_eq!(config.server.min_auth_level, AuthLevel::Integrity);
    assert_eq!(config.security.level, AuthLevel::Privacy);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty(), "{:?}", config.validate());
}

#[test]
fn test_partial_sections_keep_defaults() {
    let config = RpcConfig::from_toml(
        r#"
        [server]
        max_concurrent_calls = 4

        [security]
        level = "integrity"
        "#,
    )
    .expect("partial TOML should parse");
    assert_eq!(config.server.max_concurrent_calls, 4);
    assert_eq!(
        config.server.shutdown_timeout,
        ServerConfig::default().shutdown_timeout
    );
    assert_eq!(config.security.level, AuthLevel::Integrity);
    assert_eq!(config.client.max_xmit_frag, ClientConfig::default().max_xmit_frag);
}
