//! Integration tests for socket options

use manifold_core::error::ManifoldError;
use manifold_core::options::{keys, OptionValue, SocketOptions, MAX_BUFFER};
use std::time::Duration;

#[test]
fn test_builder_values() {
    let opts = SocketOptions::new()
        .with_recv_buffer(16)
        .with_send_buffer(32)
        .with_recv_timeout(Duration::from_millis(250))
        .with_linger(Duration::from_millis(100))
        .with_best_effort(true)
        .with_recv_size_max(1 << 20)
        .with_socket_name("worker-1");

    assert_eq!(opts.recv_buffer, 16);
    assert_eq!(opts.send_buffer, 32);
    assert_eq!(opts.recv_timeout, Some(Duration::from_millis(250)));
    assert_eq!(opts.send_timeout, None);
    assert_eq!(opts.linger, Duration::from_millis(100));
    assert!(opts.best_effort);
    assert_eq!(opts.recv_size_max, 1 << 20);
    assert_eq!(opts.socket_name.as_deref(), Some("worker-1"));
    assert!(opts.validate().is_ok());
}

#[test]
fn test_default_reconnect_values() {
    let opts = SocketOptions::default();
    assert_eq!(opts.reconnect_ivl, Duration::from_millis(100));
    assert_eq!(opts.reconnect_ivl_max, Duration::from_millis(5000));
}

#[test]
fn test_integer_timeouts() {
    let mut opts = SocketOptions::default();
    opts.set(keys::RECV_TIMEOUT, &OptionValue::Int(1500)).unwrap();
    assert_eq!(opts.recv_timeout, Some(Duration::from_millis(1500)));

    opts.set(keys::RECV_TIMEOUT, &OptionValue::Int(-1)).unwrap();
    assert_eq!(opts.recv_timeout, None);

    assert!(matches!(
        opts.set(keys::RECV_TIMEOUT, &OptionValue::Int(-2)),
        Err(ManifoldError::InvalidValue(_))
    ));
    assert_eq!(opts.recv_timeout, None);
}

#[test]
fn test_wrong_types_are_rejected() {
    let mut opts = SocketOptions::default();
    assert!(matches!(
        opts.set(keys::BEST_EFFORT, &OptionValue::Int(1)),
        Err(ManifoldError::InvalidValue(_))
    ));
    assert!(matches!(
        opts.set(keys::RECV_BUFFER, &OptionValue::Str("big".into())),
        Err(ManifoldError::InvalidValue(_))
    ));
    assert!(matches!(
        opts.set(keys::SEND_BUFFER, &OptionValue::Size(MAX_BUFFER + 1)),
        Err(ManifoldError::InvalidValue(_))
    ));
    assert_eq!(opts.send_buffer, 128);
}

#[test]
fn test_unknown_and_readonly_keys() {
    let mut opts = SocketOptions::default();
    assert!(matches!(
        opts.set("no-such-option", &OptionValue::Int(1)),
        Err(ManifoldError::InvalidOption(_))
    ));
    assert!(matches!(
        opts.set(keys::PEER_NAME, &OptionValue::Str("x".into())),
        Err(ManifoldError::ReadOnly(_))
    ));
    assert_eq!(opts.get("no-such-option"), None);
}

#[test]
fn test_socket_name_length() {
    let mut opts = SocketOptions::default();
    assert!(opts.set(keys::SOCKET_NAME, &OptionValue::from("a".repeat(64))).is_ok());
    assert!(opts.set(keys::SOCKET_NAME, &OptionValue::from("a".repeat(65))).is_err());
    assert!(opts.set(keys::SOCKET_NAME, &OptionValue::from("")).is_err());
    assert_eq!(opts.socket_name.map(|n| n.len()), Some(64));
}
