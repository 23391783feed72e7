//! Public API surface: protocol modules, generic open, async forms.

use manifold::prelude::*;
use std::time::Duration;

#[test]
fn test_protocol_modules_open_expected_ids() {
    for (socket, id, name) in [
        (manifold::pair::open().unwrap(), manifold::pair::ID, "pair"),
        (manifold::push::open().unwrap(), manifold::push::ID, "push"),
        (manifold::pull::open().unwrap(), manifold::pull::ID, "pull"),
    ] {
        assert_eq!(
            socket.get_option(keys::PROTOCOL).unwrap(),
            OptionValue::Int(i64::from(id))
        );
        assert_eq!(
            socket.get_option(keys::PROTOCOL_NAME).unwrap(),
            OptionValue::Str(name.to_string())
        );
        socket.close();
    }
}

#[test]
fn test_open_unknown_protocol() {
    assert!(matches!(
        manifold::open(0x7777),
        Err(ManifoldError::UnsupportedProtocol(0x7777))
    ));
}

#[test]
fn test_open_with_options() {
    let options = SocketOptions::new().with_recv_timeout(Duration::from_millis(20));
    let socket = manifold::pair::open_with(options).unwrap();
    assert!(matches!(socket.recv(), Err(ManifoldError::Timeout)));
    socket.close();
}

#[test]
fn test_async_round_trip() {
    let server = manifold::pair::open().unwrap();
    server.listen("inproc://api-tests-async").unwrap();
    let client = manifold::pair::open().unwrap();
    client.dial("inproc://api-tests-async").unwrap();

    futures::executor::block_on(async {
        client.send_async(Message::from("ping")).await.unwrap();
        let msg = server.recv_async().await.unwrap();
        assert_eq!(msg.body(), b"ping");
        server.send_async(msg).await.unwrap();
        assert_eq!(client.recv_async().await.unwrap().body(), b"ping");
    });

    client.close();
    server.close();
}
