//! Latency benchmarks: PAIR round trips over inproc and TCP loopback
//!
//! Each iteration bounces one message through an echo server and back. The
//! sockets are connected once per message size and reused across iterations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use manifold::{Message, Socket};
use std::thread;
use std::time::Duration;

const MESSAGE_SIZES: &[usize] = &[64, 1024];

/// Connect a client to an echo server on `url`; the server thread runs
/// until its socket is closed.
fn echo_pair(url: &str) -> (Socket, Socket, thread::JoinHandle<()>) {
    let server = manifold::pair::open().unwrap();
    let ep = server.listen(url).unwrap();
    let target = server.listener_address(ep).unwrap();

    let echo = server.clone();
    let handle = thread::spawn(move || {
        while let Ok(msg) = echo.recv() {
            if echo.send(msg).is_err() {
                break;
            }
        }
    });

    let client = manifold::pair::open().unwrap();
    client.dial(&target).unwrap();
    (client, server, handle)
}

fn pair_round_trip(c: &mut Criterion) {
    manifold::dev_tracing::init_tracing();
    let mut group = c.benchmark_group("latency/pair");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(20);

    for (transport, url) in [("inproc", "inproc://bench-latency"), ("tcp", "tcp://127.0.0.1:0")] {
        for &size in MESSAGE_SIZES {
            let (client, server, handle) = echo_pair(url);
            group.bench_with_input(
                BenchmarkId::new(transport, format!("{size}B")),
                &size,
                |b, &size| {
                    b.iter(|| {
                        client.send(Message::zeroed(black_box(size))).unwrap();
                        black_box(client.recv().unwrap());
                    });
                },
            );
            client.close();
            server.close();
            handle.join().unwrap();
        }
    }
    group.finish();
}

criterion_group!(benches, pair_round_trip);
criterion_main!(benches);
