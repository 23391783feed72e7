//! End-to-end runs of the benchmark roles.

use manifold::perf::{self, PerfError};
use std::thread;
use std::time::Duration;

#[test]
fn test_inproc_latency() {
    let report = perf::inproc_latency_at("inproc://perf-test-latency", 64, 1000).unwrap();
    assert_eq!(report.msg_size, 64);
    assert_eq!(report.round_trips, 1000);
    assert!(report.average_latency_us() > 0.0);

    let text = report.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("total time: "));
    assert_eq!(lines[1], "message size: 64 [B]");
    assert_eq!(lines[2], "round trip count: 1000");
    assert!(lines[3].starts_with("average latency: ") && lines[3].ends_with(" [us]"));
}

#[test]
fn test_inproc_throughput() {
    let report = perf::inproc_throughput_at("inproc://perf-test-throughput", 1024, 5000).unwrap();
    assert_eq!(report.count, 5000);
    assert_eq!(report.msg_size, 1024);
    assert!(report.messages_per_sec() > 0.0);
    assert!(report.to_string().contains("message count: 5000"));
}

#[test]
fn test_tcp_latency() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let addr = format!("tcp://127.0.0.1:{port}");
    let server_addr = addr.clone();
    let server = thread::spawn(move || perf::latency_server(&server_addr, 128, 200));
    thread::sleep(Duration::from_millis(100));

    let report = perf::latency_client(&addr, 128, 200).unwrap();
    assert_eq!(report.round_trips, 200);
    server.join().unwrap().unwrap();
}

#[test]
fn test_size_mismatch_is_reported() {
    let addr = "inproc://perf-test-mismatch";
    let server = thread::spawn(move || perf::throughput_server(addr, 100, 10));
    thread::sleep(Duration::from_millis(100));

    // The client sends 50-byte messages to a server expecting 100.
    let _ = perf::throughput_client(addr, 50, 10);
    match server.join().unwrap() {
        Err(PerfError::WrongMessageSize { got, expected }) => {
            assert_eq!((got, expected), (50, 100));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_dial_without_server() {
    let err = perf::latency_client("inproc://perf-test-nobody", 8, 1).unwrap_err();
    assert!(err.to_string().starts_with("dial: "));
}

#[test]
fn test_zero_counts() {
    let report = perf::inproc_latency_at("inproc://perf-test-zero", 8, 0).unwrap();
    assert_eq!(report.average_latency_us(), 0.0);
    let report = perf::inproc_throughput_at("inproc://perf-test-zero-thr", 8, 0).unwrap();
    assert_eq!(report.count, 0);
}
