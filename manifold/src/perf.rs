//! Latency and throughput benchmarks over PAIR sockets.
//!
//! Six modes, in client/server pairs:
//!
//! | mode                                 | arguments                               |
//! |--------------------------------------|-----------------------------------------|
//! | `local_lat` / `latency_server`       | `<listen-addr> <msg-size> <roundtrips>` |
//! | `remote_lat` / `latency_client`      | `<connect-to> <msg-size> <roundtrips>`  |
//! | `local_thr` / `throughput_server`    | `<listen-addr> <msg-size> <count>`      |
//! | `remote_thr` / `throughput_client`   | `<connect-to> <msg-size> <count>`       |
//! | `inproc_lat`                         | `<msg-size> <count>`                    |
//! | `inproc_thr`                         | `<msg-size> <count>`                    |
//!
//! The mode comes from `-m <mode>`, from a subcommand, or from the program
//! name (so the binary can be installed under several names). Names match
//! case-insensitively, ignoring any directory and extension.
//!
//! Every exchange runs as a chain of AIO callbacks; the calling thread only
//! waits for the chain to report completion or failure.

use crate::dev_tracing;
use manifold_core::aio::Aio;
use manifold_core::error::ManifoldError;
use manifold_core::message::Message;
use manifold_core::options::keys;
use manifold_core::socket::Socket;
use manifold_core::waitblock::Waitblock;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Inproc address used by `inproc_lat`.
pub const INPROC_LATENCY_ADDR: &str = "inproc://latency_test";

/// Inproc address used by `inproc_thr`.
pub const INPROC_THROUGHPUT_ADDR: &str = "inproc://tput_test";

/// Largest accepted size or count.
pub const MAX_ARG: usize = 1 << 30;

/// Errors reported by the benchmark; the binary prints them and exits 2.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("Unknown program mode? Use -m <mode>.")]
    UnknownMode,

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid {0}")]
    InvalidArgument(&'static str),

    #[error("bad message ssize")]
    BadMessageSize,

    #[error("wrong message size: {got} != {expected}")]
    WrongMessageSize { got: usize, expected: usize },

    #[error("{op}: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: ManifoldError,
    },

    #[error("Cannot create thread: {0}")]
    Thread(#[from] io::Error),

    #[error("benchmark thread panicked")]
    Panicked,
}

fn op(op: &'static str) -> impl FnOnce(ManifoldError) -> PerfError {
    move |source| PerfError::Socket { op, source }
}

// --- mode selection ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    LatencyServer,
    LatencyClient,
    ThroughputServer,
    ThroughputClient,
    InprocLatency,
    InprocThroughput,
}

const MODE_NAMES: &[(&str, Mode)] = &[
    ("remote_lat", Mode::LatencyClient),
    ("latency_client", Mode::LatencyClient),
    ("local_lat", Mode::LatencyServer),
    ("latency_server", Mode::LatencyServer),
    ("local_thr", Mode::ThroughputServer),
    ("throughput_server", Mode::ThroughputServer),
    ("remote_thr", Mode::ThroughputClient),
    ("throughput_client", Mode::ThroughputClient),
    ("inproc_thr", Mode::InprocThroughput),
    ("inproc_lat", Mode::InprocLatency),
];

/// Check whether `arg` names the mode `name`.
///
/// Anything up to the last `/`, `\` or `:` is ignored, the comparison is
/// case-insensitive, and the name may be followed by an extension.
#[must_use]
pub fn matches(arg: &str, name: &str) -> bool {
    let base = arg
        .rfind(|c| matches!(c, '/' | '\\' | ':'))
        .map_or(arg, |at| &arg[at + 1..]);
    let (Some(head), Some(rest)) = (base.get(..name.len()), base.get(name.len()..)) else {
        return false;
    };
    head.eq_ignore_ascii_case(name) && (rest.is_empty() || rest.starts_with('.'))
}

impl Mode {
    /// Resolve a program or mode name.
    #[must_use]
    pub fn from_name(arg: &str) -> Option<Self> {
        MODE_NAMES
            .iter()
            .find(|(name, _)| matches(arg, name))
            .map(|&(_, mode)| mode)
    }

    /// Resolve a subcommand; unlike program names these must match exactly,
    /// ignoring case.
    #[must_use]
    pub fn from_subcommand(arg: &str) -> Option<Self> {
        MODE_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(arg))
            .map(|&(_, mode)| mode)
    }

    #[must_use]
    pub const fn usage(self) -> &'static str {
        match self {
            Self::LatencyServer => "local_lat <listen-addr> <msg-size> <roundtrips>",
            Self::LatencyClient => "remote_lat <connect-to> <msg-size> <roundtrips>",
            Self::ThroughputServer => "local_thr <listen-addr> <msg-size> <count>",
            Self::ThroughputClient => "remote_thr <connect-to> <msg-size> <count>",
            Self::InprocLatency => "inproc_lat <msg-size> <count>",
            Self::InprocThroughput => "inproc_thr <msg-size> <count>",
        }
    }

    const fn count_name(self) -> &'static str {
        match self {
            Self::LatencyServer | Self::LatencyClient => "round-trips",
            _ => "count",
        }
    }

    const fn needs_address(self) -> bool {
        !matches!(self, Self::InprocLatency | Self::InprocThroughput)
    }
}

/// A fully parsed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub mode: Mode,
    /// Listen or connect address; `None` for the inproc modes.
    pub addr: Option<String>,
    pub msg_size: usize,
    pub count: usize,
}

/// Parse a size or count: a decimal integer in `0..=2^30`.
///
/// # Errors
///
/// `InvalidArgument(what)` otherwise.
pub fn parse_int(arg: &str, what: &'static str) -> Result<usize, PerfError> {
    match arg.parse::<usize>() {
        Ok(v) if v <= MAX_ARG => Ok(v),
        _ => Err(PerfError::InvalidArgument(what)),
    }
}

/// Parse a full argument vector, program name first.
///
/// # Errors
///
/// `UnknownMode`, `Usage` for a wrong argument count, or `InvalidArgument`.
pub fn parse_args<I, S>(args: I) -> Result<Command, PerfError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let program = args.first().map_or("", String::as_str);

    let (mode, rest) = if args.len() >= 3 && args[1] == "-m" {
        (Mode::from_name(&args[2]), &args[3..])
    } else if let Some(mode) = args.get(1).and_then(|a| Mode::from_subcommand(a)) {
        (Some(mode), &args[2..])
    } else {
        (Mode::from_name(program), args.get(1..).unwrap_or(&[]))
    };
    let mode = mode.ok_or(PerfError::UnknownMode)?;

    let (addr, numbers) = if mode.needs_address() {
        match rest {
            [addr, size, count] => (Some(addr.clone()), [size, count]),
            _ => return Err(PerfError::Usage(mode.usage())),
        }
    } else {
        match rest {
            [size, count] => (None, [size, count]),
            _ => return Err(PerfError::Usage(mode.usage())),
        }
    };

    Ok(Command {
        mode,
        addr,
        msg_size: parse_int(numbers[0], "message size")?,
        count: parse_int(numbers[1], mode.count_name())?,
    })
}

// --- reports ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyReport {
    pub total: Duration,
    pub msg_size: usize,
    pub round_trips: usize,
}

impl LatencyReport {
    /// One-way latency in microseconds.
    #[must_use]
    pub fn average_latency_us(&self) -> f64 {
        if self.round_trips == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1_000_000.0 / (self.round_trips as f64 * 2.0)
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total time: {:.3} [s]", self.total.as_secs_f64())?;
        writeln!(f, "message size: {} [B]", self.msg_size)?;
        writeln!(f, "round trip count: {}", self.round_trips)?;
        write!(f, "average latency: {:.3} [us]", self.average_latency_us())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub total: Duration,
    pub msg_size: usize,
    pub count: usize,
}

impl ThroughputReport {
    #[must_use]
    pub fn messages_per_sec(&self) -> f64 {
        let secs = self.total.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.count as f64 / secs
    }

    #[must_use]
    pub fn megabits_per_sec(&self) -> f64 {
        self.messages_per_sec() * 8.0 * self.msg_size as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total time: {:.3} [s]", self.total.as_secs_f64())?;
        writeln!(f, "message size: {} [B]", self.msg_size)?;
        writeln!(f, "message count: {}", self.count)?;
        writeln!(f, "throughput: {:.0} [msg/s]", self.messages_per_sec())?;
        write!(f, "throughput: {:.3} [Mb/s]", self.megabits_per_sec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
    Latency(LatencyReport),
    Throughput(ThroughputReport),
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latency(r) => r.fmt(f),
            Self::Throughput(r) => r.fmt(f),
        }
    }
}

// --- AIO chains ------------------------------------------------------------

type Step = fn(&Chain, &Aio);

/// Two AIOs driving one socket until `remaining` reaches zero.
struct Chain {
    socket: Socket,
    msg_size: usize,
    remaining: AtomicUsize,
    tx: Aio,
    rx: Aio,
    done: Waitblock,
    failure: Mutex<Option<PerfError>>,
}

fn step(weak: &Weak<Chain>, f: Step) -> impl Fn(&Aio) + Send + Sync + 'static {
    let weak = weak.clone();
    move |aio| {
        if let Some(chain) = weak.upgrade() {
            f(&chain, aio);
        }
    }
}

fn ignore(_: &Chain, _: &Aio) {}

impl Chain {
    fn new(socket: Socket, msg_size: usize, count: usize, on_tx: Step, on_rx: Step) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            socket,
            msg_size,
            remaining: AtomicUsize::new(count),
            tx: Aio::with_callback(step(weak, on_tx)),
            rx: Aio::with_callback(step(weak, on_rx)),
            done: Waitblock::new(),
            failure: Mutex::new(None),
        })
    }

    fn fail(&self, err: PerfError) {
        self.failure.lock().get_or_insert(err);
        self.done.done();
    }

    /// Count one exchange; `true` once all are done.
    fn tick(&self) -> bool {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.done();
            true
        } else {
            false
        }
    }

    fn send(&self, msg: Message) {
        self.tx.set_msg(msg);
        if let Err(e) = self.socket.send_aio(&self.tx) {
            self.fail(op("sendmsg")(e));
        }
    }

    fn recv(&self) {
        if let Err(e) = self.socket.recv_aio(&self.rx) {
            self.fail(op("recvmsg")(e));
        }
    }

    /// Take the received message, checking the AIO result.
    fn received(&self, aio: &Aio) -> Option<Message> {
        if let Err(e) = aio.result() {
            self.fail(op("recvmsg")(e));
            return None;
        }
        let msg = aio.take_msg();
        if msg.is_none() {
            self.fail(op("recvmsg")(ManifoldError::protocol("no message")));
        }
        msg
    }

    fn sent(&self, aio: &Aio) -> bool {
        match aio.result() {
            Ok(()) => true,
            Err(e) => {
                self.fail(op("sendmsg")(e));
                false
            }
        }
    }

    /// Wait for the chain, then stop both AIOs.
    fn wait(&self) -> Result<(), PerfError> {
        self.done.wait();
        self.tx.stop();
        self.rx.stop();
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn latency_client_tx(chain: &Chain, aio: &Aio) {
    if chain.sent(aio) {
        chain.recv();
    }
}

fn latency_client_rx(chain: &Chain, aio: &Aio) {
    let Some(msg) = chain.received(aio) else {
        return;
    };
    if msg.len() != chain.msg_size {
        chain.fail(PerfError::BadMessageSize);
        return;
    }
    if !chain.tick() {
        chain.send(msg);
    }
}

fn latency_server_rx(chain: &Chain, aio: &Aio) {
    let Some(msg) = chain.received(aio) else {
        return;
    };
    if msg.len() != chain.msg_size {
        chain.fail(PerfError::BadMessageSize);
        return;
    }
    chain.send(msg);
}

fn latency_server_tx(chain: &Chain, aio: &Aio) {
    if chain.sent(aio) && !chain.tick() {
        chain.recv();
    }
}

fn throughput_server_rx(chain: &Chain, aio: &Aio) {
    let Some(msg) = chain.received(aio) else {
        return;
    };
    if msg.len() != chain.msg_size {
        chain.fail(PerfError::WrongMessageSize {
            got: msg.len(),
            expected: chain.msg_size,
        });
        return;
    }
    if !chain.tick() {
        chain.recv();
    }
}

fn throughput_client_tx(chain: &Chain, aio: &Aio) {
    if chain.sent(aio) && !chain.tick() {
        chain.send(Message::zeroed(chain.msg_size));
    }
}

fn open_pair() -> Result<Socket, PerfError> {
    crate::pair::open().map_err(op("socket"))
}

/// Run `body` and close `socket` whatever it returns.
fn with_socket<T>(socket: Socket, body: impl FnOnce(&Socket) -> Result<T, PerfError>) -> Result<T, PerfError> {
    let result = body(&socket);
    socket.close();
    result
}

// --- benchmark roles -------------------------------------------------------

/// Dial `addr` and bounce one message of `msg_size` bytes `trips` times.
///
/// # Errors
///
/// Socket errors, or `BadMessageSize` if the echo has the wrong length.
pub fn latency_client(addr: &str, msg_size: usize, trips: usize) -> Result<LatencyReport, PerfError> {
    with_socket(open_pair()?, |socket| {
        socket.dial(addr).map_err(op("dial"))?;
        debug!(addr, msg_size, trips, "[PERF] Latency client connected");

        let start = Instant::now();
        if trips > 0 {
            let chain = Chain::new(
                socket.clone(),
                msg_size,
                trips,
                latency_client_tx,
                latency_client_rx,
            );
            chain.send(Message::zeroed(msg_size));
            chain.wait()?;
        }
        Ok(LatencyReport {
            total: start.elapsed(),
            msg_size,
            round_trips: trips,
        })
    })
}

/// Listen on `addr` and echo `trips` messages of `msg_size` bytes.
///
/// # Errors
///
/// Socket errors, or `BadMessageSize`.
pub fn latency_server(addr: &str, msg_size: usize, trips: usize) -> Result<(), PerfError> {
    with_socket(open_pair()?, |socket| {
        socket.listen(addr).map_err(op("listen"))?;
        debug!(addr, msg_size, trips, "[PERF] Latency server listening");

        if trips > 0 {
            let chain = Chain::new(
                socket.clone(),
                msg_size,
                trips,
                latency_server_tx,
                latency_server_rx,
            );
            chain.recv();
            chain.wait()?;
        }
        // Let the last reply leave before closing.
        thread::sleep(Duration::from_millis(100));
        Ok(())
    })
}

/// Listen on `addr`, wait for the start message, then time the receipt of
/// `count` messages of `msg_size` bytes.
///
/// # Errors
///
/// Socket errors, or `WrongMessageSize`.
pub fn throughput_server(
    addr: &str,
    msg_size: usize,
    count: usize,
) -> Result<ThroughputReport, PerfError> {
    with_socket(open_pair()?, |socket| {
        socket
            .set_option(keys::RECV_BUFFER, 128_i64)
            .map_err(op("setopt(recv-buffer)"))?;
        socket.listen(addr).map_err(op("listen"))?;
        debug!(addr, msg_size, count, "[PERF] Throughput server listening");

        socket.recv().map_err(op("recvmsg"))?;
        let start = Instant::now();
        if count > 0 {
            let chain = Chain::new(socket.clone(), msg_size, count, ignore, throughput_server_rx);
            chain.recv();
            chain.wait()?;
        }
        let total = start.elapsed();

        // Tell the client we are done and give the message time to leave.
        if let Err(e) = socket.send(Message::new()) {
            debug!("[PERF] Final sync message not sent: {}", e);
        }
        thread::sleep(Duration::from_millis(200));
        Ok(ThroughputReport {
            total,
            msg_size,
            count,
        })
    })
}

/// Dial `addr`, send a zero-length start message, then `count` messages of
/// `msg_size` bytes, and wait (up to 5 s) for the server's final message.
///
/// # Errors
///
/// Socket errors.
pub fn throughput_client(addr: &str, msg_size: usize, count: usize) -> Result<(), PerfError> {
    with_socket(open_pair()?, |socket| {
        socket
            .set_option(keys::SEND_BUFFER, 128_i64)
            .map_err(op("setopt(send-buffer)"))?;
        socket
            .set_option(keys::RECV_TIMEOUT, Duration::from_millis(5000))
            .map_err(op("setopt(recv-timeout)"))?;
        socket.dial(addr).map_err(op("dial"))?;
        debug!(addr, msg_size, count, "[PERF] Throughput client connected");

        socket.send(Message::new()).map_err(op("sendmsg"))?;
        if count > 0 {
            let chain = Chain::new(socket.clone(), msg_size, count, throughput_client_tx, ignore);
            chain.send(Message::zeroed(msg_size));
            chain.wait()?;
        }
        if let Err(e) = socket.recv() {
            debug!("[PERF] No final sync message: {}", e);
        }
        Ok(())
    })
}

fn join<T>(handle: thread::JoinHandle<Result<T, PerfError>>) -> Result<T, PerfError> {
    handle.join().map_err(|_| PerfError::Panicked)?
}

/// Latency server on a background thread, client on this one, over `addr`.
///
/// # Errors
///
/// The client's error, else the server's.
pub fn inproc_latency_at(addr: &str, msg_size: usize, count: usize) -> Result<LatencyReport, PerfError> {
    let server_addr = addr.to_string();
    let server = thread::Builder::new()
        .name("perf-latency-server".into())
        .spawn(move || latency_server(&server_addr, msg_size, count))?;
    thread::sleep(Duration::from_millis(100));

    let report = latency_client(addr, msg_size, count);
    let served = join(server);
    let report = report?;
    served?;
    Ok(report)
}

/// Throughput server on a background thread, client on this one, over
/// `addr`. The report is the server's.
///
/// # Errors
///
/// The client's error, else the server's.
pub fn inproc_throughput_at(
    addr: &str,
    msg_size: usize,
    count: usize,
) -> Result<ThroughputReport, PerfError> {
    let server_addr = addr.to_string();
    let server = thread::Builder::new()
        .name("perf-throughput-server".into())
        .spawn(move || throughput_server(&server_addr, msg_size, count))?;
    thread::sleep(Duration::from_millis(100));

    let sent = throughput_client(addr, msg_size, count);
    let report = join(server);
    sent?;
    report
}

/// Execute a parsed command. Returns the report the mode prints, if any.
///
/// # Errors
///
/// Any benchmark error.
pub fn run(cmd: &Command) -> Result<Option<Report>, PerfError> {
    dev_tracing::init_tracing();
    let addr = || cmd.addr.as_deref().ok_or(PerfError::Usage(cmd.mode.usage()));
    let (size, count) = (cmd.msg_size, cmd.count);
    match cmd.mode {
        Mode::LatencyServer => latency_server(addr()?, size, count).map(|()| None),
        Mode::LatencyClient => latency_client(addr()?, size, count).map(|r| Some(Report::Latency(r))),
        Mode::ThroughputServer => {
            throughput_server(addr()?, size, count).map(|r| Some(Report::Throughput(r)))
        }
        Mode::ThroughputClient => throughput_client(addr()?, size, count).map(|()| None),
        Mode::InprocLatency => {
            inproc_latency_at(INPROC_LATENCY_ADDR, size, count).map(|r| Some(Report::Latency(r)))
        }
        Mode::InprocThroughput => inproc_throughput_at(INPROC_THROUGHPUT_ADDR, size, count)
            .map(|r| Some(Report::Throughput(r))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        assert!(matches("remote_lat", "remote_lat"));
        assert!(matches("/usr/local/bin/REMOTE_LAT", "remote_lat"));
        assert!(matches("C:\\bin\\remote_lat.exe", "remote_lat"));
        assert!(matches("c:remote_lat", "remote_lat"));
        assert!(!matches("remote_latency", "remote_lat"));
        assert!(!matches("remote", "remote_lat"));
        assert!(!matches("x_remote_lat", "remote_lat"));
    }

    #[test]
    fn test_parse_int_bounds() {
        assert_eq!(parse_int("0", "count").unwrap(), 0);
        assert_eq!(parse_int("1073741824", "count").unwrap(), MAX_ARG);
        for bad in ["1073741825", "-1", "12abc", "", " 5"] {
            assert!(matches!(
                parse_int(bad, "count"),
                Err(PerfError::InvalidArgument("count"))
            ));
        }
    }

    #[test]
    fn test_mode_sources() {
        let cmd = parse_args(["perf", "-m", "remote_lat", "tcp://127.0.0.1:5555", "64", "10"]).unwrap();
        assert_eq!(cmd.mode, Mode::LatencyClient);
        assert_eq!(cmd.addr.as_deref(), Some("tcp://127.0.0.1:5555"));

        let cmd = parse_args(["perf", "inproc_thr", "1024", "100"]).unwrap();
        assert_eq!(cmd.mode, Mode::InprocThroughput);
        assert_eq!((cmd.msg_size, cmd.count), (1024, 100));

        let cmd = parse_args(["/opt/bin/Local_Thr.exe", "tcp://*:5555", "8", "9"]).unwrap();
        assert_eq!(cmd.mode, Mode::ThroughputServer);

        // An address that happens to end in a mode name is not a subcommand.
        let cmd = parse_args(["local_lat", "inproc://remote_lat", "8", "9"]).unwrap();
        assert_eq!(cmd.mode, Mode::LatencyServer);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_args(["perf"]).unwrap_err().to_string(),
            "Unknown program mode? Use -m <mode>."
        );
        assert_eq!(
            parse_args(["local_lat", "tcp://*:1", "64"]).unwrap_err().to_string(),
            "Usage: local_lat <listen-addr> <msg-size> <roundtrips>"
        );
        assert_eq!(
            parse_args(["perf", "-m", "remote_lat", "inproc://x", "64", "many"])
                .unwrap_err()
                .to_string(),
            "Invalid round-trips"
        );
        assert_eq!(
            parse_args(["inproc_lat", "big", "1"]).unwrap_err().to_string(),
            "Invalid message size"
        );
    }

    #[test]
    fn test_report_lines() {
        let report = LatencyReport {
            total: Duration::from_millis(2000),
            msg_size: 64,
            round_trips: 1000,
        };
        assert_eq!(
            report.to_string(),
            "total time: 2.000 [s]\nmessage size: 64 [B]\nround trip count: 1000\naverage latency: 1000.000 [us]"
        );

        let report = ThroughputReport {
            total: Duration::from_secs(2),
            msg_size: 1024,
            count: 1000,
        };
        assert_eq!(
            report.to_string(),
            "total time: 2.000 [s]\nmessage size: 1024 [B]\nmessage count: 1000\nthroughput: 500 [msg/s]\nthroughput: 3.906 [Mb/s]"
        );
    }
}
