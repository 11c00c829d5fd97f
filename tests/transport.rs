//! Transport-level tests: the backlog discipline, flow control, the
//! pause_reading override, shutdown coordination and error stickiness,
//! over in-memory carriers, a real TCP connection, and a mock engine.

mod common;

use std::cell::{Cell, RefCell};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use tlspipe::{
    Carrier, EngineConfig, EngineError, Error, Protocol, ReadEvent, RecordIo, Role, TlsEngine,
    TlsPipe, TlsTransport, TransportOptions,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scenario: echo over an in-memory carrier pair
#[test]
fn echo_wrapped() {
    init_logs();
    let mut net = Net::new(TransportOptions::default(), TransportOptions::default());
    net.pump();
    assert!(net.client.session_info().is_some());
    assert!(net.server.session_info().is_some());

    net.client.write(b"foo\n").unwrap();
    net.pump();
    let data = net.server_proto.take_received();
    assert_eq!(data, b"foo\n");
    net.server.write(&data).unwrap();
    net.pump();
    assert_eq!(net.client_proto.take_received(), b"foo\n");

    net.client.close();
    net.pump();
    assert!(net.client.error().is_none());
    assert!(net.server.error().is_none());
    assert!(net.client.carrier().closed.get());
    assert!(net.server.carrier().closed.get());
    assert!(matches!(net.client_proto.lost(), Some(None)));
    assert!(matches!(net.server_proto.lost(), Some(None)));
}

/// Scenario: echo over a real TCP connection, showing the transport is
/// carrier-agnostic
#[test]
fn echo_over_tcp() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_sock = TcpStream::connect(addr).unwrap();
    let (server_sock, _) = listener.accept().unwrap();
    let mut client_rd = client_sock.try_clone().unwrap();
    let mut server_rd = server_sock.try_clone().unwrap();
    client_rd
        .set_read_timeout(Some(Duration::from_millis(20)))
        .unwrap();
    server_rd
        .set_read_timeout(Some(Duration::from_millis(20)))
        .unwrap();

    let cproto = TestProtocol::default();
    let sproto = TestProtocol::default();
    let mut client = TlsTransport::new(
        TcpCarrier::new(client_sock),
        cproto.clone(),
        client_pipe(),
        TransportOptions::default(),
    );
    let mut server = TlsTransport::new(
        TcpCarrier::new(server_sock),
        sproto.clone(),
        server_pipe(),
        TransportOptions::default(),
    );

    // Queued behind the handshake still in flight
    client.write(b"foo\n").unwrap();

    let mut echoed = false;
    for _ in 0..200 {
        shuttle(&mut server_rd, &mut server);
        let data = sproto.take_received();
        if !data.is_empty() {
            server.write(&data).unwrap();
        }
        shuttle(&mut client_rd, &mut client);
        if cproto.received() == b"foo\n" {
            echoed = true;
            break;
        }
    }
    assert!(echoed);
    assert!(client.error().is_none());
    assert!(server.error().is_none());

    client.close();
    for _ in 0..200 {
        shuttle(&mut server_rd, &mut server);
        shuttle(&mut client_rd, &mut client);
        if client.carrier().is_closed() && server.carrier().is_closed() {
            break;
        }
    }
    assert!(client.carrier().is_closed());
    assert!(server.carrier().is_closed());
    assert!(matches!(cproto.lost(), Some(None)));
    assert!(matches!(sproto.lost(), Some(None)));
}

/// Scenario: client-initiated unwrap.  The server sees the data and the
/// plaintext EOF but both transports stay open, and the connection
/// continues in cleartext.
#[test]
fn client_initiated_unwrap() {
    let copts = TransportOptions {
        do_handshake_on_connect: false,
        close_on_unwrap: true,
    };
    let sopts = TransportOptions {
        do_handshake_on_connect: true,
        close_on_unwrap: false,
    };
    let mut net = Net::new(copts, sopts);
    let active = net.client.do_handshake().unwrap();
    net.pump();
    assert!(active.is_set());

    net.client.write(b"hello").unwrap();
    net.pump();
    assert_eq!(net.server_proto.take_received(), b"hello");

    net.client.unwrap().unwrap();
    // Buffered until the peer acknowledges the unwrap
    net.client.write(b"later").unwrap();
    net.pump();
    assert!(net.server_proto.received().is_empty());
    assert!(!net.server.is_closing());
    assert!(net.server.error().is_none());

    // The server application acknowledges; both sides drop to cleartext
    net.server.unwrap().unwrap();
    net.pump();
    assert!(!active.is_set());
    assert!(!net.client.is_closing());
    assert!(net.client.error().is_none());
    assert_eq!(net.server_proto.take_received(), b"later");

    net.client.write(b"plain").unwrap();
    net.pump();
    assert_eq!(net.server_proto.take_received(), b"plain");
}

/// Scenario: a write issued before the deferred handshake is held back
/// and only goes out encrypted once the handshake succeeds
#[test]
fn deferred_handshake() {
    let copts = TransportOptions {
        do_handshake_on_connect: false,
        close_on_unwrap: true,
    };
    let mut net = Net::new(copts, TransportOptions::default());
    net.client.write(b"data").unwrap();
    net.pump();
    assert!(net.server_proto.received().is_empty());
    assert_eq!(net.client.write_buffer_size(), 4);

    let active = net.client.do_handshake().unwrap();
    net.pump();
    assert!(active.is_set());
    assert_eq!(net.server_proto.take_received(), b"data");
    assert_eq!(net.client.write_buffer_size(), 0);
}

/// Scenario: short write under backpressure with a mock engine.  The
/// first `pause_writing` fires on the high-water mark, the application's
/// `pause_reading` is ignored while the engine waits for records, and
/// record arrival completes both writes and fires `resume_writing`.
#[test]
fn short_write_backpressure() {
    let state = MockState::default();
    state.write_needs_records.set(true);
    let carrier = TestCarrier::default();
    let proto = TestProtocol::default();
    let pipe = TlsPipe::new(MockConfig(state.clone()), Role::Client, None);
    let mut t = TlsTransport::new(
        carrier.clone(),
        proto.clone(),
        pipe,
        TransportOptions::default(),
    );
    t.set_write_buffer_limits(Some(8), None);

    let first = vec![b'A'; 8];
    t.write(&first).unwrap();
    assert_eq!(proto.pauses.get(), 1);
    assert_eq!(t.write_buffer_size(), 8);

    // Stalled on WANT_READ: the pause request must be ignored
    t.pause_reading();
    assert!(t.is_reading());
    assert!(!carrier.paused.get());

    let second = vec![b'B'; 8];
    t.write(&second).unwrap();
    assert_eq!(proto.pauses.get(), 1); // already paused, not again
    assert_eq!(t.write_buffer_size(), 16);

    // Record arrival unblocks the backlog
    t.on_read(ReadEvent::Data(b"tick"));
    assert_eq!(proto.take_received(), b"tick");
    let wrote = state.wrote.borrow();
    assert_eq!(&wrote[..8], &first[..]);
    assert_eq!(&wrote[8..], &second[..]);
    assert_eq!(t.write_buffer_size(), 0);
    assert_eq!(proto.resumes.get(), 1);
    assert!(t.is_reading());
}

/// Once the engine is idle again, pause_reading is honoured normally
#[test]
fn pause_reading_honoured_when_idle() {
    let state = MockState::default();
    let carrier = TestCarrier::default();
    let proto = TestProtocol::default();
    let pipe = TlsPipe::new(MockConfig(state), Role::Client, None);
    let mut t = TlsTransport::new(
        carrier.clone(),
        proto,
        pipe,
        TransportOptions::default(),
    );
    t.write(b"x").unwrap(); // completes, engine not waiting
    t.pause_reading();
    assert!(!t.is_reading());
    assert!(carrier.paused.get());
    t.resume_reading();
    assert!(t.is_reading());
    assert!(!carrier.paused.get());
}

/// Scenario: carrier EOF in mid-handshake surfaces UnexpectedEof via
/// connection_lost and sticks for every later call
#[test]
fn premature_eof_mid_handshake() {
    let mut net = Net::new(TransportOptions::default(), TransportOptions::default());
    // Handshake records never delivered; the carrier dies instead
    net.client.on_read(ReadEvent::Eof);
    assert!(matches!(net.client.error(), Some(Error::UnexpectedEof)));
    assert!(matches!(
        net.client_proto.lost(),
        Some(Some(Error::UnexpectedEof))
    ));
    assert!(net.client.carrier().closed.get());
    assert!(matches!(net.client.write(b"x"), Err(Error::UnexpectedEof)));
    assert!(matches!(net.client.do_handshake(), Err(Error::UnexpectedEof)));
    assert!(matches!(net.client.unwrap(), Err(Error::UnexpectedEof)));
}

/// A carrier-level error is sticky and aborts the transport
#[test]
fn carrier_error_is_sticky() {
    let mut net = Net::new(TransportOptions::default(), TransportOptions::default());
    net.pump();
    net.client
        .on_read(ReadEvent::Error(Error::Transport("connection reset".into())));
    assert!(matches!(net.client.error(), Some(Error::Transport(_))));
    assert!(matches!(
        net.client_proto.lost(),
        Some(Some(Error::Transport(_)))
    ));
    assert!(matches!(net.client.write(b"x"), Err(Error::Transport(_))));
}

/// After an unwrap, a clean carrier EOF consults the protocol: it can
/// keep the transport open, or let it close with ConnectionLost
#[test]
fn eof_after_unwrap() {
    let copts = TransportOptions {
        do_handshake_on_connect: true,
        close_on_unwrap: false,
    };
    let sopts = TransportOptions {
        do_handshake_on_connect: true,
        close_on_unwrap: false,
    };
    let mut net = Net::new(copts, sopts);
    net.pump();
    net.client.unwrap().unwrap();
    net.pump();
    net.server.unwrap().unwrap();
    net.pump();

    // Server protocol elects to continue on EOF
    net.server_proto.eof_continue.set(true);
    net.server.on_read(ReadEvent::Eof);
    assert!(net.server_proto.eof_seen.get());
    assert!(!net.server.is_closing());
    assert!(net.server_proto.lost().is_none());

    // Client protocol does not; the transport closes
    net.client.on_read(ReadEvent::Eof);
    assert!(net.client_proto.eof_seen.get());
    assert!(matches!(
        net.client_proto.lost(),
        Some(Some(Error::ConnectionLost))
    ));
}

/// Writes are refused while closing, and a TLS transport has no half
/// close
#[test]
fn write_after_close() {
    let mut net = Net::new(TransportOptions::default(), TransportOptions::default());
    net.pump();
    assert!(!net.client.can_write_eof());
    net.client.close();
    assert!(net.client.is_closing());
    assert!(matches!(net.client.write(b"x"), Err(Error::Transport(_))));
}

/// get_extra_info exposes the session under the "tlsinfo" key only
#[test]
fn extra_info() {
    let mut net = Net::new(TransportOptions::default(), TransportOptions::default());
    net.pump();
    assert!(net.client.get_extra_info("tlsinfo").is_some());
    assert!(net.client.get_extra_info("peername").is_none());
    let info = net.client.get_extra_info("tlsinfo").unwrap();
    assert!(info.cipher().is_some());
}

// ---------------------------------------------------------------------
// Test doubles

/// In-memory carrier collecting written bytes in a shared buffer
#[derive(Clone, Default)]
struct TestCarrier {
    out: Rc<RefCell<Vec<u8>>>,
    paused: Rc<Cell<bool>>,
    closed: Rc<Cell<bool>>,
}

impl Carrier for TestCarrier {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.closed.get() {
            return Err(Error::Transport("write on closed carrier".into()));
        }
        self.out.borrow_mut().extend_from_slice(data);
        Ok(())
    }

    fn pause_reading(&mut self) {
        self.paused.set(true);
    }

    fn resume_reading(&mut self) {
        self.paused.set(false);
    }

    fn close(&mut self) {
        self.closed.set(true);
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

/// Protocol double recording everything the transport reports
#[derive(Clone, Default)]
struct TestProtocol {
    received: Rc<RefCell<Vec<u8>>>,
    eof_seen: Rc<Cell<bool>>,
    eof_continue: Rc<Cell<bool>>,
    pauses: Rc<Cell<usize>>,
    resumes: Rc<Cell<usize>>,
    lost: Rc<RefCell<Option<Option<Error>>>>,
}

impl TestProtocol {
    fn received(&self) -> Vec<u8> {
        self.received.borrow().clone()
    }

    fn take_received(&self) -> Vec<u8> {
        std::mem::take(&mut *self.received.borrow_mut())
    }

    fn lost(&self) -> Option<Option<Error>> {
        self.lost.borrow().clone()
    }
}

impl Protocol for TestProtocol {
    fn data_received(&mut self, data: &[u8]) {
        self.received.borrow_mut().extend_from_slice(data);
    }

    fn eof_received(&mut self) -> bool {
        self.eof_seen.set(true);
        self.eof_continue.get()
    }

    fn pause_writing(&mut self) {
        self.pauses.set(self.pauses.get() + 1);
    }

    fn resume_writing(&mut self) {
        self.resumes.set(self.resumes.get() + 1);
    }

    fn connection_lost(&mut self, error: Option<&Error>) {
        *self.lost.borrow_mut() = Some(error.cloned());
    }
}

/// A client and server transport joined back to back in memory
struct Net {
    client: TlsTransport<TestCarrier, TestProtocol>,
    server: TlsTransport<TestCarrier, TestProtocol>,
    client_out: Rc<RefCell<Vec<u8>>>,
    server_out: Rc<RefCell<Vec<u8>>>,
    client_proto: TestProtocol,
    server_proto: TestProtocol,
}

impl Net {
    fn new(client_opts: TransportOptions, server_opts: TransportOptions) -> Self {
        let client_carrier = TestCarrier::default();
        let server_carrier = TestCarrier::default();
        let client_proto = TestProtocol::default();
        let server_proto = TestProtocol::default();
        let client = TlsTransport::new(
            client_carrier.clone(),
            client_proto.clone(),
            client_pipe(),
            client_opts,
        );
        let server = TlsTransport::new(
            server_carrier.clone(),
            server_proto.clone(),
            server_pipe(),
            server_opts,
        );
        Self {
            client,
            server,
            client_out: client_carrier.out,
            server_out: server_carrier.out,
            client_proto,
            server_proto,
        }
    }

    /// Shuttle carrier bytes between the two sides until quiescent
    fn pump(&mut self) {
        loop {
            let batch = std::mem::take(&mut *self.client_out.borrow_mut());
            if !batch.is_empty() {
                self.server.on_read(ReadEvent::Data(&batch));
                continue;
            }
            let batch = std::mem::take(&mut *self.server_out.borrow_mut());
            if !batch.is_empty() {
                self.client.on_read(ReadEvent::Data(&batch));
                continue;
            }
            break;
        }
    }
}

/// Carrier over a real TCP stream
struct TcpCarrier {
    stream: TcpStream,
    closed: bool,
}

impl TcpCarrier {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

impl Carrier for TcpCarrier {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.stream
            .write_all(data)
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Push everything currently readable from `sock` into the transport
fn shuttle(sock: &mut TcpStream, t: &mut TlsTransport<TcpCarrier, TestProtocol>) {
    let mut buf = [0u8; 16384];
    loop {
        match sock.read(&mut buf) {
            Ok(0) => {
                t.on_read(ReadEvent::Eof);
                break;
            }
            Ok(n) => t.on_read(ReadEvent::Data(&buf[..n])),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                t.on_read(ReadEvent::Eof);
                break;
            }
            Err(e) => panic!("socket error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------
// Mock engine

/// Behaviour knobs and observations shared with a running [`MockEngine`]
#[derive(Clone, Default)]
struct MockState {
    /// Refuse writes with WANT_READ until a record has actually been
    /// read; cleared by [`MockEngine::read`] when one arrives
    write_needs_records: Rc<Cell<bool>>,
    /// Plaintext the engine accepted, in order
    wrote: Rc<RefCell<Vec<u8>>>,
}

/// An engine that "encrypts" by passing bytes through unchanged, with
/// an instant handshake and scriptable write refusals
struct MockEngine {
    state: MockState,
}

impl TlsEngine for MockEngine {
    fn handshake(&mut self, _io: &mut RecordIo<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    fn shutdown(&mut self, _io: &mut RecordIo<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    fn read(&mut self, io: &mut RecordIo<'_>, max: usize) -> Result<Vec<u8>, EngineError> {
        let data = io.incoming.data();
        if data.is_empty() {
            return Err(EngineError::WantRead);
        }
        self.state.write_needs_records.set(false);
        let n = data.len().min(max);
        let out = data[..n].to_vec();
        io.incoming.consume(n);
        Ok(out)
    }

    fn write(&mut self, io: &mut RecordIo<'_>, plaintext: &[u8]) -> Result<usize, EngineError> {
        if self.state.write_needs_records.get() {
            return Err(EngineError::WantRead);
        }
        self.state.wrote.borrow_mut().extend_from_slice(plaintext);
        io.outgoing.append(plaintext);
        Ok(plaintext.len())
    }

    fn cipher(&self) -> Option<String> {
        Some("MOCK_NULL_WITH_NULL".into())
    }

    fn protocol_version(&self) -> Option<String> {
        None
    }

    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        None
    }

    fn exporter(
        &self,
        _label: &[u8],
        _context: Option<&[u8]>,
        _len: usize,
    ) -> Result<Vec<u8>, Error> {
        Err(Error::Tls("no keying material".into()))
    }
}

struct MockConfig(MockState);

impl EngineConfig for MockConfig {
    fn build(&self, _role: Role, _server_name: Option<&str>) -> Result<Box<dyn TlsEngine>, Error> {
        Ok(Box::new(MockEngine {
            state: self.0.clone(),
        }))
    }
}

fn client_pipe() -> TlsPipe {
    TlsPipe::new(common::client_config(), Role::Client, Some("example.com"))
}

fn server_pipe() -> TlsPipe {
    TlsPipe::new(common::server_config(), Role::Server, None)
}
