use crate::info::SessionInfo;
use crate::pipe::{State, TlsPipe};
use crate::Error;
use log::{debug, warn};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Default high-water mark for the write buffer
const DEFAULT_WRITE_BUFFER_HIGH: usize = 65536;

/// The downward byte-stream contract a [`TlsTransport`] writes records
/// to
///
/// Any reliable byte stream works: a TCP connection, a local pipe, an
/// in-memory queue in tests.  The carrier delivers received bytes back
/// by invoking [`TlsTransport::on_read`].
pub trait Carrier {
    /// Queue `data` for transmission
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Stop delivering read callbacks
    fn pause_reading(&mut self) {}

    /// Start delivering read callbacks again
    fn resume_reading(&mut self) {}

    /// Close the carrier
    fn close(&mut self);

    /// Whether the carrier has been closed
    fn is_closed(&self) -> bool;
}

/// The upward application contract a [`TlsTransport`] reports to
pub trait Protocol {
    /// Decrypted application data arrived
    fn data_received(&mut self, data: &[u8]);

    /// The stream ended cleanly.  Return `true` to keep the transport
    /// open (only honoured after an `unwrap`).
    fn eof_received(&mut self) -> bool {
        false
    }

    /// The write buffer crossed the high-water mark; stop producing
    fn pause_writing(&mut self) {}

    /// The write buffer drained below the low-water mark; produce again
    fn resume_writing(&mut self) {}

    /// The transport is gone.  `error` is `None` for a clean close.
    fn connection_lost(&mut self, error: Option<&Error>) {
        let _ = error;
    }
}

/// A carrier-level read callback event
pub enum ReadEvent<'a> {
    /// Bytes arrived from the peer
    Data(&'a [u8]),
    /// The peer closed its sending side
    Eof,
    /// The carrier failed
    Error(Error),
}

/// A one-shot flag that can be observed by the transport's owner
///
/// Set when a handshake completes and cleared again when an unwrap
/// completes.  Clones share the same flag.  The transport is driven by
/// a single event loop, so a plain shared cell is all the
/// synchronization needed.
#[derive(Debug, Clone, Default)]
pub struct Event {
    flag: Rc<Cell<bool>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.set(true);
    }

    pub fn clear(&self) {
        self.flag.set(false);
    }

    pub fn is_set(&self) -> bool {
        self.flag.get()
    }
}

/// Construction options for [`TlsTransport`]
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Start the TLS handshake as soon as the transport is created.
    /// When disabled the connection stays in cleartext until
    /// [`TlsTransport::do_handshake`] is called.
    pub do_handshake_on_connect: bool,
    /// Close the transport when the peer's `close_notify` arrives.
    /// Disabled automatically by [`TlsTransport::unwrap`].
    pub close_on_unwrap: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            do_handshake_on_connect: true,
            close_on_unwrap: true,
        }
    }
}

enum Pending {
    Write { buf: Vec<u8>, offset: usize },
    Handshake,
    Unwrap,
}

/// An SSL/TLS transport over an arbitrary carrier
///
/// Application writes are encrypted through the owned [`TlsPipe`] and
/// forwarded to the carrier; carrier reads are decrypted and delivered
/// to the [`Protocol`].  Outbound work (writes, handshake, unwrap) goes
/// through a FIFO backlog so that, for example, a write issued before
/// [`do_handshake`](TlsTransport::do_handshake) completes is held back
/// and encrypted once the session is up.
///
/// The first error seen anywhere is kept and returned from every later
/// call.
pub struct TlsTransport<C: Carrier, P: Protocol> {
    carrier: C,
    protocol: P,
    pipe: TlsPipe,
    backlog: VecDeque<Pending>,
    handshake_done: Event,
    /// True while the handshake is deferred and has not been requested
    /// yet; application writes are held back rather than sent in
    /// cleartext
    awaiting_handshake: bool,
    close_on_unwrap: bool,
    error: Option<Error>,
    closing: bool,
    closed: bool,
    reading: bool,
    writing: bool,
    write_buffer_size: usize,
    write_buffer_high: usize,
    write_buffer_low: usize,
}

impl<C: Carrier, P: Protocol> TlsTransport<C, P> {
    /// Wrap `carrier` with the security layer in `pipe` and start
    /// reporting to `protocol`
    pub fn new(carrier: C, protocol: P, pipe: TlsPipe, options: TransportOptions) -> Self {
        let mut this = Self {
            carrier,
            protocol,
            pipe,
            backlog: VecDeque::new(),
            handshake_done: Event::new(),
            awaiting_handshake: !options.do_handshake_on_connect,
            close_on_unwrap: options.close_on_unwrap,
            error: None,
            closing: false,
            closed: false,
            reading: true,
            writing: true,
            write_buffer_size: 0,
            write_buffer_high: DEFAULT_WRITE_BUFFER_HIGH,
            write_buffer_low: DEFAULT_WRITE_BUFFER_HIGH / 2,
        };
        if options.do_handshake_on_connect {
            let _ = this.do_handshake();
        }
        this
    }

    /// The sticky error, if one occurred
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether the transport is closing or closed
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Whether carrier reads are currently enabled
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// Bytes queued in the write backlog
    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    /// Set the high and low water marks for write flow control.  `low`
    /// defaults to half of `high`.
    pub fn set_write_buffer_limits(&mut self, high: Option<usize>, low: Option<usize>) {
        let high = high.unwrap_or(DEFAULT_WRITE_BUFFER_HIGH);
        let low = low.unwrap_or(high / 2).min(high);
        self.write_buffer_high = high;
        self.write_buffer_low = low;
    }

    /// Access the application protocol
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Access the carrier
    pub fn carrier(&self) -> &C {
        &self.carrier
    }

    /// A read-only view of the negotiated TLS session, once established
    pub fn session_info(&self) -> Option<SessionInfo<'_>> {
        self.pipe.session_info()
    }

    /// Transport-specific data by name.  The only key this layer adds is
    /// `"tlsinfo"`, which resolves to
    /// [`session_info`](TlsTransport::session_info).
    pub fn get_extra_info(&self, name: &str) -> Option<SessionInfo<'_>> {
        match name {
            "tlsinfo" => self.session_info(),
            _ => None,
        }
    }

    /// TLS does not support a half close
    pub fn can_write_eof(&self) -> bool {
        false
    }

    /// Write application data
    ///
    /// The data is queued, encrypted in order behind any pending
    /// handshake or earlier writes, and forwarded to the carrier.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.closing || self.carrier.is_closed() {
            return Err(Error::Transport("transport is closing/closed".into()));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.backlog.push_back(Pending::Write {
            buf: data.to_vec(),
            offset: 0,
        });
        self.write_buffer_size += data.len();
        if self.write_buffer_size >= self.write_buffer_high && self.writing {
            self.writing = false;
            self.protocol.pause_writing();
        }
        self.process_backlog();
        Ok(())
    }

    /// Start the TLS handshake
    ///
    /// Only needed when the transport was created with
    /// `do_handshake_on_connect` disabled.  The handshake has to be
    /// synchronized between the endpoints so that record data is not
    /// taken for cleartext; usually it is started directly after the
    /// connection is established, or at a point agreed by the
    /// application protocol.
    ///
    /// Returns an [`Event`] that becomes set when the handshake
    /// completes.
    pub fn do_handshake(&mut self) -> Result<Event, Error> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.closing || self.carrier.is_closed() {
            return Err(Error::Transport("transport is closing/closed".into()));
        }
        self.awaiting_handshake = false;
        // Ahead of any writes that were held back waiting for it, so
        // they get encrypted rather than sent in cleartext
        self.backlog.push_front(Pending::Handshake);
        self.write_buffer_size += 1;
        self.process_backlog();
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.handshake_done.clone()),
        }
    }

    /// Remove the security layer
    ///
    /// Use this only to continue in cleartext after the TLS session is
    /// taken down; in all other cases use
    /// [`close`](TlsTransport::close).  If the unwrap is initiated here,
    /// data written after it is buffered until the peer's answering
    /// `close_notify` arrives.  If the peer initiated the unwrap, this
    /// call acknowledges it; an application-level protocol is needed to
    /// know when, because the receipt of a `close_notify` is not itself
    /// reported as data.
    pub fn unwrap(&mut self) -> Result<(), Error> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.closing || self.carrier.is_closed() {
            return Err(Error::Transport("transport is closing/closed".into()));
        }
        self.close_on_unwrap = false;
        self.backlog.push_back(Pending::Unwrap);
        self.write_buffer_size += 1;
        self.process_backlog();
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Cleanly shut down the TLS session and then close the carrier
    pub fn close(&mut self) {
        if self.closing || self.closed {
            return;
        }
        self.closing = true;
        match self.pipe.state() {
            State::Wrapped => {
                self.backlog.push_back(Pending::Unwrap);
                self.write_buffer_size += 1;
                self.process_backlog();
            }
            // An unwrap is already in flight; the carrier closes when
            // the peer's close_notify completes it
            State::ShuttingDown => self.process_backlog(),
            _ => self.teardown(),
        }
    }

    /// Close the carrier immediately, discarding queued writes
    pub fn abort(&mut self) {
        self.closing = true;
        self.backlog.clear();
        self.write_buffer_size = 0;
        self.teardown();
    }

    /// Stop reading data
    ///
    /// For a TLS transport this request may be ignored: while the
    /// engine is waiting for record data (a handshake or a stalled
    /// write), pausing reads would deadlock the session.  Reading can
    /// also be resumed without warning at any later point for the same
    /// reason, so applications should rely on protocol-level buffering
    /// rather than on this call being honoured.
    pub fn pause_reading(&mut self) {
        if self.pipe.wants_records() {
            return;
        }
        if !self.reading {
            return;
        }
        self.reading = false;
        self.carrier.pause_reading();
    }

    /// Start reading data again
    pub fn resume_reading(&mut self) {
        if self.reading {
            return;
        }
        self.reading = true;
        self.carrier.resume_reading();
    }

    /// Carrier read callback
    ///
    /// The carrier invokes this for received data, end-of-file, and
    /// carrier-level failures.
    pub fn on_read(&mut self, event: ReadEvent<'_>) {
        if let Some(err) = &self.error {
            warn!("ignoring read event after error: {err}");
            return;
        }
        if self.closed {
            debug!("ignoring read event after close");
            return;
        }
        match event {
            ReadEvent::Eof => match self.pipe.feed_eof() {
                Ok(()) => {
                    if !self.close_on_unwrap && self.protocol.eof_received() {
                        debug!("EOF received, protocol wants to continue");
                    } else if !self.closing {
                        debug!("EOF received, closing transport");
                        self.error = Some(Error::ConnectionLost);
                        self.teardown();
                    }
                }
                Err(e) => {
                    warn!("TLS error on carrier EOF: {e}");
                    self.error = Some(e);
                    self.abort();
                }
            },
            ReadEvent::Error(e) => {
                warn!("carrier error in read callback: {e}");
                self.error = Some(e);
                self.abort();
            }
            ReadEvent::Data(data) => match self.pipe.feed_records(data) {
                Ok((records, plaintext)) => {
                    if let Err(e) = self.send_records(&records) {
                        warn!("carrier error while forwarding records: {e}");
                        self.error = Some(e);
                        self.abort();
                        return;
                    }
                    for chunk in plaintext {
                        if !chunk.is_empty() {
                            if !self.closing {
                                self.protocol.data_received(&chunk);
                            }
                        } else if self.close_on_unwrap {
                            // Peer close_notify: acknowledge with our
                            // own and close.
                            self.close();
                        }
                    }
                }
                Err(e) => {
                    warn!("TLS error in read callback: {e}");
                    self.error = Some(e);
                    self.abort();
                }
            },
        }
        if self.error.is_none() && !self.closed {
            // The arriving records may have unblocked a stalled write
            self.process_backlog();
        }
    }

    /// Try to make progress on the write backlog
    fn process_backlog(&mut self) {
        match self.try_process_backlog() {
            Ok(()) => self.maybe_finish_close(),
            Err(e) => {
                warn!("TLS error while processing the write backlog: {e}");
                self.error = Some(e);
                self.abort();
            }
        }
    }

    fn try_process_backlog(&mut self) -> Result<(), Error> {
        loop {
            let Some(head) = self.backlog.front_mut() else {
                break;
            };
            if self.awaiting_handshake
                && !self.pipe.is_secured()
                && matches!(head, Pending::Write { .. })
            {
                // The handshake is deferred and not yet requested, so
                // this write stays queued instead of going out in
                // cleartext
                break;
            }
            let (records, consumed) = match head {
                Pending::Write { buf, offset } => {
                    let (records, new_offset) = self.pipe.feed_plaintext(buf, *offset)?;
                    if new_offset >= buf.len() {
                        (records, Some(buf.len()))
                    } else {
                        *offset = new_offset;
                        (records, None)
                    }
                }
                Pending::Handshake => {
                    let done = self.handshake_done.clone();
                    let records = self
                        .pipe
                        .start_handshake(Some(Box::new(move || done.set())))?;
                    (records, Some(1))
                }
                Pending::Unwrap => {
                    let done = self.handshake_done.clone();
                    let records = self
                        .pipe
                        .start_shutdown(Some(Box::new(move || done.clear())))?;
                    (records, Some(1))
                }
            };
            self.send_records(&records)?;
            match consumed {
                Some(n) => {
                    self.backlog.pop_front();
                    self.write_buffer_size -= n;
                }
                None => {
                    // A short write means the write is blocked on a
                    // read; reading must be enabled for it to ever
                    // complete, whatever the application asked for.
                    if !self.reading {
                        self.reading = true;
                        self.carrier.resume_reading();
                    }
                    break;
                }
            }
        }
        if !self.writing && self.write_buffer_size <= self.write_buffer_low {
            self.writing = true;
            self.protocol.resume_writing();
        }
        Ok(())
    }

    /// Forward record data to the carrier.  This deliberately bypasses
    /// [`write`](TlsTransport::write) and its closing check: shutdown
    /// records still have to go out after `closing` flips.
    fn send_records(&mut self, records: &[u8]) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }
        self.carrier.write(records)
    }

    /// Close the carrier once an initiated shutdown has fully completed
    fn maybe_finish_close(&mut self) {
        if self.closing && !self.closed && self.backlog.is_empty() && !self.pipe.is_secured() {
            self.teardown();
        }
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.closing = true;
        self.pipe.close();
        self.carrier.close();
        let err = self.error.clone();
        self.protocol.connection_lost(err.as_ref());
    }
}
