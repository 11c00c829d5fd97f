use crate::engine::{EngineConfig, EngineError, RecordIo, TlsEngine};
use crate::info::SessionInfo;
use crate::{Error, Role};
use pipebuf::PipeBuf;

/// Where the pipe is in the TLS session lifecycle
///
/// States advance in one direction only: `Unwrapped` to `Handshaking` to
/// `Wrapped` to `ShuttingDown` and back to `Unwrapped` once the shutdown
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unwrapped,
    Handshaking,
    Wrapped,
    ShuttingDown,
}

/// Plaintext read size per engine call
const BUFSIZE: usize = 65536;

/// A TLS "pipe": a security layer driven through memory buffers
///
/// The pipe lets you run an SSL/TLS session over a connection you only
/// have byte-level access to.  Ciphertext records received from the
/// carrier go in through [`feed_records`](TlsPipe::feed_records), which
/// hands back decrypted plaintext plus any records the session needs
/// sent.  Application plaintext goes in through
/// [`feed_plaintext`](TlsPipe::feed_plaintext), which hands back the
/// encrypted records to put on the wire.  No I/O happens here.
///
/// A pipe starts out unwrapped: data passes through unchanged.  Call
/// [`start_handshake`](TlsPipe::start_handshake) to begin TLS, and
/// [`start_shutdown`](TlsPipe::start_shutdown) to take the security
/// layer down again with a clean `close_notify` exchange.
pub struct TlsPipe {
    config: Box<dyn EngineConfig>,
    role: Role,
    server_name: Option<String>,
    state: State,
    engine: Option<Box<dyn TlsEngine>>,
    incoming: PipeBuf,
    outgoing: PipeBuf,
    need_records: bool,
    peer_closed: bool,
    closed: bool,
    on_transition: Option<Box<dyn FnOnce()>>,
}

impl TlsPipe {
    /// Create an unwrapped pipe.  The engine is built from `config` when
    /// the handshake starts.  `server_name` is the SNI name to present
    /// and is only meaningful for [`Role::Client`].
    pub fn new(config: impl EngineConfig + 'static, role: Role, server_name: Option<&str>) -> Self {
        Self {
            config: Box::new(config),
            role,
            server_name: server_name.map(str::to_owned),
            state: State::Unwrapped,
            engine: None,
            incoming: PipeBuf::new(),
            outgoing: PipeBuf::new(),
            need_records: false,
            peer_closed: false,
            closed: false,
            on_transition: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.state
    }

    /// Which end of the session this pipe plays
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether a security layer is active in any form (handshaking,
    /// established, or shutting down)
    pub fn is_secured(&self) -> bool {
        !self.closed && self.state != State::Unwrapped
    }

    /// Whether the session is established and carrying application data
    pub fn is_wrapped(&self) -> bool {
        !self.closed && self.state == State::Wrapped
    }

    /// Whether [`close`](TlsPipe::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True while the engine's last signal was a request for more
    /// incoming records and none have arrived since
    ///
    /// While this holds, a stalled write can only complete once the
    /// carrier delivers more data, so carrier reads must stay enabled.
    pub fn wants_records(&self) -> bool {
        self.need_records
    }

    /// A read-only view of the negotiated session, available once the
    /// handshake has completed
    pub fn session_info(&self) -> Option<SessionInfo<'_>> {
        if !matches!(self.state, State::Wrapped | State::ShuttingDown) {
            return None;
        }
        self.engine.as_deref().map(SessionInfo::new)
    }

    /// Start the TLS handshake.  Returns the initial records to send.
    ///
    /// `on_complete` is invoked once, from inside whichever call finally
    /// completes the handshake.
    pub fn start_handshake(
        &mut self,
        on_complete: Option<Box<dyn FnOnce()>>,
    ) -> Result<Vec<u8>, Error> {
        if self.closed {
            return Err(Error::PipeClosed);
        }
        if self.state != State::Unwrapped || self.engine.is_some() {
            return Err(Error::AlreadyWrapped);
        }
        self.engine = Some(self.config.build(self.role, self.server_name.as_deref())?);
        self.state = State::Handshaking;
        self.on_transition = on_complete;
        let mut plaintext = Vec::new();
        self.drive(&mut plaintext)?;
        debug_assert!(plaintext.iter().all(|c| c.is_empty()));
        Ok(self.drain_outgoing())
    }

    /// Start the TLS shutdown sequence.  Returns the records carrying
    /// our `close_notify`.
    ///
    /// `on_complete` is invoked once the shutdown finishes, which needs
    /// the peer's `close_notify` to have arrived through
    /// [`feed_records`](TlsPipe::feed_records).
    pub fn start_shutdown(
        &mut self,
        on_complete: Option<Box<dyn FnOnce()>>,
    ) -> Result<Vec<u8>, Error> {
        if self.closed {
            return Err(Error::PipeClosed);
        }
        if self.state != State::Wrapped {
            return Err(Error::NotWrapped);
        }
        self.state = State::ShuttingDown;
        self.on_transition = on_complete;
        let mut plaintext = Vec::new();
        self.drive(&mut plaintext)?;
        Ok(self.drain_outgoing())
    }

    /// Feed record-level data received from the carrier
    ///
    /// Returns `(records, plaintext)`: records that must be sent back to
    /// the peer (handshake and renegotiation flights) and the decrypted
    /// plaintext chunks.  An empty plaintext chunk means the peer sent
    /// `close_notify`; the owner is expected to acknowledge it by
    /// calling [`start_shutdown`](TlsPipe::start_shutdown).
    ///
    /// Before the handshake the data passes through unchanged.  Feeding
    /// an empty slice is fine and just ticks the engine.
    pub fn feed_records(&mut self, data: &[u8]) -> Result<(Vec<u8>, Vec<Vec<u8>>), Error> {
        if self.closed {
            return Err(Error::PipeClosed);
        }
        if self.state == State::Unwrapped {
            let plaintext = if data.is_empty() {
                Vec::new()
            } else {
                vec![data.to_vec()]
            };
            return Ok((Vec::new(), plaintext));
        }
        self.incoming.wr().append(data);
        let mut plaintext = Vec::new();
        self.drive(&mut plaintext)?;
        Ok((self.drain_outgoing(), plaintext))
    }

    /// Encrypt application plaintext starting at `offset` into `data`
    ///
    /// Returns `(records, new_offset)`.  `new_offset` reaches
    /// `data.len()` on a full write; anything less means the engine
    /// signalled that it needs record traffic first, and
    /// [`wants_records`](TlsPipe::wants_records) tells which direction.
    ///
    /// On a short write the retry MUST pass the same buffer: engines in
    /// the OpenSSL tradition require byte identity across retries, and
    /// a short write typically restarts from offset 0 because partial
    /// writes inside a record are not enabled.  Keep ownership of the
    /// buffer until the write fully completes.
    pub fn feed_plaintext(&mut self, data: &[u8], mut offset: usize) -> Result<(Vec<u8>, usize), Error> {
        if self.closed {
            return Err(Error::PipeClosed);
        }
        if self.state == State::Unwrapped {
            return Ok((data[offset..].to_vec(), data.len()));
        }
        self.need_records = false;
        let Some(mut engine) = self.engine.take() else {
            return Err(Error::NotWrapped);
        };
        let mut fatal = None;
        while offset < data.len() {
            let mut io = RecordIo {
                incoming: self.incoming.rd(),
                outgoing: self.outgoing.wr(),
            };
            match engine.write(&mut io, &data[offset..]) {
                Ok(n) => offset += n,
                Err(EngineError::WantRead) => {
                    self.need_records = true;
                    break;
                }
                Err(EngineError::WantWrite) => break,
                Err(EngineError::Fatal(e)) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        self.engine = Some(engine);
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok((self.drain_outgoing(), offset))
    }

    /// Signal that the carrier reached end-of-file
    ///
    /// The pipe is closed in all cases.  Returns `UnexpectedEof` when
    /// the session was still live, i.e. the EOF was "ragged" and arrived
    /// before the `close_notify` exchange.
    pub fn feed_eof(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::PipeClosed);
        }
        self.incoming.wr().close();
        let driven = if self.state == State::Unwrapped {
            Ok(())
        } else {
            let mut plaintext = Vec::new();
            self.drive(&mut plaintext)
        };
        let clean = self.state == State::Unwrapped || self.peer_closed;
        self.close();
        driven?;
        if clean {
            Ok(())
        } else {
            Err(Error::UnexpectedEof)
        }
    }

    /// Close the pipe, dropping the engine and both record buffers.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.engine = None;
        self.state = State::Unwrapped;
        self.need_records = false;
        self.on_transition = None;
        self.incoming = PipeBuf::new();
        self.outgoing = PipeBuf::new();
    }

    /// One pass over the engine state machine.  WANT_READ/WANT_WRITE are
    /// absorbed here; only fatal TLS failures come back as errors.
    fn drive(&mut self, plaintext: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        self.need_records = false;
        let Some(mut engine) = self.engine.take() else {
            return Ok(());
        };
        let result = self.drive_engine(engine.as_mut(), plaintext);
        if self.state != State::Unwrapped {
            self.engine = Some(engine);
        }
        match result {
            Ok(()) => Ok(()),
            Err(EngineError::WantRead) => {
                self.need_records = true;
                Ok(())
            }
            Err(EngineError::WantWrite) => Ok(()),
            Err(EngineError::Fatal(e)) => Err(e),
        }
    }

    fn drive_engine(
        &mut self,
        engine: &mut dyn TlsEngine,
        plaintext: &mut Vec<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let mut io = RecordIo {
            incoming: self.incoming.rd(),
            outgoing: self.outgoing.wr(),
        };
        if self.state == State::Handshaking {
            engine.handshake(&mut io)?;
            self.state = State::Wrapped;
            if let Some(cb) = self.on_transition.take() {
                cb();
            }
        }
        if self.state == State::Wrapped {
            // Main state: read plaintext until the engine runs dry or
            // reports the peer's close_notify with an empty chunk.
            loop {
                let chunk = engine.read(&mut io, BUFSIZE)?;
                let eof = chunk.is_empty();
                if eof {
                    self.peer_closed = true;
                }
                plaintext.push(chunk);
                if eof {
                    break;
                }
            }
        }
        if self.state == State::ShuttingDown {
            engine.shutdown(&mut io)?;
            self.state = State::Unwrapped;
            if let Some(cb) = self.on_transition.take() {
                cb();
            }
        }
        Ok(())
    }

    fn drain_outgoing(&mut self) -> Vec<u8> {
        let mut rd = self.outgoing.rd();
        let records = rd.data().to_vec();
        rd.consume(records.len());
        records
    }
}
