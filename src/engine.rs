use crate::{Error, Role};
use pipebuf::{PBufRd, PBufWr};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

/// The two record-level buffers an engine works against
///
/// `incoming` holds ciphertext received from the carrier and not yet
/// consumed by the engine.  `outgoing` collects ciphertext the engine
/// produced and the owner must forward to the carrier.  Both ends
/// implement `std::io::Read`/`Write`, which is exactly the shape the
/// Rustls `read_tls`/`write_tls` calls want.
pub struct RecordIo<'a> {
    pub incoming: PBufRd<'a>,
    pub outgoing: PBufWr<'a>,
}

/// Non-fatal and fatal outcomes of an engine call
///
/// `WantRead` and `WantWrite` are flow signals, not failures: the engine
/// needs more incoming records, or needs the outgoing buffer drained,
/// before the call can make progress.  They are absorbed by the pipe's
/// drive loop and never reach the application.
#[derive(Debug)]
pub enum EngineError {
    WantRead,
    WantWrite,
    Fatal(Error),
}

impl From<rustls::Error> for EngineError {
    fn from(e: rustls::Error) -> Self {
        EngineError::Fatal(Error::Tls(e.to_string()))
    }
}

/// A TLS state machine driven through memory buffers
///
/// Implementations consume record data from `io.incoming`, produce
/// record data into `io.outgoing`, and move plaintext through `read` and
/// `write`.  All four driving calls may return
/// [`EngineError::WantRead`]/[`WantWrite`](EngineError::WantWrite)
/// instead of progress.
///
/// The introspection methods back [`SessionInfo`](crate::SessionInfo)
/// and may return `None` until the handshake has completed, or always,
/// when the underlying library does not expose the value.
pub trait TlsEngine {
    /// Advance the handshake.  `Ok(())` means the session is
    /// established.
    fn handshake(&mut self, io: &mut RecordIo<'_>) -> Result<(), EngineError>;

    /// Advance an orderly shutdown.  `Ok(())` means our `close_notify`
    /// was emitted and the peer's was received.
    fn shutdown(&mut self, io: &mut RecordIo<'_>) -> Result<(), EngineError>;

    /// Decrypt up to `max` bytes of plaintext.  An empty return value
    /// means the peer sent `close_notify`.
    fn read(&mut self, io: &mut RecordIo<'_>, max: usize) -> Result<Vec<u8>, EngineError>;

    /// Encrypt a prefix of `plaintext`, returning how many bytes were
    /// accepted.
    fn write(&mut self, io: &mut RecordIo<'_>, plaintext: &[u8]) -> Result<usize, EngineError>;

    /// Name of the negotiated cipher suite
    fn cipher(&self) -> Option<String>;

    /// Negotiated protocol version, e.g. `TLSv1.3`
    fn protocol_version(&self) -> Option<String>;

    /// Negotiated compression algorithm, if the library supports any
    fn compression(&self) -> Option<String> {
        None
    }

    /// The peer's certificate chain in DER form, end-entity first
    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>>;

    /// The `tls-unique` channel binding, where the library exposes it
    fn tls_unique(&self) -> Option<Vec<u8>> {
        None
    }

    /// RFC 5705 keying material export
    fn exporter(&self, label: &[u8], context: Option<&[u8]>, len: usize)
        -> Result<Vec<u8>, Error>;
}

/// Factory for engines, deferred until the handshake actually starts
///
/// A [`TlsPipe`](crate::TlsPipe) is created unwrapped and only
/// instantiates its engine when `start_handshake` is called, so it holds
/// one of these instead of an engine.  Implemented for
/// `Arc<rustls::ClientConfig>` and `Arc<rustls::ServerConfig>`.
pub trait EngineConfig {
    fn build(&self, role: Role, server_name: Option<&str>) -> Result<Box<dyn TlsEngine>, Error>;
}

impl EngineConfig for Arc<ClientConfig> {
    fn build(&self, role: Role, server_name: Option<&str>) -> Result<Box<dyn TlsEngine>, Error> {
        if role != Role::Client {
            return Err(Error::Config(
                "client configuration cannot wrap a server-side pipe".into(),
            ));
        }
        let name = server_name
            .ok_or_else(|| Error::Config("client pipe requires a server name".into()))?;
        let name = ServerName::try_from(name.to_owned())
            .map_err(|e| Error::Config(format!("invalid server name: {e}")))?;
        let conn = ClientConnection::new(self.clone(), name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Box::new(RustlsEngine::new(Connection::Client(conn))))
    }
}

impl EngineConfig for Arc<ServerConfig> {
    fn build(&self, role: Role, _server_name: Option<&str>) -> Result<Box<dyn TlsEngine>, Error> {
        if role != Role::Server {
            return Err(Error::Config(
                "server configuration cannot wrap a client-side pipe".into(),
            ));
        }
        let conn =
            ServerConnection::new(self.clone()).map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Box::new(RustlsEngine::new(Connection::Server(conn))))
    }
}

/// [`TlsEngine`] backed by a Rustls [`Connection`]
///
/// Record movement follows the buffered Rustls calling convention:
/// `read_tls` plus `process_new_packets` to consume the incoming buffer,
/// `write_tls` to fill the outgoing one.  `read_tls` treats a zero-length
/// read as end-of-stream, so it is only invoked while the incoming
/// buffer is non-empty.
pub struct RustlsEngine {
    conn: Connection,
    sent_close_notify: bool,
    peer_closed: bool,
}

impl RustlsEngine {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            sent_close_notify: false,
            peer_closed: false,
        }
    }

    /// Access the wrapped connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Move as much record data as possible between the buffers and the
    /// connection, in both directions
    fn pump(&mut self, io: &mut RecordIo<'_>) -> Result<(), EngineError> {
        while self.conn.wants_read() && !io.incoming.is_empty() {
            self.conn
                .read_tls(&mut io.incoming)
                .map_err(|e| EngineError::Fatal(Error::Tls(e.to_string())))?;
            let state = self.conn.process_new_packets()?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
        while self.conn.wants_write() && !io.outgoing.is_eof() {
            self.conn
                .write_tls(&mut io.outgoing)
                .map_err(|e| EngineError::Fatal(Error::Tls(e.to_string())))?;
        }
        Ok(())
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake(&mut self, io: &mut RecordIo<'_>) -> Result<(), EngineError> {
        self.pump(io)?;
        if self.conn.is_handshaking() {
            // Outgoing flight is already drained, so the only thing that
            // can unblock us is more records from the peer.
            return Err(EngineError::WantRead);
        }
        Ok(())
    }

    fn shutdown(&mut self, io: &mut RecordIo<'_>) -> Result<(), EngineError> {
        if !self.sent_close_notify {
            self.conn.send_close_notify();
            self.sent_close_notify = true;
        }
        self.pump(io)?;
        if !self.peer_closed || self.conn.wants_write() {
            return Err(EngineError::WantRead);
        }
        Ok(())
    }

    fn read(&mut self, io: &mut RecordIo<'_>, max: usize) -> Result<Vec<u8>, EngineError> {
        self.pump(io)?;
        let mut buf = vec![0u8; max];
        match self.conn.reader().read(&mut buf) {
            Ok(0) => Ok(Vec::new()), // peer close_notify
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(EngineError::WantRead),
            Err(e) => Err(EngineError::Fatal(Error::Tls(e.to_string()))),
        }
    }

    fn write(&mut self, io: &mut RecordIo<'_>, plaintext: &[u8]) -> Result<usize, EngineError> {
        self.pump(io)?;
        if self.conn.is_handshaking() {
            // Plaintext cannot travel until the handshake is done, and
            // completing it needs records from the peer.
            return Err(EngineError::WantRead);
        }
        if self.sent_close_notify {
            // Rustls refuses writes once our close_notify went out.
            // Surface that as a short write blocked on the peer's
            // acknowledgement rather than an error.
            return Err(EngineError::WantRead);
        }
        let n = self
            .conn
            .writer()
            .write(plaintext)
            .map_err(|e| EngineError::Fatal(Error::Tls(e.to_string())))?;
        self.pump(io)?;
        if n == 0 {
            return Err(EngineError::WantWrite);
        }
        Ok(n)
    }

    fn cipher(&self) -> Option<String> {
        self.conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
    }

    fn protocol_version(&self) -> Option<String> {
        self.conn.protocol_version().map(|v| {
            match v {
                rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_owned(),
                rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_owned(),
                other => format!("{other:?}"),
            }
        })
    }

    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        self.conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
    }

    fn exporter(
        &self,
        label: &[u8],
        context: Option<&[u8]>,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        self.conn
            .export_keying_material(vec![0u8; len], label, context)
            .map_err(|e| Error::Tls(e.to_string()))
    }
}
