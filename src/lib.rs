//! In-memory TLS pipe and flow-controlled transport adapter on top of
//! [**Rustls**]
//!
//! The crate is split in two layers.  [`TlsPipe`] drives a TLS session
//! entirely through memory buffers: record-level data goes in and out on
//! one side, application plaintext on the other, and handshake and
//! shutdown are sequenced in between.  It performs no I/O of its own, so
//! it can secure any reliable byte stream you already have, whatever
//! event loop or carrier it lives on.
//!
//! [`TlsTransport`] plugs a [`TlsPipe`] into a callback-driven transport
//! contract: it queues application writes in a backlog, forwards record
//! data to a [`Carrier`], delivers decrypted data to a [`Protocol`], and
//! keeps the usual pause/resume flow-control working across the
//! encryption boundary.  The one wrinkle worth knowing up front: TLS
//! writes can block on TLS reads (handshakes and renegotiation), so this
//! transport may ignore `pause_reading` while the engine is waiting for
//! records.  See [`TlsTransport::pause_reading`].
//!
//! The TLS state machine itself is abstracted behind the [`TlsEngine`]
//! trait; [`RustlsEngine`] is the provided implementation.  Rustls is
//! re-exported as `tlspipe::rustls`.
//!
//! [**Rustls**]: https://crates.io/crates/rustls

pub use rustls;

mod config;
mod engine;
mod info;
mod pipe;
mod transport;

pub use config::{TlsOptions, TlsVersion, VerifyMode};
pub use engine::{EngineConfig, EngineError, RecordIo, RustlsEngine, TlsEngine};
pub use info::SessionInfo;
pub use pipe::{State, TlsPipe};
pub use transport::{Carrier, Event, Protocol, ReadEvent, TlsTransport, TransportOptions};

/// Which end of the TLS session this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Error in TLS pipe or transport processing
///
/// The transport keeps the first error it sees and returns the same value
/// from every later call, so the type is `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Operation attempted after the pipe was closed
    #[error("pipe was closed")]
    PipeClosed,

    /// Handshake requested while one is in progress or completed
    #[error("handshake in progress or completed")]
    AlreadyWrapped,

    /// Shutdown requested while no security layer is present
    #[error("no security layer present")]
    NotWrapped,

    /// The carrier reached end-of-file before the TLS session was shut
    /// down with a `close_notify`
    #[error("unexpected EOF during TLS session")]
    UnexpectedEof,

    /// Unsupported channel binding kind
    #[error("unknown channel binding: {0}")]
    UnknownChannelBinding(String),

    /// Fatal TLS failure reported by the engine, with the engine's
    /// reason text
    #[error("TLS error: {0}")]
    Tls(String),

    /// Error propagated from the carrier transport
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection went away under us
    #[error("connection lost")]
    ConnectionLost,

    /// Invalid TLS configuration
    #[error("configuration error: {0}")]
    Config(String),
}
