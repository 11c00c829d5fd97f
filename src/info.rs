use crate::engine::TlsEngine;
use crate::Error;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// A read-only view of an established TLS session
///
/// Obtained from [`TlsPipe::session_info`](crate::TlsPipe::session_info)
/// or `TlsTransport::get_extra_info("tlsinfo")`.  Borrows the live
/// engine, so it cannot outlive the pipe that produced it.
pub struct SessionInfo<'a> {
    engine: &'a dyn TlsEngine,
}

impl<'a> SessionInfo<'a> {
    pub(crate) fn new(engine: &'a dyn TlsEngine) -> Self {
        Self { engine }
    }

    /// The negotiated cipher suite
    pub fn cipher(&self) -> Option<String> {
        self.engine.cipher()
    }

    /// The negotiated protocol version
    pub fn protocol_version(&self) -> Option<String> {
        self.engine.protocol_version()
    }

    /// The negotiated compression algorithm.  `None` when the engine
    /// does not compress, which is the norm for modern TLS.
    pub fn compression(&self) -> Option<String> {
        self.engine.compression()
    }

    /// The peer's end-entity certificate, if it presented one
    ///
    /// With `binary` set the raw DER bytes are returned; otherwise the
    /// certificate is rendered as PEM text.
    pub fn peer_certificate(&self, binary: bool) -> Option<Vec<u8>> {
        let der = self.engine.peer_certificates()?.into_iter().next()?;
        if binary {
            Some(der)
        } else {
            Some(pem_encode("CERTIFICATE", &der).into_bytes())
        }
    }

    /// The full certificate chain presented by the peer, in DER form
    pub fn peer_certificate_chain(&self) -> Option<Vec<Vec<u8>>> {
        self.engine.peer_certificates()
    }

    /// Channel binding data for this session
    ///
    /// `"tls-unique"` is returned where the engine exposes it (TLS 1.2
    /// era; Rustls does not).  `"tls-exporter"` is the RFC 9266 binding
    /// derived through keying material export and works with TLS 1.3.
    /// Any other kind is an error.
    pub fn channel_binding(&self, kind: &str) -> Result<Option<Vec<u8>>, Error> {
        match kind {
            "tls-unique" => Ok(self.engine.tls_unique()),
            "tls-exporter" => self
                .engine
                .exporter(b"EXPORTER-Channel-Binding", Some(&[]), 32)
                .map(Some),
            _ => Err(Error::UnknownChannelBinding(kind.to_owned())),
        }
    }
}

fn pem_encode(tag: &str, der: &[u8]) -> String {
    let b64 = BASE64.encode(der);
    let mut out = format!("-----BEGIN {tag}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {tag}-----\n"));
    out
}
