use crate::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Protocol version selector.  Leave unset to negotiate the library's
/// default (and most secure) set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Peer certificate verification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Do not verify the peer.  On the client side this disables server
    /// certificate validation entirely; use for testing only.
    None,
    /// Request a certificate but accept a peer that presents none
    /// (server side only)
    Optional,
    /// Require and verify a peer certificate
    #[default]
    Required,
}

/// A flat table of TLS configuration options
///
/// This is declarative glue over the Rustls config builders, for
/// callers that configure TLS from a settings file or command line
/// rather than programmatically.
///
/// ```no_run
/// use tlspipe::TlsOptions;
///
/// let opts = TlsOptions {
///     certfile: Some("server.pem".into()),
///     ..TlsOptions::default()
/// };
/// let config = opts.build_server().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Restrict the session to a single protocol version
    pub tls_version: Option<TlsVersion>,
    /// PEM file with our certificate chain
    pub certfile: Option<PathBuf>,
    /// PEM file with our private key; defaults to `certfile`
    pub keyfile: Option<PathBuf>,
    /// PEM bundle of trust roots; defaults to the built-in webpki roots
    pub ca_certs: Option<PathBuf>,
    /// Verification policy for the peer's certificate
    pub verify_mode: VerifyMode,
    /// Colon-separated cipher suite names to restrict the session to
    pub ciphers: Option<String>,
}

impl TlsOptions {
    /// Build a client-side Rustls configuration
    pub fn build_client(&self) -> Result<Arc<ClientConfig>, Error> {
        let builder = match self.provider()? {
            Some(provider) => ClientConfig::builder_with_provider(Arc::new(provider))
                .with_protocol_versions(self.versions())
                .map_err(|e| Error::Config(e.to_string()))?,
            None => ClientConfig::builder_with_protocol_versions(self.versions()),
        };
        let builder = if self.verify_mode == VerifyMode::None {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };
        let config = match &self.certfile {
            Some(certfile) => {
                let certs = load_certs(certfile)?;
                let key = load_key(self.keyfile.as_deref().unwrap_or(certfile))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::Config(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    /// Build a server-side Rustls configuration.  A server identity
    /// (`certfile`) is required.
    pub fn build_server(&self) -> Result<Arc<ServerConfig>, Error> {
        let certfile = self
            .certfile
            .as_deref()
            .ok_or_else(|| Error::Config("server identity requires a certfile".into()))?;
        let certs = load_certs(certfile)?;
        let key = load_key(self.keyfile.as_deref().unwrap_or(certfile))?;
        let builder = match self.provider()? {
            Some(provider) => ServerConfig::builder_with_provider(Arc::new(provider))
                .with_protocol_versions(self.versions())
                .map_err(|e| Error::Config(e.to_string()))?,
            None => ServerConfig::builder_with_protocol_versions(self.versions()),
        };
        let builder = match self.verify_mode {
            VerifyMode::None => builder.with_no_client_auth(),
            mode => {
                let roots = Arc::new(self.root_store()?);
                let verifier = WebPkiClientVerifier::builder(roots);
                let verifier = if mode == VerifyMode::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                builder.with_client_cert_verifier(
                    verifier.build().map_err(|e| Error::Config(e.to_string()))?,
                )
            }
        };
        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Arc::new(config))
    }

    fn versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
        static TLS13_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self.tls_version {
            None => rustls::DEFAULT_VERSIONS,
            Some(TlsVersion::Tls12) => TLS12_VERSIONS,
            Some(TlsVersion::Tls13) => TLS13_VERSIONS,
        }
    }

    /// A custom provider restricted to the configured cipher list, or
    /// `None` to use the process default as-is
    fn provider(&self) -> Result<Option<CryptoProvider>, Error> {
        let Some(list) = &self.ciphers else {
            return Ok(None);
        };
        let base = CryptoProvider::get_default().ok_or_else(|| {
            Error::Config("cipher selection requires an installed crypto provider".into())
        })?;
        let mut provider = (**base).clone();
        let selected = provider
            .cipher_suites
            .iter()
            .filter(|s| {
                let name = format!("{:?}", s.suite());
                list.split(':').any(|want| want.eq_ignore_ascii_case(&name))
            })
            .copied()
            .collect::<Vec<_>>();
        provider.cipher_suites = selected;
        if provider.cipher_suites.is_empty() {
            return Err(Error::Config(format!("no usable ciphers in {list:?}")));
        }
        Ok(Some(provider))
    }

    fn root_store(&self) -> Result<RootCertStore, Error> {
        let mut roots = RootCertStore::empty();
        match &self.ca_certs {
            Some(path) => {
                let (added, _) = roots.add_parsable_certificates(load_certs(path)?);
                if added == 0 {
                    return Err(Error::Config(format!(
                        "no usable certificates in {}",
                        path.display()
                    )));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        Ok(roots)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

/// Server certificate verifier that accepts anything, backing
/// [`VerifyMode::None`] on the client side
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
