//! The TLS client state machine (§4.3): wraps a [`ByteStream`] and drives
//! `rustls::ClientConnection`'s sans-I/O API directly, rather than through `tokio-rustls`, so
//! the named states below are a first-class, observable part of the design instead of being
//! hidden inside someone else's wrapper.
//!
//! Grounded in the sans-I/O driving pattern from the `oasis-core` `tls_rustls.rs` reference
//! example (handshake pump loop, `IoAdapter`-style buffer bridging) adapted into an async
//! driver loop whose suspension points are `.await`s instead of `pending` returns.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConnection;
use typed_builder::TypedBuilder;

use crate::address::Destination;
use crate::error::{Error, ErrorKind, Result, TlsErrorKind};
use crate::stream::{BoxFuture, ByteStream};
use crate::verify::{CertVerifier, CertificateChain, VerifyRequest};

/// Named states of the driver loop (§4.3 "States"). Exposed for observability; the loop itself
/// is an ordinary `async fn` whose `.await` points are where the original would have returned
/// `pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsState {
    None,
    HandshakeRead,
    HandshakeReadComplete,
    HandshakeWrite,
    HandshakeWriteComplete,
    VerifyCert,
    VerifyCertComplete,
    PayloadEncrypt,
    PayloadWrite,
    PayloadWriteComplete,
    PayloadRead,
    PayloadReadComplete,
}

/// Controls which protocol versions are enabled, revocation/EV checking, the optional client
/// certificate, and the pre-accepted leaf-certificate exception set (§4.3 "Configuration", §6
/// "Configuration surface").
#[derive(Clone, Debug, TypedBuilder)]
pub struct TlsStreamConfig {
    #[builder(default = true)]
    pub tls12: bool,
    #[builder(default = true)]
    pub tls13: bool,
    #[builder(default = false)]
    pub check_revocation: bool,
    #[builder(default = false)]
    pub check_ev: bool,
    #[builder(default)]
    pub client_cert: Option<ClientCertificate>,
    /// Leaf certificates (keyed by DER encoding) whose verification errors the caller has
    /// pre-accepted.
    #[builder(default)]
    pub accepted_leaf_certs: HashSet<Vec<u8>>,
}

#[derive(Clone)]
pub struct ClientCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: Arc<dyn rustls::sign::SigningKey>,
}

impl std::fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Wraps a plaintext [`ByteStream`] and presents the same contract, after handshake and
/// certificate verification (§4.3).
pub struct TlsStream<S: ByteStream> {
    inner: S,
    conn: ClientConnection,
    verifier: Arc<CertVerifier>,
    config: TlsStreamConfig,
    hostname: String,
    state: TlsState,
    plaintext_buf: VecDeque<u8>,
    accepted_leaf_encoded: Option<Vec<u8>>,
}

impl<S: ByteStream> TlsStream<S> {
    pub fn new(
        inner: S,
        hostname: impl Into<String>,
        verifier: Arc<CertVerifier>,
        config: TlsStreamConfig,
        roots: Arc<rustls::RootCertStore>,
    ) -> Result<Self> {
        let hostname = hostname.into();
        let client_config = build_client_config(&config, roots)?;
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| Error::network(crate::error::NetworkErrorKind::AddressInvalid(
                hostname.clone(),
            )))?;
        let conn = ClientConnection::new(Arc::new(client_config), server_name)
            .map_err(Error::from)?;

        Ok(Self {
            inner,
            conn,
            verifier,
            config,
            hostname,
            state: TlsState::None,
            plaintext_buf: VecDeque::new(),
            accepted_leaf_encoded: None,
        })
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    /// Drives the handshake to completion, then certificate verification (§4.3
    /// "Transitions"). Returns once the state machine has returned to `None` with `ok`, i.e.
    /// after `verify-cert-complete` accepts the result.
    pub async fn handshake(&mut self) -> Result<()> {
        self.inner.connect().await?;
        self.state = TlsState::HandshakeWrite;

        loop {
            match self.state {
                TlsState::HandshakeWrite => self.pump_write(true).await?,
                TlsState::HandshakeWriteComplete => {
                    self.state = if self.conn.wants_write() {
                        TlsState::HandshakeWrite
                    } else {
                        TlsState::HandshakeRead
                    };
                }
                TlsState::HandshakeRead => self.pump_read().await?,
                TlsState::HandshakeReadComplete => self.process_handshake_packets()?,
                TlsState::VerifyCert => self.verify_cert().await?,
                TlsState::VerifyCertComplete => {
                    self.state = TlsState::None;
                    return Ok(());
                }
                TlsState::None => return Ok(()),
                _ => unreachable!("handshake driver does not visit payload states"),
            }
        }
    }

    async fn pump_write(&mut self, handshake: bool) -> Result<()> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        if !out.is_empty() {
            let mut written = 0;
            while written < out.len() {
                written += self.inner.write(&out[written..]).await?;
            }
        }
        self.state = if handshake {
            TlsState::HandshakeWriteComplete
        } else {
            TlsState::PayloadWriteComplete
        };
        Ok(())
    }

    async fn pump_read(&mut self) -> Result<()> {
        let mut buf = [0u8; 8192];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            // EOF mid-handshake, with no close_notify possible yet: always a protocol error.
            return Err(Error::tls(TlsErrorKind::ProtocolError));
        }
        let mut cursor = &buf[..n];
        self.conn
            .read_tls(&mut cursor)
            .map_err(Error::from)?;
        self.state = TlsState::HandshakeReadComplete;
        Ok(())
    }

    fn process_handshake_packets(&mut self) -> Result<()> {
        let io_state = self.conn.process_new_packets()?;
        if self.conn.wants_write() {
            self.state = TlsState::HandshakeWrite;
        } else if self.conn.is_handshaking() {
            self.state = TlsState::HandshakeRead;
        } else {
            // Handshake engine-complete; any early application data the peer already sent is
            // buffered for later by rustls itself, drained once we reach payload-read.
            let _ = io_state;
            self.state = TlsState::VerifyCert;
        }
        Ok(())
    }

    async fn verify_cert(&mut self) -> Result<()> {
        let certs = self
            .conn
            .peer_certificates()
            .ok_or_else(|| Error::tls(TlsErrorKind::BadClientAuthCert))?;
        let (leaf, intermediates) = certs
            .split_first()
            .ok_or_else(|| Error::tls(TlsErrorKind::BadClientAuthCert))?;

        if self.config.accepted_leaf_certs.contains(leaf.as_ref()) {
            self.accepted_leaf_encoded = Some(leaf.as_ref().to_vec());
            self.state = TlsState::VerifyCertComplete;
            return Ok(());
        }

        let chain = Arc::new(CertificateChain::new(
            leaf.clone().into_owned(),
            intermediates.iter().map(|c| c.clone().into_owned()).collect(),
        ));
        let request = VerifyRequest {
            chain,
            hostname: self.hostname.clone(),
            check_revocation: self.config.check_revocation,
        };
        let result = self.verifier.verify_async(request).await?;
        if !result.status.is_success() {
            return Err(Error::new(ErrorKind::Certificate { status: result.status }));
        }
        self.accepted_leaf_encoded = Some(leaf.as_ref().to_vec());
        self.state = TlsState::VerifyCertComplete;
        Ok(())
    }

    /// Drains `rustls`'s decrypted-plaintext reader into `plaintext_buf` (§4.3 "Record
    /// buffering"). Called after every successful `process_new_packets` during payload I/O.
    fn drain_decrypted(&mut self) -> Result<()> {
        use std::io::Read;
        let mut reader = self.conn.reader();
        let mut tmp = [0u8; 8192];
        loop {
            match reader.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => self.plaintext_buf.extend(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl<S: ByteStream> ByteStream for TlsStream<S> {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.handshake().await })
    }

    fn read(&mut self, buf: &mut [u8]) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            self.state = if self.plaintext_buf.is_empty() {
                TlsState::PayloadRead
            } else {
                TlsState::PayloadReadComplete
            };

            loop {
                match self.state {
                    TlsState::PayloadReadComplete => {
                        let n = std::cmp::min(buf.len(), self.plaintext_buf.len());
                        for slot in buf.iter_mut().take(n) {
                            *slot = self.plaintext_buf.pop_front().unwrap();
                        }
                        self.state = TlsState::None;
                        return Ok(n);
                    }
                    TlsState::PayloadRead => {
                        let mut raw = [0u8; 8192];
                        let n = self.inner.read(&mut raw).await?;
                        if n == 0 {
                            // No close_notify seen: `process_new_packets` below will detect a
                            // clean close and we surface Ok(0); an abrupt peer vanish without
                            // any TLS-level signal is the protocol-error case from §4.3.
                            if self.conn.is_handshaking() {
                                return Err(Error::tls(TlsErrorKind::ProtocolError));
                            }
                            return Ok(0);
                        }
                        let mut cursor = &raw[..n];
                        self.conn
                            .read_tls(&mut cursor)
                            .map_err(Error::from)?;

                        let io_state = match self.conn.process_new_packets() {
                            Ok(state) => state,
                            Err(e) => return Err(e.into()),
                        };

                        if self.conn.is_handshaking() {
                            // A post-handshake renegotiation request surfaced as the connection
                            // re-entering the handshake phase. §4.3 "Renegotiation": refused
                            // unconditionally, regardless of whether plaintext is pending.
                            let _ = io_state;
                            return Err(Error::tls(TlsErrorKind::RenegotiationRequested));
                        }

                        self.drain_decrypted()?;
                        if self.plaintext_buf.is_empty() && io_state.plaintext_bytes_to_read() == 0
                        {
                            if self.conn.is_handshaking() {
                                continue;
                            }
                            // Zero bytes decrypted with no handshake in progress and an
                            // otherwise-healthy connection: treat as close (the peer's
                            // close_notify already transitioned the connection state).
                            return Ok(0);
                        }
                        self.state = TlsState::PayloadReadComplete;
                    }
                    _ => unreachable!(),
                }
            }
        })
    }

    fn write(&mut self, buf: &[u8]) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            self.state = TlsState::PayloadEncrypt;
            // Cap each call at a single maximum-size TLS record's worth of plaintext so one
            // `write` always produces one `write_tls` flush (§4.3 "Write-size capping").
            const MAX_FRAGMENT: usize = 16 * 1024;
            let chunk = &buf[..std::cmp::min(buf.len(), MAX_FRAGMENT)];

            {
                use std::io::Write;
                self.conn
                    .writer()
                    .write_all(chunk)
                    .map_err(Error::from)?;
            }
            self.state = TlsState::PayloadWrite;
            self.pump_write(false).await?;
            Ok(chunk.len())
        })
    }

    fn disconnect(&mut self) {
        let _ = self.conn.send_close_notify();
        self.inner.disconnect();
        self.plaintext_buf.clear();
        self.state = TlsState::None;
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn is_connected_and_idle(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if !self.plaintext_buf.is_empty() {
                return false;
            }
            self.inner.is_connected_and_idle().await
        })
    }

    fn peer_name(&self) -> &Destination {
        self.inner.peer_name()
    }
}

fn build_client_config(
    config: &TlsStreamConfig,
    roots: Arc<rustls::RootCertStore>,
) -> Result<rustls::ClientConfig> {
    if !config.tls12 && !config.tls13 {
        return Err(Error::tls(TlsErrorKind::NoSslVersionsEnabled));
    }

    let provider = rustls::crypto::ring::default_provider();
    let versions: Vec<&'static rustls::SupportedProtocolVersion> = match (config.tls12, config.tls13) {
        (true, true) => vec![&rustls::version::TLS12, &rustls::version::TLS13],
        (true, false) => vec![&rustls::version::TLS12],
        (false, true) => vec![&rustls::version::TLS13],
        (false, false) => unreachable!("checked above"),
    };

    let dangerous = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)
        .map_err(|e| Error::internal(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(crate::verify::InlineVerifier { roots }));

    // The handshake engine is intentionally permissive (`InlineVerifier` accepts whatever chain
    // the server presents): the real check happens afterwards, as its own named state, by
    // handing the peer's chain to `CertVerifier` (§4.3 "verify-cert" is deliberately decoupled
    // from engine handshake completion, mirroring the split between a platform TLS engine and a
    // separate `CertVerifier` the design is based on).
    let client_config = match &config.client_cert {
        Some(client_cert) => {
            let key = Arc::clone(&client_cert.key);
            let certified_key = Arc::new(rustls::sign::CertifiedKey::new(client_cert.chain.clone(), key));
            dangerous.with_client_cert_resolver(Arc::new(StaticClientCert { certified_key }))
        }
        None => dangerous.with_no_client_auth(),
    };

    Ok(client_config)
}

/// Always offers the one configured client certificate, regardless of the server's acceptable-CA
/// hints. A fleet of one certificate has nothing to choose between.
struct StaticClientCert {
    certified_key: Arc<rustls::sign::CertifiedKey>,
}

impl std::fmt::Debug for StaticClientCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticClientCert").finish_non_exhaustive()
    }
}

impl rustls::client::ResolvesClientCert for StaticClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sig_schemes: &[rustls::SignatureScheme],
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(self.certified_key.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_protocol_versions_enabled_is_rejected() {
        let config = TlsStreamConfig::builder()
            .tls12(false)
            .tls13(false)
            .build();
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let err = build_client_config(&config, Arc::new(roots)).unwrap_err();
        assert!(matches!(
            *err.kind,
            ErrorKind::Tls(TlsErrorKind::NoSslVersionsEnabled)
        ));
    }
}
