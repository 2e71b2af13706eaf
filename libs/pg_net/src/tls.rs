//! TLS session wrapping a TCP socket (spec §4.2).
//!
//! `tokio_rustls` already folds the `WANT_READ`/`WANT_WRITE` handshake loop
//! into its `connect()` future; the per-call timeout budget that loop would
//! have spent polling is applied the same way the plain socket connect is.

use std::sync::Arc;
use std::time::Duration;

use pg_util::CoreError;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::socket::ready;

pub fn default_client_config(verify_tls: bool, extra_ca_pem: Option<&[u8]>) -> Result<ClientConfig, CoreError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    if let Some(pem) = extra_ca_pem {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert = cert.map_err(|e| CoreError::Crypto(format!("parsing CA pem: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| CoreError::Crypto(format!("adding CA cert: {e}")))?;
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CoreError::Crypto(format!("rustls provider setup: {e}")))?
        .with_root_certificates(roots);
    let mut config = builder.with_no_client_auth();

    if !verify_tls {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerify));
    }

    Ok(config)
}

/// A TLS session over an owned `TcpStream`. Close is idempotent: the inner
/// stream is dropped once, subsequent calls are no-ops.
pub struct TlsSession {
    inner: Option<TlsStream<TcpStream>>,
}

impl TlsSession {
    pub async fn connect(
        stream: TcpStream,
        server_name: &str,
        config: Arc<ClientConfig>,
        handshake_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let connector = TlsConnector::from(config);
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| CoreError::Crypto(format!("invalid server name '{server_name}': {e}")))?;

        let tls = ready(connector.connect(name, stream), handshake_timeout, "tls handshake").await?;
        Ok(Self { inner: Some(tls) })
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CoreError> {
        let stream = self
            .inner
            .as_mut()
            .ok_or_else(|| CoreError::Assert("read on closed TLS session".into()))?;
        stream.read(buf).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CoreError::Protocol("unexpected eof".into()),
            _ => CoreError::io("tls read", "<socket>", e),
        })
    }

    /// Never returns until the entire buffer is consumed or the call fails.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        let stream = self
            .inner
            .as_mut()
            .ok_or_else(|| CoreError::Assert("write on closed TLS session".into()))?;
        stream.write_all(buf).await.map_err(|e| CoreError::io("tls write", "<socket>", e))
    }

    pub async fn flush(&mut self) -> Result<(), CoreError> {
        if let Some(stream) = self.inner.as_mut() {
            stream.flush().await.map_err(|e| CoreError::io("tls flush", "<socket>", e))?;
        }
        Ok(())
    }

    /// Bidirectional shutdown; idempotent.
    pub async fn close(&mut self) -> Result<(), CoreError> {
        if let Some(mut stream) = self.inner.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Used only when `repo-storage-verify-tls=false`; mirrors the
    /// `verify_tls` escape hatch in the source's S3/Azure/GCS helpers.
    #[derive(Debug)]
    pub struct NoVerify;

    impl ServerCertVerifier for NoVerify {
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
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
            ]
        }
    }
}
