//! Narrow TLS reachability probe.
//!
//! Enrichment uses this to tell TLS services apart from plain TCP ones on
//! scanned ports. Certificates are never verified; the probe only cares
//! whether a handshake completes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;

/// What a completed handshake told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProbeInfo {
    pub port: u16,
    pub version: String,
}

/// Accept-everything verifier; reachability is the only question here.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn connector() -> TlsConnector {
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are valid")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Attempt a TLS handshake against `target:port`.
pub async fn probe_tls(
    cancel: &CancellationToken,
    target: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<TlsProbeInfo, ProbeError> {
    if target.is_ipv6() {
        return Err(ProbeError::Ipv6Unsupported);
    }

    let addr = SocketAddr::new(target, port);
    let handshake = async {
        let stream = TcpStream::connect(addr).await?;
        let server_name = ServerName::from(target);
        let tls = connector().connect(server_name, stream).await?;
        let (_io, conn) = tls.into_inner();
        Ok::<_, std::io::Error>(
            conn.protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_default(),
        )
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(ProbeError::NoResponseFromRemote),
        result = tokio::time::timeout(timeout, handshake) => result,
    };
    match result {
        Err(_) => Err(ProbeError::NoResponseFromRemote),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(ProbeError::ConnectionRefused)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            // plain TCP service answered with something that is not TLS
            Err(ProbeError::Tls(e.to_string()))
        }
        Ok(Err(e)) => Err(ProbeError::Tls(e.to_string())),
        Ok(Ok(version)) => Ok(TlsProbeInfo { port, version }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_tls_listener_is_not_reported_as_tls() {
        // a listener that never speaks TLS: handshake cannot complete
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let err = probe_tls(
            &CancellationToken::new(),
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_millis(250),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(
                err,
                ProbeError::Tls(_) | ProbeError::NoResponseFromRemote | ProbeError::ConnectionRefused
            ),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_refused_port() {
        let err = probe_tls(
            &CancellationToken::new(),
            "127.0.0.1".parse().unwrap(),
            1, // nothing listens here
            Duration::from_millis(250),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::ConnectionRefused | ProbeError::NoResponseFromRemote
        ));
    }
}
