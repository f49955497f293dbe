use std::sync::Arc;

use rustls::{
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
};

use crate::{
    config::SecurityConfig,
    errors::{StartError::Tls, TetherError},
    TlsContext,
};

pub struct TlsFactory {}

impl TlsFactory {
    /// The crypto provider selected by the crate features.
    pub fn provider() -> CryptoProvider {
        cfg_if::cfg_if! {
            if #[cfg(feature = "__rustls_aws_lc_rs")] {
                rustls::crypto::aws_lc_rs::default_provider()
            } else {
                rustls::crypto::ring::default_provider()
            }
        }
    }

    /// ALPN identifiers offered to clients, most preferred first.
    pub fn alpn_protocols() -> Vec<Vec<u8>> {
        vec![
            #[cfg(feature = "http2")]
            b"h2".to_vec(),
            b"http/1.1".to_vec(),
        ]
    }

    /// Returns a copy of `context` that negotiates HTTP/2 and HTTP/1.1.
    ///
    /// The caller's context is left untouched; the server keeps the returned
    /// one for its whole lifetime.
    pub fn register_alpn(context: &TlsContext) -> TlsContext {
        let mut config = (**context).clone();
        config.alpn_protocols = Self::alpn_protocols();
        Arc::new(config)
    }

    /// Builds a TLS context from DER-encoded certificate material.
    ///
    /// ALPN is registered on the result.
    pub fn create_tls_context(security: &SecurityConfig) -> Result<TlsContext, TetherError> {
        let cert = CertificateDer::try_from(security.cert().to_vec())
            .map_err(|_| Tls("Failed to parse certificate".to_string()))?;
        let mut chain = vec![cert];
        if let Some(ca_cert) = security.ca_cert() {
            let ca_cert = CertificateDer::try_from(ca_cert.to_vec())
                .map_err(|_| Tls("Failed to parse CA certificate".to_string()))?;
            chain.push(ca_cert);
        }

        let key = PrivateKeyDer::try_from(security.key().to_vec())
            .map_err(|_| Tls("Failed to parse private key".to_string()))?;

        let builder = rustls::ServerConfig::builder_with_provider(Arc::new(Self::provider()))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| Tls(e.to_string()))?;

        let tls_config = builder
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Tls(e.to_string()))?;

        Ok(Self::register_alpn(&Arc::new(tls_config)))
    }
}
