//! Server credentials: either insecure plaintext or a ready-made rustls
//! server configuration built from PEM key/certificate-chain pairs.

use std::io::{BufReader, Cursor};
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::error::ServerError;
use crate::grpc_info;

/// Default CA roots taken from `GRPC_DEFAULT_SSL_ROOTS_FILE_PATH`, read once.
static DEFAULT_ROOTS_PEM: Lazy<Option<Vec<u8>>> = Lazy::new(|| {
    let path = std::env::var("GRPC_DEFAULT_SSL_ROOTS_FILE_PATH").ok()?;
    std::fs::read(path).ok()
});

/// The `GRPC_SSL_CIPHER_SUITES` override, read once. rustls selects suites
/// from its provider; the requested list is recorded for diagnostics.
static CIPHER_SUITES: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("GRPC_SSL_CIPHER_SUITES").ok());

/// One PEM private key with its PEM certificate chain.
#[derive(Clone)]
pub struct KeyCertPair {
    pub private_key: Vec<u8>,
    pub cert_chain: Vec<u8>,
}

/// Credentials handed to [`crate::Server::bind`].
#[derive(Clone, Debug)]
pub enum ServerCredentials {
    Insecure,
    Secure { config: Arc<ServerConfig> },
}

impl ServerCredentials {
    /// Plaintext listener credentials.
    pub fn insecure() -> Self {
        ServerCredentials::Insecure
    }

    /// TLS listener credentials.
    ///
    /// `root_certs` are the client-certificate verification roots; when
    /// omitted they fall back to `GRPC_DEFAULT_SSL_ROOTS_FILE_PATH` and then
    /// to the bundled web roots. Only meaningful together with
    /// `check_client_certificate`.
    pub fn secure(
        root_certs: Option<&[u8]>,
        key_cert_pairs: &[KeyCertPair],
        check_client_certificate: bool,
    ) -> Result<Self, ServerError> {
        if key_cert_pairs.is_empty() {
            return Err(ServerError::InvalidCredentials(
                "at least one key/certificate pair is required".to_string(),
            ));
        }
        if let Some(requested) = CIPHER_SUITES.as_ref() {
            grpc_info!("GRPC_SSL_CIPHER_SUITES requested: {}", requested);
        }

        let provider = Arc::new(default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let builder = if check_client_certificate {
            let roots = Arc::new(client_roots(root_certs)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| ServerError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        // The first pair carries the server identity.
        let pair = &key_cert_pairs[0];
        let certs = read_certs(&pair.cert_chain)?;
        if certs.is_empty() {
            return Err(ServerError::InvalidCredentials(
                "certificate chain contains no certificates".to_string(),
            ));
        }
        let key = read_private_key(&pair.private_key)?;

        let mut config = builder
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(ServerCredentials::Secure {
            config: Arc::new(config),
        })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ServerCredentials::Secure { .. })
    }

    pub(crate) fn tls_config(&self) -> Option<Arc<ServerConfig>> {
        match self {
            ServerCredentials::Insecure => None,
            ServerCredentials::Secure { config } => Some(config.clone()),
        }
    }
}

fn client_roots(root_certs: Option<&[u8]>) -> Result<RootCertStore, ServerError> {
    let mut store = RootCertStore::empty();
    let pem = root_certs
        .map(|b| b.to_vec())
        .or_else(|| DEFAULT_ROOTS_PEM.clone());
    match pem {
        Some(pem) => {
            let certs = read_certs(&pem)?;
            let (added, _ignored) = store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(ServerError::InvalidCredentials(
                    "no usable root certificates".to_string(),
                ));
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(Cursor::new(pem));
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::InvalidCredentials(format!("bad certificate PEM: {}", e)))
}

fn read_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(Cursor::new(pem));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::InvalidCredentials(format!("bad private key PEM: {}", e)))?
        .ok_or_else(|| ServerError::InvalidCredentials("no private key in PEM".to_string()))
}
