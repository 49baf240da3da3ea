//! TLS support for [`HttpTransport`](super::HttpTransport).

use std::sync::Arc;

use parking_lot::Mutex;
use rustls::ClientConfig;
use tracing::warn;

use super::{HttpProtocol, TlsSecret, TransportError};

/// Get a default TLS client configuration by loading the platform's native certificates.
///
/// The configuration only advertises `http/1.1` over ALPN.
pub fn default_tls_config() -> ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("error loading platform certificate: {}", error);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");

    let mut cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols.push(HttpProtocol::Http1.alpn().to_vec());
    cfg
}

/// Derive a per-connection config which only offers the protocols this transport
/// speaks, optionally capturing the session's secrets.
pub(super) fn pinned_config(
    base: &Arc<ClientConfig>,
    protocols: &[HttpProtocol],
    capture: Option<Arc<SecretCapture>>,
) -> Result<Arc<ClientConfig>, TransportError> {
    let mut config = ClientConfig::clone(base);
    config.alpn_protocols = protocols
        .iter()
        .filter(|protocol| matches!(protocol, HttpProtocol::Http1))
        .map(|protocol| protocol.alpn().to_vec())
        .collect();

    if config.alpn_protocols.is_empty() {
        return Err(TransportError::UnsupportedProtocol);
    }

    if let Some(capture) = capture {
        config.key_log = capture as Arc<dyn rustls::KeyLog>;
    }

    Ok(Arc::new(config))
}

/// Collects the secrets rustls reports during one handshake.
#[derive(Debug, Default)]
pub(super) struct SecretCapture {
    secrets: Mutex<Vec<TlsSecret>>,
}

impl SecretCapture {
    pub(super) fn take(&self) -> Vec<TlsSecret> {
        std::mem::take(&mut *self.secrets.lock())
    }
}

impl rustls::KeyLog for SecretCapture {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        self.secrets.lock().push(TlsSecret {
            label: label.to_owned(),
            client_random: client_random.to_vec(),
            secret: secret.to_vec(),
        });
    }
}
