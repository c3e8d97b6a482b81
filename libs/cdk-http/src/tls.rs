//! TLS roots and crypto provider selection.

use std::sync::{Arc, OnceLock};

use rustls_pki_types::CertificateDer;

/// Native root certificates, loaded once per process.
static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_roots() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }
    tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    result.certs
}

/// Cached native root certificates (possibly empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(load_native_roots).as_slice()
}

/// The process-wide default provider if one is installed, aws-lc-rs otherwise.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Client config trusting the operating system certificate store.
///
/// # Errors
/// Fails when the store yields no usable certificate, so a broken trust store
/// surfaces when the client is built rather than on the first handshake.
pub fn native_roots_client_config() -> Result<rustls::ClientConfig, String> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err("no native root CA certificates found in OS certificate store".to_owned());
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(format!(
            "none of the {} native root certificates could be parsed",
            certs.len()
        ));
    }

    Ok(rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("failed to set TLS protocol versions: {e}"))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
