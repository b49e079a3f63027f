use std::sync::{Arc, OnceLock};

use rustls::crypto::CryptoProvider;

use crate::error::{Error, Result};

/// Installs the feature-selected crypto provider as the process default, once.
///
/// If the application installed a provider first, that one is kept.
pub(crate) fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = crypto_provider().install_default();
    });
}

/// Returns the process-wide provider, installing ours first if none is set.
pub(crate) fn default_provider() -> Result<Arc<CryptoProvider>> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default()
        .cloned()
        .ok_or(Error::MissingCryptoProvider)
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
