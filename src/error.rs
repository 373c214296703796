//! Error taxonomy of the certificate store.
//!
//! The core modules return [`Error`]; the public engine operations in
//! [`crate::store`] catch the variants they can recover from and map
//! them to the coarse result codes in [`crate::types`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Certificate material could not be parsed, or a single-certificate
    /// constructor received a different count.
    #[error("certificate load error: {0}")]
    CertificateLoad(String),

    /// A hierarchy or bundle lookup found no matching certificate.
    #[error("no certificate found: {0}")]
    NoCertificateFound(String),

    /// No private key could be paired with the selected certificate.
    #[error("no private key found: {0}")]
    NoPrivateKey(String),

    /// No valid certificate exists at the searched filesystem locations.
    #[error("no valid certificate found: {0}")]
    NoCertificateValid(String),

    /// The requested operation is not valid for the bundle's source.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The hierarchy builder reached an impossible configuration. This
    /// indicates a bug, not bad input.
    #[error("invalid hierarchy state: {0}")]
    InvalidState(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}
