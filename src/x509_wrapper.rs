//! Wrapper around one parsed X.509 certificate.
//!
//! A [`Certificate`] carries the parsed handle, the optional file it was
//! read from and its validity window relative to load time. Identity is
//! cryptographic (DER equality), never path based.

use std::fs;
use std::path::{Path, PathBuf};

use openssl::x509::{X509Ref, X509};

use crate::crypto;
use crate::error::{Error, Result};
use crate::types::{
    CertificateHashData, CertificateKeyUsage, EncodingFormat, HashAlgorithm,
};

/// Where certificate material originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    /// Built from a certificate file
    File,
    /// Built from a directory of certificates
    Directory,
    /// Built from a raw string
    String,
}

/// One parsed X.509 certificate with its on-disk origin and cached
/// validity window.
#[derive(Debug, Clone)]
pub struct Certificate {
    x509: X509,
    file: Option<PathBuf>,
    /// Seconds until the certificate becomes valid; negative is in the past.
    valid_in: i64,
    /// Seconds until the certificate expires; negative means expired.
    valid_to: i64,
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        crypto::x509_equal(&self.x509, &other.x509)
    }
}

impl Certificate {
    /// Wrap an already-parsed handle, associating the given origin.
    pub fn new(x509: X509, file: Option<PathBuf>) -> Result<Self> {
        let (valid_in, valid_to) = crypto::validity_window(&x509)?;

        Ok(Self {
            x509,
            file,
            valid_in,
            valid_to,
        })
    }

    /// Parse exactly one certificate from raw data.
    pub fn from_data(data: &[u8], encoding: EncodingFormat) -> Result<Self> {
        let mut loaded = crypto::load_certificates(data, encoding)?;

        if loaded.len() != 1 {
            return Err(Error::CertificateLoad(format!(
                "expected a single certificate, loaded: {}",
                loaded.len()
            )));
        }

        Self::new(loaded.remove(0), None)
    }

    /// Parse exactly one certificate from a regular file.
    pub fn from_file(path: &Path, encoding: EncodingFormat) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::CertificateLoad(format!(
                "can only load certificates from regular files: {}",
                path.display()
            )));
        }

        let data = fs::read(path)?;
        let mut certificate = Self::from_data(&data, encoding)?;
        certificate.file = Some(path.to_path_buf());

        Ok(certificate)
    }

    /// The raw certificate handle.
    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    /// An owned handle to the same certificate.
    pub fn to_x509(&self) -> X509 {
        self.x509.clone()
    }

    /// Seconds until the certificate becomes valid; negative is in the past.
    pub fn valid_in(&self) -> i64 {
        self.valid_in
    }

    /// Seconds until the certificate expires; negative means expired.
    pub fn valid_to(&self) -> i64 {
        self.valid_to
    }

    /// Within the validity window: already in force and not yet expired.
    pub fn is_valid(&self) -> bool {
        self.valid_in <= 0 && self.valid_to >= 0
    }

    /// Becomes valid only in the future, and does not expire before that.
    pub fn is_valid_in_future(&self) -> bool {
        self.valid_in > 0 && self.valid_to > 0
    }

    pub fn is_expired(&self) -> bool {
        self.valid_to < 0
    }

    pub fn is_self_signed(&self) -> bool {
        crypto::is_self_signed(&self.x509)
    }

    /// True when this certificate was issued and signed by `parent`. A
    /// certificate is never its own child; use [`Self::is_self_signed`]
    /// for self-issuance.
    pub fn is_child(&self, parent: &Certificate) -> bool {
        crypto::is_child(&self.x509, &parent.x509)
    }

    /// File this certificate resides in, when it came from disk.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Associate the certificate with a (future) file location.
    pub fn set_file(&mut self, path: PathBuf) -> Result<()> {
        if path.is_dir() {
            return Err(Error::InvalidOperation(format!(
                "set_file must only be used for files, not directories: {}",
                path.display()
            )));
        }

        self.file = Some(path);
        Ok(())
    }

    pub fn source(&self) -> CertificateSource {
        if self.file.is_some() {
            CertificateSource::File
        } else {
            CertificateSource::String
        }
    }

    /// Subject common name, empty when the certificate carries none.
    pub fn common_name(&self) -> String {
        crypto::common_name(&self.x509)
    }

    /// Serial number as lowercase hex without leading zeroes.
    pub fn serial_number(&self) -> Result<String> {
        crypto::serial_number(&self.x509)
    }

    /// SHA-256 of the DER encoded issuer distinguished name.
    pub fn issuer_name_hash(&self) -> Result<String> {
        crypto::issuer_name_hash(&self.x509)
    }

    /// SHA-256 of this certificate's subject public key material.
    pub fn key_hash(&self) -> Result<String> {
        crypto::key_hash(&self.x509)
    }

    /// Hash of the issuer's public key. OCPP exchanges the hash of the
    /// parent's subject public key, so without a parent this is only
    /// defined for self-signed certificates.
    pub fn issuer_key_hash(&self) -> Result<String> {
        if self.is_self_signed() {
            self.key_hash()
        } else {
            Err(Error::InvalidOperation(
                "issuer_key_hash without an issuer is only defined for self-signed certificates"
                    .to_string(),
            ))
        }
    }

    /// OCSP responder URL, empty when the certificate carries none.
    pub fn responder_url(&self) -> String {
        crypto::responder_url(&self.x509)
    }

    /// KeyUsage bits of the certificate extension.
    pub fn key_usage(&self) -> Vec<CertificateKeyUsage> {
        crypto::key_usage(&self.x509)
    }

    /// Canonical PEM rendering.
    pub fn export_string(&self) -> Result<String> {
        let pem = self.x509.to_pem()?;
        String::from_utf8(pem)
            .map_err(|e| Error::CertificateLoad(format!("certificate PEM is not UTF-8: {e}")))
    }

    /// Hash data of a self-signed certificate.
    pub fn certificate_hash_data(&self) -> Result<CertificateHashData> {
        Ok(CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: self.issuer_name_hash()?,
            issuer_key_hash: self.issuer_key_hash()?,
            serial_number: self.serial_number()?,
        })
    }

    /// Hash data of a certificate with the given issuer. The issuer key
    /// hash is the hash of the issuer's subject public key.
    pub fn certificate_hash_data_with_issuer(
        &self,
        issuer: &Certificate,
    ) -> Result<CertificateHashData> {
        if !self.is_child(issuer) {
            return Err(Error::InvalidOperation(
                "the specified issuer is not the issuer of this certificate".to_string(),
            ));
        }

        Ok(CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: self.issuer_name_hash()?,
            issuer_key_hash: issuer.key_hash()?,
            serial_number: self.serial_number()?,
        })
    }

    /// Compare against externally supplied hash data. Only meaningful for
    /// self-signed certificates, whose hash data needs no issuer.
    pub fn matches_hash_data(&self, hash: &CertificateHashData, ignore_case: bool) -> bool {
        match self.certificate_hash_data() {
            Ok(own) => {
                if ignore_case {
                    own.matches_ignore_case(hash)
                } else {
                    own == *hash
                }
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_leaf, generate_root};

    #[test]
    fn single_certificate_constructor_rejects_bundles() {
        let root = generate_root("Root", -3600, 86400);
        let leaf = generate_leaf(&root, "Leaf", -3600, 86400);

        let single = Certificate::from_data(root.pem().as_bytes(), EncodingFormat::Pem);
        assert!(single.is_ok());

        let bundle = format!("{}{}", root.pem(), leaf.pem());
        let result = Certificate::from_data(bundle.as_bytes(), EncodingFormat::Pem);
        assert!(matches!(result, Err(Error::CertificateLoad(_))));
    }

    #[test]
    fn from_file_rejects_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Certificate::from_file(dir.path(), EncodingFormat::Pem);
        assert!(matches!(result, Err(Error::CertificateLoad(_))));
    }

    #[test]
    fn equality_is_cryptographic_identity() {
        let root = generate_root("Root", -3600, 86400);

        let a = Certificate::from_data(root.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        let mut b = Certificate::from_data(root.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        b.set_file(PathBuf::from("/somewhere/else.pem")).unwrap();

        // Same DER, different paths: still the same certificate
        assert_eq!(a, b);

        let other = generate_root("Other", -3600, 86400);
        let c = Certificate::from_data(other.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn validity_flags() {
        let valid = generate_root("Valid", -3600, 86400);
        let cert = Certificate::from_data(valid.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        assert!(cert.is_valid());
        assert!(!cert.is_expired());
        assert!(!cert.is_valid_in_future());

        let expired = generate_root("Expired", -7200, -60);
        let cert = Certificate::from_data(expired.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        assert!(cert.is_expired());
        assert!(!cert.is_valid());

        let future = generate_root("Future", 3600, 86400);
        let cert = Certificate::from_data(future.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        assert!(cert.is_valid_in_future());
        assert!(!cert.is_valid());
    }

    #[test]
    fn issuer_key_hash_requires_self_signed() {
        let root = generate_root("Root", -3600, 86400);
        let leaf = generate_leaf(&root, "Leaf", -3600, 86400);

        let root_cert = Certificate::from_data(root.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_cert = Certificate::from_data(leaf.pem().as_bytes(), EncodingFormat::Pem).unwrap();

        assert_eq!(
            root_cert.issuer_key_hash().unwrap(),
            root_cert.key_hash().unwrap()
        );
        assert!(leaf_cert.issuer_key_hash().is_err());
    }

    #[test]
    fn hash_data_with_issuer_verifies_the_relation() {
        let root = generate_root("Root", -3600, 86400);
        let other = generate_root("Other", -3600, 86400);
        let leaf = generate_leaf(&root, "Leaf", -3600, 86400);

        let root_cert = Certificate::from_data(root.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        let other_cert =
            Certificate::from_data(other.pem().as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_cert = Certificate::from_data(leaf.pem().as_bytes(), EncodingFormat::Pem).unwrap();

        let hash = leaf_cert
            .certificate_hash_data_with_issuer(&root_cert)
            .expect("hash data");
        assert_eq!(hash.issuer_key_hash, root_cert.key_hash().unwrap());
        assert_eq!(hash.serial_number, leaf_cert.serial_number().unwrap());

        assert!(leaf_cert.certificate_hash_data_with_issuer(&other_cert).is_err());
    }

    #[test]
    fn export_string_round_trips() {
        let root = generate_root("Root", -3600, 86400);
        let cert = Certificate::from_data(root.pem().as_bytes(), EncodingFormat::Pem).unwrap();

        let exported = cert.export_string().expect("export");
        let reparsed = Certificate::from_data(exported.as_bytes(), EncodingFormat::Pem).unwrap();
        assert_eq!(cert, reparsed);
    }
}
