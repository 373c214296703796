//! Certificate and private key lifecycle management for EV charging
//! stations.
//!
//! A charging station talks to four distinct PKIs: the ISO 15118 vehicle
//! ecosystem (V2G), its management backend (CSMS), the mobility operator
//! of roaming contracts (MO) and the manufacturer firmware-signing PKI
//! (MF). This crate owns every certificate and private key involved:
//! trust anchor bundles, locally generated leaf certificates with their
//! keys, cached OCSP responder data and the symlinks that expose the
//! current material to consumers such as the TLS stack.
//!
//! # Overview
//!
//! ```text
//! CertificateStore (one mutex, all public operations)
//!   ├── CA bundles          one per PKI, file or directory sourced
//!   ├── Leaf directories    per-role chain files + private keys
//!   │     └── ocsp/         side-car OCSP response cache
//!   ├── Pending CSR table   keys awaiting their certificate
//!   └── GC worker           periodic cleanup within resource caps
//! ```
//!
//! Certificates arrive as unordered PEM blobs from multiple sources. The
//! store reconstructs the issuer/child forest on every operation
//! ([`x509_hierarchy`]), keeps the in-memory model and the on-disk layout
//! mutually consistent ([`x509_bundle`]), and exposes coarse result codes
//! suited for the OCPP-style request surface above it.
//!
//! # Example
//!
//! ```no_run
//! use evse_pki::configs::{LeafDirectories, StoreConfig, StorePaths, LinkPaths};
//! use evse_pki::store::CertificateStore;
//! use evse_pki::types::CaCertificateType;
//!
//! let paths = StorePaths {
//!     csms_ca_bundle: "/certs/ca/csms/CSMS_ROOT_CA.pem".into(),
//!     mf_ca_bundle: "/certs/ca/mf/MF_ROOT_CA.pem".into(),
//!     mo_ca_bundle: "/certs/ca/mo/MO_ROOT_CA.pem".into(),
//!     v2g_ca_bundle: "/certs/ca/v2g/V2G_ROOT_CA.pem".into(),
//!     directories: LeafDirectories {
//!         csms_leaf_cert_directory: "/certs/client/csms".into(),
//!         csms_leaf_key_directory: "/certs/client/csms".into(),
//!         secc_leaf_cert_directory: "/certs/client/cso".into(),
//!         secc_leaf_key_directory: "/certs/client/cso".into(),
//!     },
//!     links: LinkPaths::default(),
//! };
//!
//! let store = CertificateStore::new(StoreConfig::new(paths), None);
//!
//! let root_pem = std::fs::read_to_string("/tmp/V2G_ROOT.pem").unwrap();
//! store.install_ca_certificate(&root_pem, CaCertificateType::V2g);
//! assert!(store.is_ca_certificate_installed(CaCertificateType::V2g));
//! ```
//!
//! # Concurrency
//!
//! The store serializes every public operation on one internal mutex and
//! performs straight-line blocking I/O while holding it. The filesystem
//! is the only shared resource; concurrent external mutation of the
//! managed directories is not supported.

pub mod configs;
pub mod crypto;
pub mod error;
pub mod fs_utils;
pub mod ocsp;
pub mod store;
pub mod types;
pub mod x509_bundle;
pub mod x509_hierarchy;
pub mod x509_wrapper;

#[cfg(test)]
pub(crate) mod test_support;

pub use configs::{LeafDirectories, LinkPaths, StoreConfig, StorePaths};
pub use error::{Error, Result};
pub use store::CertificateStore;
pub use types::{
    CaCertificateType, CertificateHashData, CertificateHashDataChain, CertificateInfo,
    CertificateKeyUsage, CertificateOcsp, CertificateType, CertificateValidationResult,
    DeleteCertificateResult, DeleteResult, EncodingFormat, GetCertificateFullInfoResult,
    GetCertificateInfoResult, GetCertificateInfoStatus, GetCertificateSignRequestResult,
    GetCertificateSignRequestStatus, GetInstalledCertificatesResult,
    GetInstalledCertificatesStatus, HashAlgorithm, InstallCertificateResult, LeafCertificateType,
    OcspRequestData,
};
pub use x509_bundle::CertificateBundle;
pub use x509_hierarchy::CertificateHierarchy;
pub use x509_wrapper::{Certificate, CertificateSource};
