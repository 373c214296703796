//! Common types shared across the certificate store: PKI role enums,
//! coarse operation results and the OCPP-style certificate hash data.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File extension for PEM encoded certificates.
pub const PEM_EXTENSION: &str = "pem";
/// File extension for DER encoded certificates and OCSP responses.
pub const DER_EXTENSION: &str = "der";
/// File extension for private keys handled by the default provider.
pub const KEY_EXTENSION: &str = "key";
/// File extension for private keys handed off to a custom provider (e.g. a TPM).
pub const CUSTOM_KEY_EXTENSION: &str = "tkey";
/// File extension for OCSP side-car hash files.
pub const CERT_HASH_EXTENSION: &str = "hash";

/// Encoding of certificate material on disk or on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingFormat {
    Der,
    Pem,
}

impl fmt::Display for EncodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncodingFormat::Der => "DER",
            EncodingFormat::Pem => "PEM",
        };
        write!(f, "{s}")
    }
}

/// The four trust anchor PKIs managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CaCertificateType {
    V2g,
    Mo,
    Csms,
    Mf,
}

impl CaCertificateType {
    pub const ALL: [CaCertificateType; 4] = [
        CaCertificateType::V2g,
        CaCertificateType::Mo,
        CaCertificateType::Csms,
        CaCertificateType::Mf,
    ];

    /// The installed-certificate chain kind reported for this root.
    pub fn certificate_type(self) -> CertificateType {
        match self {
            CaCertificateType::V2g => CertificateType::V2gRootCertificate,
            CaCertificateType::Mo => CertificateType::MoRootCertificate,
            CaCertificateType::Csms => CertificateType::CsmsRootCertificate,
            CaCertificateType::Mf => CertificateType::MfRootCertificate,
        }
    }
}

impl fmt::Display for CaCertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaCertificateType::V2g => "V2G",
            CaCertificateType::Mo => "MO",
            CaCertificateType::Csms => "CSMS",
            CaCertificateType::Mf => "MF",
        };
        write!(f, "{s}")
    }
}

/// Leaf (end-entity) certificate roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafCertificateType {
    Csms,
    V2g,
    Mf,
    Mo,
}

impl LeafCertificateType {
    /// Trust anchor PKI the leaf chains up to.
    pub fn ca_certificate_type(self) -> CaCertificateType {
        match self {
            LeafCertificateType::Csms => CaCertificateType::Csms,
            LeafCertificateType::V2g => CaCertificateType::V2g,
            LeafCertificateType::Mf => CaCertificateType::Mf,
            LeafCertificateType::Mo => CaCertificateType::Mo,
        }
    }

    /// Prefix used when naming installed leaf files on disk.
    pub fn filename_prefix(self) -> &'static str {
        match self {
            LeafCertificateType::Csms => "CSMS_LEAF_",
            LeafCertificateType::V2g => "SECC_LEAF_",
            LeafCertificateType::Mf => "MF_LEAF_",
            LeafCertificateType::Mo => "MO_LEAF_",
        }
    }
}

impl fmt::Display for LeafCertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeafCertificateType::Csms => "CSMS",
            LeafCertificateType::V2g => "V2G",
            LeafCertificateType::Mf => "MF",
            LeafCertificateType::Mo => "MO",
        };
        write!(f, "{s}")
    }
}

/// What an installed-certificates request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateType {
    V2gRootCertificate,
    MoRootCertificate,
    CsmsRootCertificate,
    V2gCertificateChain,
    MfRootCertificate,
}

impl CertificateType {
    /// The trust anchor PKI for root kinds, `None` for the V2G chain kind.
    pub fn ca_certificate_type(self) -> Option<CaCertificateType> {
        match self {
            CertificateType::V2gRootCertificate => Some(CaCertificateType::V2g),
            CertificateType::MoRootCertificate => Some(CaCertificateType::Mo),
            CertificateType::CsmsRootCertificate => Some(CaCertificateType::Csms),
            CertificateType::MfRootCertificate => Some(CaCertificateType::Mf),
            CertificateType::V2gCertificateChain => None,
        }
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateType::V2gRootCertificate => "V2GRootCertificate",
            CertificateType::MoRootCertificate => "MORootCertificate",
            CertificateType::CsmsRootCertificate => "CSMSRootCertificate",
            CertificateType::V2gCertificateChain => "V2GCertificateChain",
            CertificateType::MfRootCertificate => "MFRootCertificate",
        };
        write!(f, "{s}")
    }
}

/// Hash algorithm used for certificate hash data. The store always emits
/// SHA-256; the other discriminants exist for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        };
        write!(f, "{s}")
    }
}

/// Outcome of verifying a certificate chain against the installed trust
/// anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateValidationResult {
    Valid,
    Expired,
    InvalidSignature,
    IssuerNotFound,
    InvalidLeafSignature,
    InvalidChain,
    Unknown,
}

/// Outcome of installing a CA or leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallCertificateResult {
    InvalidSignature,
    InvalidCertificateChain,
    InvalidFormat,
    InvalidCommonName,
    NoRootCertificateInstalled,
    Expired,
    CertificateStoreMaxLengthExceeded,
    WriteError,
    Accepted,
}

/// Outcome of a certificate deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteCertificateResult {
    Accepted,
    Failed,
    NotFound,
}

/// Deletion outcome plus the role the deleted material belonged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub result: DeleteCertificateResult,
    pub ca_certificate_type: Option<CaCertificateType>,
    pub leaf_certificate_type: Option<LeafCertificateType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetInstalledCertificatesStatus {
    Accepted,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetCertificateInfoStatus {
    Accepted,
    Rejected,
    NotFound,
    NotFoundValid,
    PrivateKeyNotFound,
}

/// Outward status of a certificate signing request generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetCertificateSignRequestStatus {
    Accepted,
    InvalidRequestedType,
    KeyGenError,
    GenerationError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateSignRequestResult {
    pub status: GetCertificateSignRequestStatus,
    pub csr: Option<String>,
}

/// KeyUsage bits read from a certificate extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateKeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

/// Issuer-scoped identity of a certificate, as exchanged with the backend.
///
/// `issuer_name_hash` is the SHA-256 of the DER encoded issuer
/// distinguished name. `issuer_key_hash` is the SHA-256 of the issuer's
/// subject public key material; for a self-signed certificate it equals
/// the certificate's own key hash. `serial_number` is lowercase hex
/// without the `0x` prefix and without leading zeroes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHashData {
    pub hash_algorithm: HashAlgorithm,
    pub issuer_name_hash: String,
    pub issuer_key_hash: String,
    pub serial_number: String,
}

impl CertificateHashData {
    /// Case-insensitive comparison used when receiving hash data from
    /// external parties whose hex casing may vary.
    pub fn matches_ignore_case(&self, other: &CertificateHashData) -> bool {
        self.hash_algorithm == other.hash_algorithm
            && self
                .issuer_name_hash
                .eq_ignore_ascii_case(&other.issuer_name_hash)
            && self
                .issuer_key_hash
                .eq_ignore_ascii_case(&other.issuer_key_hash)
            && self
                .serial_number
                .eq_ignore_ascii_case(&other.serial_number)
    }

    /// All three identity fields are present.
    pub fn is_complete(&self) -> bool {
        !self.issuer_name_hash.is_empty()
            && !self.issuer_key_hash.is_empty()
            && !self.serial_number.is_empty()
    }
}

/// Hash data of one chain: the head certificate plus its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHashDataChain {
    pub certificate_type: CertificateType,
    pub certificate_hash_data: CertificateHashData,
    pub child_certificate_hash_data: Vec<CertificateHashData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetInstalledCertificatesResult {
    pub status: GetInstalledCertificatesStatus,
    pub certificate_hash_data_chain: Vec<CertificateHashDataChain>,
}

/// Data required to issue one OCSP request to a responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcspRequestData {
    pub certificate_hash_data: Option<CertificateHashData>,
    pub responder_url: Option<String>,
}

/// Cached OCSP response location for one chain member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOcsp {
    pub hash: Option<CertificateHashData>,
    pub ocsp_path: Option<PathBuf>,
}

/// Filesystem locations of a selected leaf certificate and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Path of the private key paired with the leaf.
    pub key: PathBuf,
    /// Path of the full chain file, when one was installed.
    pub certificate: Option<PathBuf>,
    /// Path of the single-leaf file, when one was installed.
    pub certificate_single: Option<PathBuf>,
    /// Number of certificates in the chain file, 1 for a single leaf.
    pub certificate_count: usize,
    /// Password for the private key when it is stored encrypted.
    pub password: Option<String>,
    /// Ordered OCSP cache entries, following the chain file order.
    pub ocsp: Vec<CertificateOcsp>,
    /// PEM of the chain's root, when requested.
    pub certificate_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateInfoResult {
    pub status: GetCertificateInfoStatus,
    pub info: Option<CertificateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateFullInfoResult {
    pub status: GetCertificateInfoStatus,
    pub info: Vec<CertificateInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_data_equality_is_exact() {
        let a = CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: "aa11".to_string(),
            issuer_key_hash: "bb22".to_string(),
            serial_number: "1f".to_string(),
        };
        let mut b = a.clone();
        assert_eq!(a, b);

        b.issuer_name_hash = "AA11".to_string();
        assert_ne!(a, b);
        assert!(a.matches_ignore_case(&b));
    }

    #[test]
    fn leaf_role_maps_to_its_pki() {
        assert_eq!(
            LeafCertificateType::V2g.ca_certificate_type(),
            CaCertificateType::V2g
        );
        assert_eq!(
            LeafCertificateType::Csms.ca_certificate_type(),
            CaCertificateType::Csms
        );
    }

    #[test]
    fn role_display_matches_wire_names() {
        assert_eq!(CaCertificateType::V2g.to_string(), "V2G");
        assert_eq!(
            CertificateType::V2gCertificateChain.to_string(),
            "V2GCertificateChain"
        );
        assert_eq!(HashAlgorithm::Sha256.to_string(), "SHA256");
    }
}
