//! OpenSSL-backed cryptographic primitives.
//!
//! Everything the store needs from the crypto library goes through this
//! module: certificate parsing, issuer checks, the SHA-256 hashes that
//! make up certificate hash data, store-based chain verification, private
//! key pairing, key generation and PKCS#10 CSR generation.

use std::fs;
use std::io::Read;
use std::path::Path;

use foreign_types::ForeignTypeRef;
use openssl::asn1::Asn1Time;
use openssl::base64;
use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509Ref, X509ReqBuilder, X509StoreContext, X509VerifyResult, X509};
use openssl_sys as ffi;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{CertificateKeyUsage, CertificateValidationResult, EncodingFormat};

/// Optional SubjectAlternativeName DNS entry added to generated CSRs.
pub const CSR_DNS_NAME: Option<&str> = None;
/// Optional SubjectAlternativeName IP entry added to generated CSRs.
pub const CSR_IP_ADDRESS: Option<&str> = None;

/// Fine-grained CSR generation failure, preserved in logs. The store
/// exposes only the coarse outward codes.
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("private key generation failed: {0}")]
    KeyGeneration(String),
    #[error("could not set request version")]
    Versioning,
    #[error("could not set request public key")]
    Pubkey,
    #[error("could not build request extensions")]
    Extensions,
    #[error("could not sign request")]
    Signing,
    #[error("csr generation failed: {0}")]
    Unknown(String),
}

/// Parameters of the private key backing a CSR.
#[derive(Debug, Clone)]
pub struct KeyGenerationInfo {
    /// Where the generated private key is written.
    pub private_key_file: std::path::PathBuf,
    /// Passphrase for PKCS#8 encryption of the written key.
    pub private_key_pass: Option<String>,
    /// Key material is handed off to a custom provider (e.g. a TPM).
    pub generate_on_custom: bool,
}

/// Everything needed to generate a PKCS#10 certificate signing request.
#[derive(Debug, Clone)]
pub struct CertificateSigningRequestInfo {
    pub n_version: i32,
    pub country: String,
    pub organization: String,
    pub common_name: String,
    pub dns_name: Option<String>,
    pub ip_address: Option<String>,
    pub key_info: KeyGenerationInfo,
}

/// Load one or more certificates from raw data. PEM data may hold any
/// number of concatenated blocks; DER holds exactly one certificate.
pub fn load_certificates(data: &[u8], encoding: EncodingFormat) -> Result<Vec<X509>> {
    match encoding {
        EncodingFormat::Pem => X509::stack_from_pem(data)
            .map_err(|e| Error::CertificateLoad(format!("invalid PEM data: {e}"))),
        EncodingFormat::Der => {
            let certificate = X509::from_der(data)
                .map_err(|e| Error::CertificateLoad(format!("invalid DER data: {e}")))?;
            Ok(vec![certificate])
        }
    }
}

/// Seconds from now until the certificate becomes valid and until it
/// expires. Either value is negative when the boundary lies in the past.
pub fn validity_window(certificate: &X509Ref) -> Result<(i64, i64)> {
    let now = Asn1Time::days_from_now(0)?;

    let to_not_before = now.diff(certificate.not_before())?;
    let to_not_after = now.diff(certificate.not_after())?;

    Ok((
        i64::from(to_not_before.days) * 86400 + i64::from(to_not_before.secs),
        i64::from(to_not_after.days) * 86400 + i64::from(to_not_after.secs),
    ))
}

/// DER-level equality, the cryptographic identity of a certificate.
pub fn x509_equal(a: &X509Ref, b: &X509Ref) -> bool {
    match (a.to_der(), b.to_der()) {
        (Ok(der_a), Ok(der_b)) => der_a == der_b,
        _ => false,
    }
}

/// The certificate signed itself: issuer matches subject and the
/// signature verifies with its own public key.
pub fn is_self_signed(certificate: &X509Ref) -> bool {
    if certificate.issued(certificate) != X509VerifyResult::OK {
        return false;
    }

    match certificate.public_key() {
        Ok(key) => certificate.verify(&key).unwrap_or(false),
        Err(_) => false,
    }
}

/// `child` was issued and signed by `parent`. False when both are the
/// same certificate; self-issuance is covered by [`is_self_signed`].
pub fn is_child(child: &X509Ref, parent: &X509Ref) -> bool {
    if x509_equal(child, parent) {
        return false;
    }

    if parent.issued(child) != X509VerifyResult::OK {
        return false;
    }

    match parent.public_key() {
        Ok(key) => child.verify(&key).unwrap_or(false),
        Err(_) => false,
    }
}

/// Common name of the certificate subject, empty when absent.
pub fn common_name(certificate: &X509Ref) -> String {
    certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|data| data.to_string())
        .unwrap_or_default()
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// SHA-256 over the DER encoded issuer distinguished name.
pub fn issuer_name_hash(certificate: &X509Ref) -> Result<String> {
    Ok(sha256_hex(&certificate.issuer_name().to_der()?))
}

/// SHA-256 over the certificate's subject public key material: the
/// content of the subjectPublicKey BIT STRING (PKCS#1 for RSA keys, the
/// uncompressed point for EC keys).
pub fn key_hash(certificate: &X509Ref) -> Result<String> {
    let public_key = certificate.public_key()?;

    let key_material = match public_key.id() {
        Id::RSA => public_key.rsa()?.public_key_to_der_pkcs1()?,
        Id::EC => {
            let ec_key = public_key.ec_key()?;
            let mut ctx = BigNumContext::new()?;
            ec_key.public_key().to_bytes(
                ec_key.group(),
                PointConversionForm::UNCOMPRESSED,
                &mut ctx,
            )?
        }
        _ => public_key.public_key_to_der()?,
    };

    Ok(sha256_hex(&key_material))
}

/// Serial number as lowercase hex without leading zeroes.
pub fn serial_number(certificate: &X509Ref) -> Result<String> {
    let serial = certificate.serial_number().to_bn()?.to_hex_str()?;
    let serial = serial.to_lowercase();

    let trimmed = serial.trim_start_matches('0');
    if trimmed.is_empty() {
        // A zero serial still renders as one digit
        return Ok("0".to_string());
    }

    Ok(trimmed.to_string())
}

/// OCSP responder URL from the AuthorityInfoAccess extension, empty when
/// the certificate carries none.
pub fn responder_url(certificate: &X509Ref) -> String {
    let mut url = String::new();

    if let Some(access) = certificate.authority_info() {
        for description in &access {
            if description.method().nid() == Nid::AD_OCSP {
                if let Some(uri) = description.location().uri() {
                    url.push_str(uri);
                }
            }
        }
    }

    if url.is_empty() {
        debug!("Could not retrieve OCSP responder URL from certificate");
    }

    url
}

/// KeyUsage bits of the certificate, empty when the extension is absent.
pub fn key_usage(certificate: &X509Ref) -> Vec<CertificateKeyUsage> {
    // The high-level crate does not expose the keyUsage BIT STRING, fetch
    // it through the extension decoder.
    let bits: Vec<u8> = unsafe {
        let ext = ffi::X509_get_ext_d2i(
            certificate.as_ptr(),
            ffi::NID_key_usage,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        if ext.is_null() {
            return Vec::new();
        }

        let bit_string = ext as *mut ffi::ASN1_STRING;
        let data = ffi::ASN1_STRING_get0_data(bit_string);
        let len = ffi::ASN1_STRING_length(bit_string) as usize;
        let copied = std::slice::from_raw_parts(data, len).to_vec();
        ffi::ASN1_STRING_free(bit_string);
        copied
    };

    let bit_set = |index: usize| -> bool {
        bits.get(index / 8)
            .is_some_and(|byte| byte & (0x80u8 >> (index % 8)) != 0)
    };

    const FLAGS: [CertificateKeyUsage; 9] = [
        CertificateKeyUsage::DigitalSignature,
        CertificateKeyUsage::NonRepudiation,
        CertificateKeyUsage::KeyEncipherment,
        CertificateKeyUsage::DataEncipherment,
        CertificateKeyUsage::KeyAgreement,
        CertificateKeyUsage::KeyCertSign,
        CertificateKeyUsage::CrlSign,
        CertificateKeyUsage::EncipherOnly,
        CertificateKeyUsage::DecipherOnly,
    ];

    FLAGS
        .iter()
        .enumerate()
        .filter(|(index, _)| bit_set(*index))
        .map(|(_, flag)| *flag)
        .collect()
}

fn map_verify_error(error: X509VerifyResult) -> CertificateValidationResult {
    match error.as_raw() {
        ffi::X509_V_ERR_CERT_HAS_EXPIRED => CertificateValidationResult::Expired,
        ffi::X509_V_ERR_CERT_SIGNATURE_FAILURE => CertificateValidationResult::InvalidSignature,
        ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT
        | ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY => {
            CertificateValidationResult::IssuerNotFound
        }
        ffi::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE => {
            CertificateValidationResult::InvalidLeafSignature
        }
        ffi::X509_V_ERR_CERT_CHAIN_TOO_LONG | ffi::X509_V_ERR_CERT_UNTRUSTED => {
            CertificateValidationResult::InvalidChain
        }
        _ => {
            warn!("Certificate verification failed: {}", error.error_string());
            CertificateValidationResult::Unknown
        }
    }
}

/// Verify `target` against the trusted anchors, with the given untrusted
/// intermediates available for chain building. `dir_path`/`file_path`
/// optionally contribute additional lookup locations to the trust store.
///
/// With `allow_future_certificates` an already-expired target is rejected
/// up front and time checks are then disabled, so not-yet-valid chains
/// verify.
pub fn verify_certificate_chain(
    target: &X509Ref,
    trusted: &[X509],
    untrusted: &[X509],
    allow_future_certificates: bool,
    dir_path: Option<&Path>,
    file_path: Option<&Path>,
) -> CertificateValidationResult {
    let verified = (|| -> Result<CertificateValidationResult> {
        let mut store_builder = X509StoreBuilder::new()?;
        for certificate in trusted {
            store_builder.add_cert(certificate.clone())?;
        }

        if let Some(dir) = dir_path {
            let lookup = store_builder.add_lookup(openssl::x509::store::X509Lookup::hash_dir())?;
            lookup.add_dir(&dir.to_string_lossy(), openssl::ssl::SslFiletype::PEM)?;
        }

        if let Some(file) = file_path {
            let data = fs::read(file)?;
            for certificate in load_certificates(&data, EncodingFormat::Pem)? {
                store_builder.add_cert(certificate)?;
            }
        }

        if allow_future_certificates {
            let (_, valid_to) = validity_window(target)?;
            if valid_to < 0 {
                return Ok(CertificateValidationResult::Expired);
            }
            // Not expired, but possibly not yet valid: skip time checks
            store_builder.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
        }

        let store = store_builder.build();

        let mut chain = Stack::new()?;
        for certificate in untrusted {
            chain.push(certificate.clone())?;
        }

        let mut context = X509StoreContext::new()?;
        let outcome = context.init(&store, target, &chain, |ctx| {
            match ctx.verify_cert() {
                Ok(true) => Ok(CertificateValidationResult::Valid),
                Ok(false) => Ok(map_verify_error(ctx.error())),
                Err(e) => {
                    warn!("Certificate chain verification errored: {e}");
                    Ok(CertificateValidationResult::Unknown)
                }
            }
        })?;

        Ok(outcome)
    })();

    match verified {
        Ok(result) => result,
        Err(e) => {
            warn!("Could not set up certificate chain verification: {e}");
            CertificateValidationResult::Unknown
        }
    }
}

/// The PEM private key pairs with the certificate's public key. An
/// undecryptable or unparsable key is reported as a mismatch.
pub fn check_private_key(
    certificate: &X509Ref,
    private_key_pem: &[u8],
    password: Option<&str>,
) -> bool {
    let key = match PKey::private_key_from_pem_passphrase(
        private_key_pem,
        password.unwrap_or("").as_bytes(),
    ) {
        Ok(key) => key,
        Err(e) => {
            debug!("Could not load private key, password configured correctly? {e}");
            return false;
        }
    };

    match certificate.public_key() {
        Ok(public_key) => public_key.public_eq(&key),
        Err(e) => {
            debug!("Could not extract certificate public key: {e}");
            false
        }
    }
}

/// Verify a detached SHA-256 signature over the file at `path` with the
/// certificate's public key. Reads the file in chunks.
pub fn verify_file_signature(
    certificate: &X509Ref,
    signature: &[u8],
    path: &Path,
) -> Result<bool> {
    let public_key = certificate.public_key()?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)?;

    let mut file = fs::File::open(path)?;
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        verifier.update(&buffer[..read])?;
    }

    Ok(verifier.verify(signature)?)
}

/// Generate a fresh NIST P-256 key pair.
pub fn generate_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let ec_key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(ec_key)?)
}

fn export_private_key(key: &PKeyRef<Private>, info: &KeyGenerationInfo) -> Result<()> {
    let pem = match info.private_key_pass.as_deref() {
        Some(pass) if !info.generate_on_custom => {
            key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pass.as_bytes())?
        }
        _ => key.private_key_to_pem_pkcs8()?,
    };

    {
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&info.private_key_file)?;
        std::io::Write::write_all(&mut file, &pem)?;
    }

    Ok(())
}

/// Generate a private key and a PKCS#10 certificate signing request. The
/// key is written to `info.key_info.private_key_file`; the PEM encoded
/// request is returned.
pub fn generate_csr(info: &CertificateSigningRequestInfo) -> std::result::Result<String, CsrError> {
    let key = generate_key().map_err(|e| CsrError::KeyGeneration(e.to_string()))?;
    export_private_key(&key, &info.key_info).map_err(|e| CsrError::KeyGeneration(e.to_string()))?;

    let mut request = X509ReqBuilder::new().map_err(|e| CsrError::Unknown(e.to_string()))?;

    request
        .set_version(info.n_version)
        .map_err(|_| CsrError::Versioning)?;
    request.set_pubkey(&key).map_err(|_| CsrError::Pubkey)?;

    let subject = (|| -> Result<openssl::x509::X509Name> {
        let mut name = openssl::x509::X509NameBuilder::new()?;
        name.append_entry_by_text("C", &info.country)?;
        name.append_entry_by_text("O", &info.organization)?;
        name.append_entry_by_text("CN", &info.common_name)?;
        name.append_entry_by_text("DC", "CPO")?;
        Ok(name.build())
    })()
    .map_err(|e| CsrError::Unknown(e.to_string()))?;

    request
        .set_subject_name(&subject)
        .map_err(|e| CsrError::Unknown(e.to_string()))?;

    (|| -> Result<()> {
        let mut extensions = Stack::new()?;
        extensions.push(
            KeyUsage::new()
                .digital_signature()
                .key_agreement()
                .build()?,
        )?;
        extensions.push(BasicConstraints::new().critical().build()?)?;

        if info.dns_name.is_some() || info.ip_address.is_some() {
            let mut san = SubjectAlternativeName::new();
            if let Some(dns) = info.dns_name.as_deref() {
                san.dns(dns);
            }
            if let Some(ip) = info.ip_address.as_deref() {
                san.ip(ip);
            }
            extensions.push(san.build(&request.x509v3_context(None))?)?;
        }

        request.add_extensions(&extensions)?;
        Ok(())
    })()
    .map_err(|_| CsrError::Extensions)?;

    request
        .sign(&key, MessageDigest::sha256())
        .map_err(|_| CsrError::Signing)?;

    let pem = request
        .build()
        .to_pem()
        .map_err(|e| CsrError::Unknown(e.to_string()))?;

    String::from_utf8(pem).map_err(|e| CsrError::Unknown(e.to_string()))
}

/// Decode base64 to raw bytes, empty on malformed input.
pub fn base64_decode_to_bytes(encoded: &str) -> Vec<u8> {
    base64::decode_block(encoded.trim()).unwrap_or_default()
}

/// Decode base64 to a string, empty on malformed or non-UTF-8 input.
pub fn base64_decode_to_string(encoded: &str) -> String {
    String::from_utf8(base64_decode_to_bytes(encoded)).unwrap_or_default()
}

/// Encode raw bytes as base64.
pub fn base64_encode_from_bytes(bytes: &[u8]) -> String {
    base64::encode_block(bytes)
}

/// Encode the raw bytes of a string as base64.
pub fn base64_encode_from_string(data: &str) -> String {
    base64::encode_block(data.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_leaf, generate_root, TestCa};

    #[test]
    fn self_signed_detection() {
        let root = generate_root("Test Root", -3600, 86400 * 365);
        assert!(is_self_signed(&root.certificate));

        let leaf = generate_leaf(&root, "Test Leaf", -3600, 86400 * 30);
        assert!(!is_self_signed(&leaf.certificate));
    }

    #[test]
    fn child_relation_matches_issuance() {
        let root = generate_root("Test Root", -3600, 86400 * 365);
        let other_root = generate_root("Other Root", -3600, 86400 * 365);
        let leaf = generate_leaf(&root, "Test Leaf", -3600, 86400 * 30);

        assert!(is_child(&leaf.certificate, &root.certificate));
        assert!(!is_child(&leaf.certificate, &other_root.certificate));
        assert!(!is_child(&root.certificate, &leaf.certificate));
        // A certificate is never its own child
        assert!(!is_child(&root.certificate, &root.certificate));
    }

    #[test]
    fn validity_window_signs() {
        let valid = generate_root("Valid", -3600, 86400);
        let (valid_in, valid_to) = validity_window(&valid.certificate).expect("window");
        assert!(valid_in < 0);
        assert!(valid_to > 0);

        let expired = generate_root("Expired", -7200, -3600);
        let (_, expired_to) = validity_window(&expired.certificate).expect("window");
        assert!(expired_to < 0);
    }

    #[test]
    fn serial_number_is_trimmed_lowercase_hex() {
        let root = generate_root("Serial", -3600, 86400);
        let serial = serial_number(&root.certificate).expect("serial");

        assert!(!serial.is_empty());
        assert!(!serial.starts_with('0') || serial == "0");
        assert!(serial.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(serial, serial.to_lowercase());
    }

    #[test]
    fn hashes_are_sha256_hex() {
        let root = generate_root("Hash", -3600, 86400);

        let name_hash = issuer_name_hash(&root.certificate).expect("name hash");
        let subject_key_hash = key_hash(&root.certificate).expect("key hash");

        assert_eq!(name_hash.len(), 64);
        assert_eq!(subject_key_hash.len(), 64);
    }

    #[test]
    fn private_key_pairing() {
        let root = generate_root("Keyed", -3600, 86400);
        let other = generate_root("Other", -3600, 86400);

        let key_pem = root
            .key
            .private_key_to_pem_pkcs8()
            .expect("key export");

        assert!(check_private_key(&root.certificate, &key_pem, None));
        assert!(!check_private_key(&other.certificate, &key_pem, None));
    }

    #[test]
    fn private_key_pairing_with_password() {
        let root = generate_root("Protected", -3600, 86400);
        let key_pem = root
            .key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), b"secret123")
            .expect("key export");

        assert!(check_private_key(&root.certificate, &key_pem, Some("secret123")));
        assert!(!check_private_key(&root.certificate, &key_pem, Some("wrong")));
    }

    #[test]
    fn chain_verification_against_root() {
        let root = generate_root("Chain Root", -3600, 86400 * 365);
        let subca = root.issue_intermediate("Chain Sub", -3600, 86400 * 180);
        let leaf = generate_leaf(&subca, "Chain Leaf", -3600, 86400 * 30);

        let trusted = vec![root.certificate.clone()];
        let untrusted = vec![subca.certificate.clone()];

        let result = verify_certificate_chain(
            &leaf.certificate,
            &trusted,
            &untrusted,
            true,
            None,
            None,
        );
        assert_eq!(result, CertificateValidationResult::Valid);

        // Without the intermediate the chain cannot be completed
        let result = verify_certificate_chain(&leaf.certificate, &trusted, &[], true, None, None);
        assert_ne!(result, CertificateValidationResult::Valid);
    }

    #[test]
    fn expired_leaf_is_rejected() {
        let root = generate_root("Chain Root", -86400 * 30, 86400 * 365);
        let leaf = generate_leaf(&root, "Old Leaf", -86400 * 20, -86400);

        let trusted = vec![root.certificate.clone()];
        let result = verify_certificate_chain(&leaf.certificate, &trusted, &[], true, None, None);
        assert_eq!(result, CertificateValidationResult::Expired);
    }

    #[test]
    fn future_leaf_is_accepted_with_flag() {
        let root = generate_root("Chain Root", -3600, 86400 * 365);
        let leaf = generate_leaf(&root, "Future Leaf", 86400, 86400 * 30);

        let trusted = vec![root.certificate.clone()];
        let result = verify_certificate_chain(&leaf.certificate, &trusted, &[], true, None, None);
        assert_eq!(result, CertificateValidationResult::Valid);
    }

    #[test]
    fn csr_generation_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("csr_test.key");

        let info = CertificateSigningRequestInfo {
            n_version: 0,
            country: "DE".to_string(),
            organization: "Example Org".to_string(),
            common_name: "charger-001".to_string(),
            dns_name: None,
            ip_address: None,
            key_info: KeyGenerationInfo {
                private_key_file: key_path.clone(),
                private_key_pass: None,
                generate_on_custom: false,
            },
        };

        let csr_pem = generate_csr(&info).expect("csr generation");
        assert!(csr_pem.contains("CERTIFICATE REQUEST"));
        assert!(key_path.exists());

        // The generated request parses back and carries the subject
        let request = openssl::x509::X509Req::from_pem(csr_pem.as_bytes()).expect("parse");
        let cn = request
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|d| d.to_string());
        assert_eq!(cn.as_deref(), Some("charger-001"));

        // The written key pairs with the request public key
        let key_pem = fs::read(&key_path).expect("key read");
        let key = PKey::private_key_from_pem(&key_pem).expect("key parse");
        assert!(request.verify(&key).expect("verify"));
    }

    #[test]
    fn file_signature_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file_path = dir.path().join("firmware.bin");
        fs::write(&file_path, b"firmware image contents").expect("write");

        let signer_ca: TestCa = generate_root("Signer", -3600, 86400);

        let mut signer =
            openssl::sign::Signer::new(MessageDigest::sha256(), &signer_ca.key).expect("signer");
        signer.update(b"firmware image contents").expect("update");
        let signature = signer.sign_to_vec().expect("sign");

        assert!(
            verify_file_signature(&signer_ca.certificate, &signature, &file_path)
                .expect("verify runs")
        );

        fs::write(&file_path, b"tampered contents").expect("write");
        assert!(
            !verify_file_signature(&signer_ca.certificate, &signature, &file_path)
                .expect("verify runs")
        );
    }

    #[test]
    fn base64_round_trip() {
        let encoded = base64_encode_from_bytes(b"ocsp response bytes");
        assert_eq!(base64_decode_to_bytes(&encoded), b"ocsp response bytes");
        assert_eq!(base64_decode_to_string(&encoded), "ocsp response bytes");
    }

    #[test]
    fn key_usage_reads_extension_bits() {
        let root = generate_root("Usage", -3600, 86400);
        let usage = key_usage(&root.certificate);

        // Roots are generated with certificate and CRL signing usage
        assert!(usage.contains(&CertificateKeyUsage::KeyCertSign));
        assert!(usage.contains(&CertificateKeyUsage::CrlSign));
    }
}
