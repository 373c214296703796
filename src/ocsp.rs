//! OCSP side-car storage and request-data generation.
//!
//! A cached OCSP response lives next to the certificate it belongs to, in
//! an `ocsp/` folder holding `<name>.hash` / `<name>.der` pairs. The hash
//! file carries the issuer-scoped hash data that identifies the exact
//! certificate; the DER file carries the raw responder answer.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::fs_utils;
use crate::types::{
    CaCertificateType, CertificateHashData, OcspRequestData, CERT_HASH_EXTENSION, DER_EXTENSION,
};
use crate::x509_bundle::CertificateBundle;
use crate::x509_hierarchy::CertificateHierarchy;
use crate::x509_wrapper::Certificate;

/// Side-car folder for a certificate residing in `file`'s directory.
fn ocsp_dir_of(file: &Path) -> PathBuf {
    file.parent().unwrap_or_else(|| Path::new("")).join("ocsp")
}

/// Locate the cached `(hash file, DER file)` pair for the certificate and
/// the given hash data, when one exists.
pub fn ocsp_data_of_certificate(
    certificate: &Certificate,
    hash: &CertificateHashData,
) -> Option<(PathBuf, PathBuf)> {
    let file = certificate.file()?;
    let ocsp_dir = ocsp_dir_of(file);

    if !ocsp_dir.exists() {
        return None;
    }

    let entries = match fs::read_dir(&ocsp_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Could not iterate over ocsp cache: {e}");
            return None;
        }
    };

    for entry in entries.flatten() {
        let hash_path = entry.path();
        if !hash_path.is_file() {
            continue;
        }

        let Some(read_hash) = fs_utils::read_hash_from_file(&hash_path) else {
            continue;
        };

        if read_hash == *hash {
            debug!(
                "OCSP certificate hash found for certificate: {}",
                certificate.common_name()
            );

            let mut data_path = hash_path.clone();
            data_path.set_extension(DER_EXTENSION);

            if !data_path.exists() {
                error!(
                    "OCSP certificate hash found at path: {} but no data named: {} present",
                    hash_path.display(),
                    data_path.display()
                );
                return None;
            }

            return Some((hash_path, data_path));
        }
    }

    None
}

/// Attach an OCSP response to the certificate. An existing entry for the
/// same hash is overwritten in place; otherwise a fresh randomized pair
/// is created.
pub fn write_ocsp_response(
    certificate: &Certificate,
    hash: &CertificateHashData,
    ocsp_response: &str,
) -> Result<()> {
    let Some(file) = certificate.file() else {
        error!("Could not find OCSP cache directory, certificate has no file");
        return Ok(());
    };

    let ocsp_dir = ocsp_dir_of(file);
    if !ocsp_dir.exists() {
        fs::create_dir_all(&ocsp_dir)?;
    }

    if let Some((_, data_path)) = ocsp_data_of_certificate(certificate, hash) {
        debug!("OCSP certificate hash already found, over-writing");
        fs_utils::write_to_file(&data_path, ocsp_response.as_bytes())?;
        return Ok(());
    }

    // Randomized basename, multiple responses can live in one side-car
    let name = fs_utils::random_file_name("_ocsp");
    let data_path = ocsp_dir.join(format!("{name}.{DER_EXTENSION}"));
    let hash_path = ocsp_dir.join(format!("{name}.{CERT_HASH_EXTENSION}"));

    fs_utils::write_to_file(&data_path, ocsp_response.as_bytes())?;
    fs_utils::write_hash_to_file(&hash_path, hash)?;

    debug!(
        "OCSP certificate hash not found, written at path: {}",
        data_path.display()
    );
    Ok(())
}

/// Build the OCSP request list for a received leaf chain: for every chain
/// member that links below a valid root from the candidate PKIs and
/// carries a responder URL, one entry with its issuer-scoped hash.
/// Ordered leaf first.
pub fn generate_ocsp_request_data(
    ca_bundle_paths: &BTreeMap<CaCertificateType, PathBuf>,
    possible_roots: &[CaCertificateType],
    leaf_chain: &[Certificate],
) -> Vec<OcspRequestData> {
    if leaf_chain.is_empty() {
        return Vec::new();
    }

    let mut full_root_hierarchy = Vec::new();
    for root_type in possible_roots {
        let Some(root_path) = ca_bundle_paths.get(root_type) else {
            continue;
        };

        match CertificateBundle::from_path(root_path) {
            Ok(bundle) => full_root_hierarchy.extend(bundle.split()),
            Err(e) => warn!("Could not load root bundle {}: {e}", root_path.display()),
        }
    }

    let hierarchy =
        match CertificateHierarchy::build_with_leaves(full_root_hierarchy, leaf_chain.to_vec()) {
            Ok(hierarchy) => hierarchy,
            Err(e) => {
                error!("Could not build hierarchy for ocsp request data: {e}");
                return Vec::new();
            }
        };

    let mut request_data: Vec<OcspRequestData> = Vec::new();

    for root in hierarchy.roots() {
        if !root.certificate.is_self_signed() || !root.certificate.is_valid() {
            continue;
        }

        // Root, then sub CAs, then the leaf
        let descendants = hierarchy.collect_descendants(&root.certificate);
        if descendants.is_empty() {
            continue;
        }

        // The full received chain must link below this root
        let missing_link = leaf_chain
            .iter()
            .any(|link| !descendants.contains(link));
        if missing_link {
            continue;
        }

        for certificate in descendants.iter().rev() {
            let responder_url = certificate.responder_url();
            if responder_url.is_empty() {
                warn!(
                    "When generating an OCSP request, could not find responder URL for certificate: {}",
                    certificate.common_name()
                );
                continue;
            }

            match hierarchy.get_certificate_hash(certificate) {
                Ok(hash) => {
                    // The same sub CA can appear through multiple bundles
                    let contained = request_data
                        .iter()
                        .any(|existing| existing.certificate_hash_data.as_ref() == Some(&hash));

                    if !contained {
                        request_data.push(OcspRequestData {
                            certificate_hash_data: Some(hash),
                            responder_url: Some(responder_url),
                        });
                    }
                }
                Err(_) => error!(
                    "Could not find hash for certificate: {}",
                    certificate.common_name()
                ),
            }
        }
    }

    request_data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_leaf_with_responder, generate_root};
    use crate::types::{EncodingFormat, HashAlgorithm};

    fn cert(pem: &str) -> Certificate {
        Certificate::from_data(pem.as_bytes(), EncodingFormat::Pem).expect("parse")
    }

    #[test]
    fn side_car_write_and_find() {
        let dir = tempfile::tempdir().expect("tempdir");

        let root = generate_root("Root", -3600, 86400);
        let subca = root.issue_intermediate_with_responder(
            "Sub",
            -3600,
            86400,
            "http://ocsp.example.com",
        );

        let cert_file = dir.path().join("sub.pem");
        std::fs::write(&cert_file, subca.pem()).expect("write");

        let mut subca_cert = cert(&subca.pem());
        subca_cert.set_file(cert_file).unwrap();
        let hash = subca_cert
            .certificate_hash_data_with_issuer(&cert(&root.pem()))
            .expect("hash");

        write_ocsp_response(&subca_cert, &hash, "RESPONSE-1").expect("write response");

        let (hash_path, data_path) =
            ocsp_data_of_certificate(&subca_cert, &hash).expect("pair found");
        assert!(hash_path.starts_with(dir.path().join("ocsp")));
        assert_eq!(std::fs::read(&data_path).unwrap(), b"RESPONSE-1");

        // A second write for the same hash overwrites in place
        write_ocsp_response(&subca_cert, &hash, "RESPONSE-2").expect("overwrite");
        let (_, data_path_2) = ocsp_data_of_certificate(&subca_cert, &hash).expect("pair found");
        assert_eq!(data_path_2, data_path);
        assert_eq!(std::fs::read(&data_path_2).unwrap(), b"RESPONSE-2");
    }

    #[test]
    fn unknown_hash_finds_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");

        let root = generate_root("Root", -3600, 86400);
        let cert_file = dir.path().join("root.pem");
        std::fs::write(&cert_file, root.pem()).expect("write");

        let mut root_cert = cert(&root.pem());
        root_cert.set_file(cert_file).unwrap();

        let unknown = CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: "0".repeat(64),
            issuer_key_hash: "1".repeat(64),
            serial_number: "2a".to_string(),
        };

        assert!(ocsp_data_of_certificate(&root_cert, &unknown).is_none());
    }

    #[test]
    fn request_data_follows_the_chain_leaf_first() {
        let dir = tempfile::tempdir().expect("tempdir");

        let root = generate_root("Root", -3600, 86400 * 365);
        let subca = root.issue_intermediate_with_responder(
            "Sub",
            -3600,
            86400 * 180,
            "http://ocsp.sub.example.com",
        );
        let leaf = generate_leaf_with_responder(
            &subca,
            "Leaf",
            -3600,
            86400 * 30,
            "http://ocsp.leaf.example.com",
        );

        let bundle_path = dir.path().join("V2G_ROOT.pem");
        std::fs::write(&bundle_path, root.pem()).expect("write root");

        let mut ca_bundle_paths = BTreeMap::new();
        ca_bundle_paths.insert(CaCertificateType::V2g, bundle_path);

        let leaf_chain = vec![cert(&leaf.pem()), cert(&subca.pem())];
        let request_data = generate_ocsp_request_data(
            &ca_bundle_paths,
            &[CaCertificateType::V2g],
            &leaf_chain,
        );

        // Leaf first, then the sub CA; the root has no responder URL
        assert_eq!(request_data.len(), 2);
        assert_eq!(
            request_data[0].responder_url.as_deref(),
            Some("http://ocsp.leaf.example.com")
        );
        assert_eq!(
            request_data[1].responder_url.as_deref(),
            Some("http://ocsp.sub.example.com")
        );

        let leaf_hash = request_data[0]
            .certificate_hash_data
            .as_ref()
            .expect("leaf hash");
        assert_eq!(
            leaf_hash.issuer_key_hash,
            cert(&subca.pem()).key_hash().unwrap()
        );
    }

    #[test]
    fn request_data_requires_a_linked_valid_root() {
        let dir = tempfile::tempdir().expect("tempdir");

        let root = generate_root("Root", -3600, 86400 * 365);
        let other_root = generate_root("Other Root", -3600, 86400 * 365);
        let subca = root.issue_intermediate_with_responder(
            "Sub",
            -3600,
            86400 * 180,
            "http://ocsp.sub.example.com",
        );
        let leaf = generate_leaf_with_responder(
            &subca,
            "Leaf",
            -3600,
            86400 * 30,
            "http://ocsp.leaf.example.com",
        );

        // Only an unrelated root is installed
        let bundle_path = dir.path().join("V2G_ROOT.pem");
        std::fs::write(&bundle_path, other_root.pem()).expect("write root");

        let mut ca_bundle_paths = BTreeMap::new();
        ca_bundle_paths.insert(CaCertificateType::V2g, bundle_path);

        let leaf_chain = vec![cert(&leaf.pem()), cert(&subca.pem())];
        let request_data = generate_ocsp_request_data(
            &ca_bundle_paths,
            &[CaCertificateType::V2g],
            &leaf_chain,
        );

        assert!(request_data.is_empty());
    }
}
