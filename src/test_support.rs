//! Test-only certificate factory. Generates small CA hierarchies with
//! arbitrary validity windows so store behavior around expiry and
//! rotation can be exercised without fixture files.

use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Extension, X509Name, X509};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// A generated certificate together with its private key.
pub struct TestCa {
    pub certificate: X509,
    pub key: PKey<Private>,
}

enum CertKind {
    Root,
    Intermediate,
    Leaf,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as i64
}

fn subject(common_name: &str) -> X509Name {
    let mut builder = X509Name::builder().expect("name builder");
    builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .expect("set CN");
    builder
        .append_entry_by_nid(Nid::ORGANIZATIONNAME, "Test PKI")
        .expect("set O");
    builder.build()
}

/// Build one certificate. `valid_in`/`valid_to` are second offsets from
/// now; negative offsets lie in the past.
fn generate(
    common_name: &str,
    valid_in: i64,
    valid_to: i64,
    kind: CertKind,
    issuer: Option<&TestCa>,
    responder_url: Option<&str>,
) -> TestCa {
    let key = {
        let group = openssl::ec::EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
            .expect("P-256 group");
        let ec = openssl::ec::EcKey::generate(&group).expect("key generation");
        PKey::from_ec_key(ec).expect("key wrap")
    };

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(X509_VERSION_3).expect("set version");

    // Random 128-bit serial
    let mut serial = BigNum::new().expect("bignum");
    serial
        .rand(128, MsbOption::MAYBE_ZERO, false)
        .expect("serial rand");
    let serial = serial.to_asn1_integer().expect("serial asn1");
    builder.set_serial_number(&serial).expect("set serial");

    let name = subject(common_name);
    builder.set_subject_name(&name).expect("set subject");

    match issuer {
        Some(ca) => builder
            .set_issuer_name(ca.certificate.subject_name())
            .expect("set issuer"),
        None => builder.set_issuer_name(&name).expect("set issuer"),
    }

    let not_before = Asn1Time::from_unix(now_unix() + valid_in).expect("not before");
    let not_after = Asn1Time::from_unix(now_unix() + valid_to).expect("not after");
    builder.set_not_before(&not_before).expect("set not before");
    builder.set_not_after(&not_after).expect("set not after");

    builder.set_pubkey(&key).expect("set pubkey");

    match kind {
        CertKind::Root | CertKind::Intermediate => {
            let bc = BasicConstraints::new()
                .critical()
                .ca()
                .build()
                .expect("basic constraints");
            builder.append_extension(bc).expect("append bc");
            let ku = KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .expect("key usage");
            builder.append_extension(ku).expect("append ku");
        }
        CertKind::Leaf => {
            let bc = BasicConstraints::new()
                .critical()
                .build()
                .expect("basic constraints");
            builder.append_extension(bc).expect("append bc");
            let ku = KeyUsage::new()
                .digital_signature()
                .key_agreement()
                .build()
                .expect("key usage");
            builder.append_extension(ku).expect("append ku");
        }
    }

    if let Some(url) = responder_url {
        #[allow(deprecated)]
        let aia = X509Extension::new_nid(
            None,
            None,
            Nid::INFO_ACCESS,
            &format!("OCSP;URI:{url}"),
        )
        .expect("aia extension");
        builder.append_extension(aia).expect("append aia");
    }

    let signing_key = issuer.map(|ca| &ca.key).unwrap_or(&key);
    builder
        .sign(signing_key, MessageDigest::sha256())
        .expect("sign");

    TestCa {
        certificate: builder.build(),
        key,
    }
}

/// Self-signed CA root.
pub fn generate_root(common_name: &str, valid_in: i64, valid_to: i64) -> TestCa {
    generate(common_name, valid_in, valid_to, CertKind::Root, None, None)
}

/// End-entity certificate signed by `issuer`.
pub fn generate_leaf(issuer: &TestCa, common_name: &str, valid_in: i64, valid_to: i64) -> TestCa {
    generate(
        common_name,
        valid_in,
        valid_to,
        CertKind::Leaf,
        Some(issuer),
        None,
    )
}

/// End-entity certificate carrying an OCSP responder URL.
pub fn generate_leaf_with_responder(
    issuer: &TestCa,
    common_name: &str,
    valid_in: i64,
    valid_to: i64,
    responder: &str,
) -> TestCa {
    generate(
        common_name,
        valid_in,
        valid_to,
        CertKind::Leaf,
        Some(issuer),
        Some(responder),
    )
}

/// Issue an end-entity certificate for an externally generated public
/// key, e.g. one carried by a certificate signing request.
pub fn issue_leaf_for_public_key(
    issuer: &TestCa,
    common_name: &str,
    valid_in: i64,
    valid_to: i64,
    public_key: &openssl::pkey::PKeyRef<openssl::pkey::Public>,
) -> X509 {
    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(X509_VERSION_3).expect("set version");

    let mut serial = BigNum::new().expect("bignum");
    serial
        .rand(128, MsbOption::MAYBE_ZERO, false)
        .expect("serial rand");
    let serial = serial.to_asn1_integer().expect("serial asn1");
    builder.set_serial_number(&serial).expect("set serial");

    builder
        .set_subject_name(&subject(common_name))
        .expect("set subject");
    builder
        .set_issuer_name(issuer.certificate.subject_name())
        .expect("set issuer");

    let not_before = Asn1Time::from_unix(now_unix() + valid_in).expect("not before");
    let not_after = Asn1Time::from_unix(now_unix() + valid_to).expect("not after");
    builder.set_not_before(&not_before).expect("set not before");
    builder.set_not_after(&not_after).expect("set not after");

    builder.set_pubkey(public_key).expect("set pubkey");

    let bc = BasicConstraints::new()
        .critical()
        .build()
        .expect("basic constraints");
    builder.append_extension(bc).expect("append bc");
    let ku = KeyUsage::new()
        .digital_signature()
        .key_agreement()
        .build()
        .expect("key usage");
    builder.append_extension(ku).expect("append ku");

    builder
        .sign(&issuer.key, MessageDigest::sha256())
        .expect("sign");

    builder.build()
}

impl TestCa {
    /// Issue a subordinate CA under this certificate.
    pub fn issue_intermediate(&self, common_name: &str, valid_in: i64, valid_to: i64) -> TestCa {
        generate(
            common_name,
            valid_in,
            valid_to,
            CertKind::Intermediate,
            Some(self),
            None,
        )
    }

    /// Issue a subordinate CA that carries an OCSP responder URL.
    pub fn issue_intermediate_with_responder(
        &self,
        common_name: &str,
        valid_in: i64,
        valid_to: i64,
        responder: &str,
    ) -> TestCa {
        generate(
            common_name,
            valid_in,
            valid_to,
            CertKind::Intermediate,
            Some(self),
            Some(responder),
        )
    }

    /// PEM rendering of the certificate.
    pub fn pem(&self) -> String {
        String::from_utf8(self.certificate.to_pem().expect("pem export")).expect("utf8 pem")
    }

    /// PKCS#8 PEM rendering of the private key.
    pub fn key_pem(&self) -> String {
        String::from_utf8(self.key.private_key_to_pem_pkcs8().expect("key export"))
            .expect("utf8 key")
    }
}
