//! The certificate store engine.
//!
//! [`CertificateStore`] owns all X.509 material of the station: the four
//! trust anchor bundles, the leaf certificate/key directories, the
//! exposed symlinks, the pending-CSR table and the garbage collector.
//! Every public operation serializes on one internal mutex, rebuilds the
//! in-memory model from disk, mutates it and synchronizes back before
//! returning. A worker thread runs the garbage collector periodically and
//! is stopped on drop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};

use crate::configs::{StoreConfig, DEFAULT_MINIMUM_CERTIFICATE_ENTRIES};
pub use crate::configs::{LeafDirectories, LinkPaths, StorePaths};
use crate::crypto::{self, CertificateSigningRequestInfo, CsrError, KeyGenerationInfo};
use crate::error::Error;
use crate::fs_utils;
use crate::ocsp;
use crate::types::{
    CaCertificateType, CertificateHashData, CertificateHashDataChain, CertificateInfo,
    CertificateOcsp, CertificateType, CertificateValidationResult, DeleteCertificateResult,
    DeleteResult, EncodingFormat, GetCertificateInfoResult, GetCertificateInfoStatus,
    GetCertificateFullInfoResult, GetCertificateSignRequestResult, GetCertificateSignRequestStatus,
    GetInstalledCertificatesResult, GetInstalledCertificatesStatus, InstallCertificateResult,
    LeafCertificateType, OcspRequestData, CUSTOM_KEY_EXTENSION, KEY_EXTENSION, PEM_EXTENSION,
};
use crate::x509_bundle::CertificateBundle;
use crate::x509_hierarchy::CertificateHierarchy;
use crate::x509_wrapper::Certificate;

fn to_install_certificate_result(result: CertificateValidationResult) -> InstallCertificateResult {
    match result {
        CertificateValidationResult::Valid => {
            info!("Certificate accepted");
            InstallCertificateResult::Accepted
        }
        CertificateValidationResult::Expired => {
            warn!("Certificate has expired");
            InstallCertificateResult::Expired
        }
        CertificateValidationResult::InvalidSignature => {
            warn!("Invalid signature");
            InstallCertificateResult::InvalidSignature
        }
        CertificateValidationResult::InvalidChain => {
            warn!("Invalid certificate chain");
            InstallCertificateResult::InvalidCertificateChain
        }
        CertificateValidationResult::InvalidLeafSignature => {
            warn!("Unable to verify leaf signature");
            InstallCertificateResult::InvalidSignature
        }
        CertificateValidationResult::IssuerNotFound => {
            warn!("Issuer not found");
            InstallCertificateResult::NoRootCertificateInstalled
        }
        _ => InstallCertificateResult::InvalidFormat,
    }
}

/// Search for the private key paired with the certificate: first by the
/// certificate's own file name with a key extension, then by scanning the
/// whole key directory.
fn private_key_path_of_certificate(
    certificate: &Certificate,
    key_directory: &Path,
    password: Option<&str>,
) -> Option<PathBuf> {
    if let Some(file) = certificate.file() {
        for extension in [KEY_EXTENSION, CUSTOM_KEY_EXTENSION] {
            let mut potential_keyfile = file.to_path_buf();
            potential_keyfile.set_extension(extension);

            if potential_keyfile.exists() {
                match fs_utils::read_from_file(&potential_keyfile) {
                    Ok(private_key) => {
                        if crypto::check_private_key(
                            certificate.x509(),
                            private_key.as_bytes(),
                            password,
                        ) {
                            debug!(
                                "Key found for certificate ({}) at path: {}",
                                certificate.common_name(),
                                potential_keyfile.display()
                            );
                            return Some(potential_keyfile);
                        }
                    }
                    Err(e) => debug!(
                        "Could not load private key at {}: {e}",
                        potential_keyfile.display()
                    ),
                }
            }
        }
    }

    let key_files = match fs_utils::enumerate_files(key_directory) {
        Ok(files) => files,
        Err(e) => {
            error!("Could not scan key directory {}: {e}", key_directory.display());
            return None;
        }
    };

    for key_file in key_files {
        if !fs_utils::is_keyfile(&key_file) {
            continue;
        }

        match fs_utils::read_from_file(&key_file) {
            Ok(private_key) => {
                if crypto::check_private_key(certificate.x509(), private_key.as_bytes(), password)
                {
                    debug!(
                        "Key found for certificate ({}) at path: {}",
                        certificate.common_name(),
                        key_file.display()
                    );
                    return Some(key_file);
                }
            }
            Err(e) => debug!("Could not load private key at {}: {e}", key_file.display()),
        }
    }

    error!(
        "Could not find private key for certificate ({}), key path: {}",
        certificate.common_name(),
        key_directory.display()
    );
    None
}

/// Search for the certificate files paired with the key: first the file
/// sharing the key's basename, then every bundle in the certificate
/// directory. A key can match multiple files when its leaf also resides
/// in a chain file.
fn certificate_paths_of_key(
    key: &Path,
    certificate_directory: &Path,
    password: Option<&str>,
) -> crate::error::Result<BTreeSet<PathBuf>> {
    let private_key = fs_utils::read_from_file(key).map_err(|_| {
        Error::NoPrivateKey(format!(
            "could not read private key from path: {}",
            key.display()
        ))
    })?;

    let mut candidate = key.to_path_buf();
    candidate.set_extension(PEM_EXTENSION);

    if candidate.exists() {
        match CertificateBundle::from_path(&candidate) {
            Ok(bundle) => {
                let mut matches = BTreeSet::new();
                bundle.for_each_chain(|file, chain| {
                    for certificate in chain {
                        if crypto::check_private_key(
                            certificate.x509(),
                            private_key.as_bytes(),
                            password,
                        ) {
                            matches.insert(file.to_path_buf());
                        }
                    }
                    true
                });

                if !matches.is_empty() {
                    return Ok(matches);
                }
            }
            Err(e) => debug!("Could not load certificate bundle at {}: {e}", candidate.display()),
        }
    }

    match CertificateBundle::from_path(certificate_directory) {
        Ok(bundle) => {
            let mut matches = BTreeSet::new();
            bundle.for_each_chain(|file, chain| {
                for certificate in chain {
                    if crypto::check_private_key(
                        certificate.x509(),
                        private_key.as_bytes(),
                        password,
                    ) {
                        matches.insert(file.to_path_buf());
                    }
                }
                true
            });

            if !matches.is_empty() {
                return Ok(matches);
            }
        }
        Err(e) => debug!(
            "Could not load certificate bundle at {}: {e}",
            certificate_directory.display()
        ),
    }

    Err(Error::NoCertificateValid(format!(
        "could not find certificate for private key: {} in: {}",
        key.display(),
        certificate_directory.display()
    )))
}

/// Point `link` at `target`, replacing a stale link. Returns true when the
/// filesystem changed.
fn update_symlink(link: &Path, target: &Path) -> bool {
    let mut changed = false;

    if link.is_symlink() {
        if fs::read_link(link).ok().as_deref() == Some(target) {
            return false;
        }
        if let Err(e) = fs::remove_file(link) {
            error!("Could not remove stale link {}: {e}", link.display());
            return false;
        }
        changed = true;
    }

    if !link.exists() {
        debug!("Link: {} -> {}", link.display(), target.display());
        match std::os::unix::fs::symlink(target, link) {
            Ok(()) => changed = true,
            Err(e) => error!("Could not create link {}: {e}", link.display()),
        }
    }

    changed
}

/// Parameters of the internal leaf query.
#[derive(Debug, Clone, Copy)]
struct CertificateQueryParams {
    certificate_type: LeafCertificateType,
    encoding: EncodingFormat,
    include_ocsp: bool,
    include_root: bool,
    include_all_valid: bool,
    include_future_valid: bool,
    remove_duplicates: bool,
}

impl CertificateQueryParams {
    fn new(certificate_type: LeafCertificateType, encoding: EncodingFormat) -> Self {
        Self {
            certificate_type,
            encoding,
            include_ocsp: false,
            include_root: false,
            include_all_valid: false,
            include_future_valid: false,
            remove_duplicates: false,
        }
    }
}

struct StoreInner {
    ca_bundle_paths: BTreeMap<CaCertificateType, PathBuf>,
    directories: LeafDirectories,
    links: LinkPaths,
    /// CSR private keys awaiting their certificate, by issue time.
    managed_csrs: HashMap<PathBuf, Instant>,
    max_fs_usage_bytes: u64,
    max_fs_certificate_store_entries: u64,
    csr_expiry: Duration,
    private_key_password: Option<SecretString>,
}

/// Certificate and private key lifecycle manager. One instance owns the
/// configured filesystem locations; all access is routed through it.
pub struct CertificateStore {
    inner: Arc<Mutex<StoreInner>>,
    gc_worker: Option<GcWorker>,
}

struct GcWorker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    fn spawn(inner: Weak<Mutex<StoreInner>>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("cert-store-gc".to_string())
            .spawn(move || {
                let (lock, condvar) = &*worker_stop;
                let mut stopped = lock.lock().expect("gc stop mutex poisoned");

                loop {
                    if *stopped {
                        break;
                    }

                    let (guard, timeout) = condvar
                        .wait_timeout(stopped, interval)
                        .expect("gc stop mutex poisoned");
                    stopped = guard;

                    if *stopped {
                        break;
                    }

                    if timeout.timed_out() {
                        let Some(store) = inner.upgrade() else {
                            break;
                        };

                        let mut store = store.lock().expect("certificate store mutex poisoned");
                        store.garbage_collect();
                    }
                }
            })
            .expect("failed to spawn gc worker");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn shutdown(&mut self) {
        let (lock, condvar) = &*self.stop;
        if let Ok(mut stopped) = lock.lock() {
            *stopped = true;
        }
        condvar.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CertificateStore {
    fn drop(&mut self) {
        if let Some(mut worker) = self.gc_worker.take() {
            worker.shutdown();
        }
    }
}

impl CertificateStore {
    /// Build the store from its configuration. Missing leaf directories
    /// and bundle files are created.
    ///
    /// # Panics
    ///
    /// Panics when a configured leaf location exists but is not a
    /// directory, or when a leaf directory equals a CA bundle path: the
    /// garbage collector must never be able to touch trust anchors.
    pub fn new(config: StoreConfig, private_key_password: Option<SecretString>) -> Self {
        let directories = config.paths.directories.clone();

        let leaf_dirs = [
            directories.csms_leaf_cert_directory.clone(),
            directories.csms_leaf_key_directory.clone(),
            directories.secc_leaf_cert_directory.clone(),
            directories.secc_leaf_key_directory.clone(),
        ];

        for path in &leaf_dirs {
            if !path.exists() {
                warn!(
                    "Could not find configured leaf directory at: {}, creating it",
                    path.display()
                );
                if let Err(e) = fs::create_dir_all(path) {
                    error!("Could not create dir for path {}: {e}", path.display());
                }
            } else if !path.is_dir() {
                panic!("{} is not a directory", path.display());
            }
        }

        let mut ca_bundle_paths = BTreeMap::new();
        ca_bundle_paths.insert(CaCertificateType::Csms, config.paths.csms_ca_bundle.clone());
        ca_bundle_paths.insert(CaCertificateType::Mf, config.paths.mf_ca_bundle.clone());
        ca_bundle_paths.insert(CaCertificateType::Mo, config.paths.mo_ca_bundle.clone());
        ca_bundle_paths.insert(CaCertificateType::V2g, config.paths.v2g_ca_bundle.clone());

        for (certificate_type, bundle_path) in &ca_bundle_paths {
            if !bundle_path.exists() {
                warn!(
                    "Could not find configured {certificate_type} bundle at: {}, creating it",
                    bundle_path.display()
                );
                if let Err(e) = fs_utils::create_file_or_dir_if_nonexistent(bundle_path) {
                    error!(
                        "Could not create bundle for path {}: {e}",
                        bundle_path.display()
                    );
                }
            }
        }

        for leaf_dir in &leaf_dirs {
            for (_, bundle_path) in &ca_bundle_paths {
                assert!(
                    bundle_path != leaf_dir,
                    "leaf directory {} can not overlap CA bundle path {}",
                    leaf_dir.display(),
                    bundle_path.display()
                );
            }
        }

        let inner = Arc::new(Mutex::new(StoreInner {
            ca_bundle_paths,
            directories,
            links: config.paths.links.clone(),
            managed_csrs: HashMap::new(),
            max_fs_usage_bytes: config.max_fs_usage_bytes,
            max_fs_certificate_store_entries: config.max_fs_certificate_store_entries,
            csr_expiry: config.csr_expiry(),
            private_key_password,
        }));

        let gc_worker = GcWorker::spawn(
            Arc::downgrade(&inner),
            config.garbage_collect_interval(),
        );

        Self {
            inner,
            gc_worker: Some(gc_worker),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("certificate store mutex poisoned")
    }

    /// Install or update a CA certificate in the bundle of its PKI.
    pub fn install_ca_certificate(
        &self,
        certificate: &str,
        certificate_type: CaCertificateType,
    ) -> InstallCertificateResult {
        self.lock()
            .install_ca_certificate(certificate, certificate_type)
    }

    /// Delete the certificate (and its issued descendants within the same
    /// bundle) identified by the hash data. Direct deletion of the CSMS
    /// leaf is refused.
    pub fn delete_certificate(&self, certificate_hash_data: &CertificateHashData) -> DeleteResult {
        self.lock().delete_certificate(certificate_hash_data)
    }

    /// Verify a PEM chain against the trust anchors of the given leaf
    /// roles and install the leaf (and its chain) when valid.
    pub fn update_leaf_certificate(
        &self,
        certificate_chain: &str,
        certificate_type: LeafCertificateType,
    ) -> InstallCertificateResult {
        self.lock()
            .update_leaf_certificate(certificate_chain, certificate_type)
    }

    /// Hash data of everything installed for the requested chain kinds.
    pub fn get_installed_certificates(
        &self,
        certificate_types: &[CertificateType],
    ) -> GetInstalledCertificatesResult {
        self.lock().get_installed_certificates(certificate_types)
    }

    /// Single-kind convenience over [`Self::get_installed_certificates`].
    pub fn get_installed_certificate(
        &self,
        certificate_type: CertificateType,
    ) -> GetInstalledCertificatesResult {
        self.get_installed_certificates(&[certificate_type])
    }

    /// Number of certificates installed for the requested chain kinds.
    pub fn get_count_of_installed_certificates(
        &self,
        certificate_types: &[CertificateType],
    ) -> usize {
        self.lock()
            .get_count_of_installed_certificates(certificate_types)
    }

    /// OCSP request data for the installed V2G chains.
    pub fn get_v2g_ocsp_request_data(&self) -> Vec<OcspRequestData> {
        self.lock().get_v2g_ocsp_request_data()
    }

    /// OCSP request data for a received contract certificate chain,
    /// resolved against both the MO and V2G PKIs.
    pub fn get_mo_ocsp_request_data(&self, certificate_chain: &str) -> Vec<OcspRequestData> {
        self.lock().get_mo_ocsp_request_data(certificate_chain)
    }

    /// Cache an OCSP response for the certificate with the given hash.
    pub fn update_ocsp_cache(
        &self,
        certificate_hash_data: &CertificateHashData,
        ocsp_response: &str,
    ) {
        self.lock()
            .update_ocsp_cache(certificate_hash_data, ocsp_response)
    }

    /// Path of the cached OCSP response for the given hash, when present.
    pub fn retrieve_ocsp_cache(
        &self,
        certificate_hash_data: &CertificateHashData,
    ) -> Option<PathBuf> {
        self.lock().retrieve_ocsp_cache(certificate_hash_data)
    }

    /// A valid self-signed root is installed for the PKI.
    pub fn is_ca_certificate_installed(&self, certificate_type: CaCertificateType) -> bool {
        self.lock().is_ca_certificate_installed(certificate_type)
    }

    /// Generate a private key and certificate signing request for a leaf
    /// role. Only the CSMS and V2G roles may request leaves.
    pub fn generate_certificate_signing_request(
        &self,
        certificate_type: LeafCertificateType,
        country: &str,
        organization: &str,
        common_name: &str,
        use_custom_provider: bool,
    ) -> GetCertificateSignRequestResult {
        self.lock().generate_certificate_signing_request(
            certificate_type,
            country,
            organization,
            common_name,
            use_custom_provider,
        )
    }

    /// The most recent valid leaf with a matching private key.
    pub fn get_leaf_certificate_info(
        &self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateInfoResult {
        self.lock()
            .get_leaf_certificate_info(certificate_type, encoding, include_ocsp)
    }

    /// The newest valid leaf for each distinct installed root.
    pub fn get_all_valid_certificates_info(
        &self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateFullInfoResult {
        self.lock()
            .get_all_valid_certificates_info(certificate_type, encoding, include_ocsp)
    }

    /// Re-point the exposed V2G symlinks at the currently selected leaf.
    /// Returns true when any link changed.
    ///
    /// # Panics
    ///
    /// Panics for non-V2G roles; only V2G material is exposed via links.
    pub fn update_certificate_links(&self, certificate_type: LeafCertificateType) -> bool {
        assert!(
            certificate_type == LeafCertificateType::V2g,
            "link updating only supported for V2G certificates"
        );

        self.lock().update_certificate_links()
    }

    /// PEM bundle file location usable as a verify file for the PKI,
    /// empty when none is available.
    pub fn get_verify_file(&self, certificate_type: CaCertificateType) -> String {
        self.lock().get_verify_file(certificate_type)
    }

    /// [`Self::get_verify_file`] with error reporting.
    pub fn get_ca_certificate_info(
        &self,
        certificate_type: CaCertificateType,
    ) -> GetCertificateInfoResult {
        self.lock().get_ca_certificate_info(certificate_type)
    }

    /// Days until the currently selected leaf of the role expires.
    pub fn get_leaf_expiry_days_count(&self, certificate_type: LeafCertificateType) -> i64 {
        self.lock().get_leaf_expiry_days_count(certificate_type)
    }

    /// Verify a PEM chain against the trust anchors of the given roles.
    pub fn verify_certificate(
        &self,
        certificate_chain: &str,
        certificate_types: &[LeafCertificateType],
    ) -> CertificateValidationResult {
        self.lock()
            .verify_certificate_internal(certificate_chain, certificate_types)
    }

    /// Verify a base64 encoded SHA-256 signature over the file at `path`
    /// with the given signing certificate.
    pub fn verify_file_signature(
        &self,
        path: &Path,
        signing_certificate: &str,
        signature: &str,
    ) -> bool {
        self.lock()
            .verify_file_signature(path, signing_certificate, signature)
    }

    /// Run one garbage collection pass now. Also runs periodically on the
    /// configured interval.
    pub fn garbage_collect(&self) {
        self.lock().garbage_collect()
    }
}

impl StoreInner {
    fn password_string(&self) -> Option<String> {
        self.private_key_password
            .as_ref()
            .map(|password| password.expose_secret().to_string())
    }

    fn leaf_directories_of(
        &self,
        certificate_type: LeafCertificateType,
    ) -> Option<(PathBuf, PathBuf, CaCertificateType)> {
        match certificate_type {
            LeafCertificateType::Csms => Some((
                self.directories.csms_leaf_cert_directory.clone(),
                self.directories.csms_leaf_key_directory.clone(),
                CaCertificateType::Csms,
            )),
            LeafCertificateType::V2g => Some((
                self.directories.secc_leaf_cert_directory.clone(),
                self.directories.secc_leaf_key_directory.clone(),
                CaCertificateType::V2g,
            )),
            _ => None,
        }
    }

    fn install_ca_certificate(
        &mut self,
        certificate: &str,
        certificate_type: CaCertificateType,
    ) -> InstallCertificateResult {
        info!("Installing ca certificate: {certificate_type}");

        if self.is_filesystem_full() {
            error!("Filesystem full, can't install new CA certificate");
            return InstallCertificateResult::CertificateStoreMaxLengthExceeded;
        }

        let mut new_cert =
            match Certificate::from_data(certificate.as_bytes(), EncodingFormat::Pem) {
                Ok(new_cert) => new_cert,
                Err(e) => {
                    error!("Certificate load error: {e}");
                    return InstallCertificateResult::InvalidFormat;
                }
            };

        if !new_cert.is_valid() {
            return InstallCertificateResult::Expired;
        }

        let ca_bundle_path = match self.ca_bundle_paths.get(&certificate_type) {
            Some(path) => path.clone(),
            None => return InstallCertificateResult::WriteError,
        };

        if !ca_bundle_path.is_dir() {
            // Ensure file exists
            if let Err(e) = fs_utils::create_file_if_nonexistent(&ca_bundle_path) {
                error!("Could not create bundle file: {e}");
                return InstallCertificateResult::WriteError;
            }
        }

        let mut existing_certs = match CertificateBundle::from_path(&ca_bundle_path) {
            Ok(bundle) => bundle,
            Err(e) => {
                error!("Certificate load error: {e}");
                return InstallCertificateResult::InvalidFormat;
            }
        };

        if existing_certs.is_using_directory() {
            let filename = format!(
                "{certificate_type}_ROOT_{}",
                fs_utils::random_file_name(&format!(".{PEM_EXTENSION}"))
            );
            if new_cert.set_file(ca_bundle_path.join(filename)).is_err() {
                return InstallCertificateResult::WriteError;
            }
        }

        if !existing_certs.contains_certificate(&new_cert) {
            if existing_certs.add_certificate(new_cert).is_err() {
                return InstallCertificateResult::WriteError;
            }
        } else if !existing_certs.update_certificate(new_cert) {
            return InstallCertificateResult::WriteError;
        }

        match existing_certs.export() {
            Ok(()) => InstallCertificateResult::Accepted,
            Err(e) => {
                error!("Could not export ca bundle: {e}");
                InstallCertificateResult::WriteError
            }
        }
    }

    fn delete_certificate(&mut self, certificate_hash_data: &CertificateHashData) -> DeleteResult {
        info!(
            "Deleting certificate: {}",
            certificate_hash_data.serial_number
        );

        let mut response = DeleteResult {
            result: DeleteCertificateResult::NotFound,
            ca_certificate_type: None,
            leaf_certificate_type: None,
        };

        let mut found_certificate = false;
        let mut failed_to_write = false;
        let mut deleted_root_certificate = false;

        // Deleted roots become the hierarchy base for the leaf scan below
        let mut deleted_roots: Vec<Certificate> = Vec::new();

        for (certificate_type, ca_bundle_path) in self.ca_bundle_paths.clone() {
            let mut ca_bundle = match CertificateBundle::from_path(&ca_bundle_path) {
                Ok(bundle) => bundle,
                Err(_) => {
                    warn!(
                        "Could not load ca bundle from file: {}",
                        ca_bundle_path.display()
                    );
                    continue;
                }
            };

            match ca_bundle.delete_certificate_by_hash(certificate_hash_data, true) {
                Ok(deleted) if !deleted.is_empty() => {
                    found_certificate = true;
                    response.ca_certificate_type = Some(certificate_type);

                    if ca_bundle.export().is_err() {
                        failed_to_write = true;
                    } else {
                        deleted_roots.extend(deleted);
                        deleted_root_certificate = true;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Could not delete from ca bundle: {e}"),
            }
        }

        if deleted_root_certificate {
            if failed_to_write {
                error!("Could not delete CA root certificate");
                response.result = DeleteCertificateResult::Failed;
                return response;
            }

            // Early return: intermediates and leaves issued by this root
            // are deliberately left in place
            info!("Deleted CA root certificate successfully");
            response.result = DeleteCertificateResult::Accepted;
            return response;
        }

        let password = self.password_string();

        for leaf_certificate_type in [LeafCertificateType::V2g, LeafCertificateType::Csms] {
            let Some((leaf_certificate_path, leaf_certificate_key, _)) =
                self.leaf_directories_of(leaf_certificate_type)
            else {
                continue;
            };

            let secc = leaf_certificate_path == self.directories.secc_leaf_cert_directory;
            let csms = leaf_certificate_path == self.directories.csms_leaf_cert_directory
                // for when we have shared directories for secc/csms
                || self.directories.csms_leaf_cert_directory
                    == self.directories.secc_leaf_cert_directory;

            let root_load = if secc {
                CaCertificateType::V2g
            } else {
                CaCertificateType::Csms
            };

            // The leaf bundle contains many chain/single certificates in
            // separate files
            let leaf_bundle = match CertificateBundle::from_path(&leaf_certificate_path) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Could not load leaf bundle: {e}");
                    continue;
                }
            };

            let base_roots = if deleted_roots.is_empty() {
                match self
                    .ca_bundle_paths
                    .get(&root_load)
                    .ok_or(())
                    .and_then(|path| CertificateBundle::from_path(path).map_err(|_| ()))
                {
                    Ok(bundle) => bundle.split(),
                    Err(()) => {
                        warn!("Could not load base roots for: {root_load}");
                        Vec::new()
                    }
                }
            } else {
                deleted_roots.clone()
            };

            let hierarchy =
                match CertificateHierarchy::build_with_leaves(base_roots, leaf_bundle.split()) {
                    Ok(hierarchy) => hierarchy,
                    Err(e) => {
                        error!("Could not build hierarchy for leaf deletion: {e}");
                        continue;
                    }
                };

            let leafs_to_delete = hierarchy.find_certificates_multi(certificate_hash_data);

            let mut chains_to_delete: Vec<(PathBuf, Vec<Certificate>)> = Vec::new();
            leaf_bundle.for_each_chain(|file, chain| {
                // Any matched chain member takes the whole chain file down
                if chain.iter().any(|member| leafs_to_delete.contains(member)) {
                    chains_to_delete.push((file.to_path_buf(), chain.to_vec()));
                }
                true
            });

            for (chain_file, chain) in chains_to_delete {
                let mut deleted_full_file = false;

                for deleted_leaf in &chain {
                    found_certificate = true;
                    response.leaf_certificate_type = Some(leaf_certificate_type);

                    if csms {
                        // The charging station certificate may never be
                        // removed through the deletion request, only by
                        // deleting its root
                        if deleted_root_certificate {
                            error!(
                                "Root ChargingStationCertificate was deleted, however the leaf will be kept"
                            );
                        } else {
                            failed_to_write = true;
                            error!(
                                "Not allowed to delete ChargingStationCertificate: {}",
                                deleted_leaf.common_name()
                            );
                        }
                        continue;
                    }

                    // Delete the chain file only once, several deleted
                    // members can point at the same file
                    if !deleted_full_file {
                        if fs_utils::delete_file(&chain_file) {
                            deleted_full_file = true;
                        } else {
                            failed_to_write = true;
                            error!(
                                "Error removing leaf chain file: {}",
                                deleted_leaf.common_name()
                            );
                        }
                    }

                    if !failed_to_write {
                        if let Some(key_path) = private_key_path_of_certificate(
                            deleted_leaf,
                            &leaf_certificate_key,
                            password.as_deref(),
                        ) {
                            info!(
                                "Deleted key of leaf certificate: {}",
                                deleted_leaf.common_name()
                            );
                            fs_utils::delete_file(&key_path);
                        }

                        // Only the leaf's own OCSP entry: intermediates in
                        // other chains may still need theirs
                        if let Some((hash_path, data_path)) =
                            ocsp::ocsp_data_of_certificate(deleted_leaf, certificate_hash_data)
                        {
                            info!(
                                "Deleted ocsp data of certificate: {}",
                                deleted_leaf.common_name()
                            );
                            fs_utils::delete_file(&hash_path);
                            fs_utils::delete_file(&data_path);
                        }
                    }
                }
            }
        }

        if !found_certificate {
            response.result = DeleteCertificateResult::NotFound;
            return response;
        }

        if failed_to_write {
            // At least one certificate could not be deleted
            response.result = DeleteCertificateResult::Failed;
            return response;
        }

        response.result = DeleteCertificateResult::Accepted;
        response
    }

    fn update_leaf_certificate(
        &mut self,
        certificate_chain: &str,
        certificate_type: LeafCertificateType,
    ) -> InstallCertificateResult {
        if self.is_filesystem_full() {
            error!("Filesystem full, can't install new leaf certificate");
            return InstallCertificateResult::CertificateStoreMaxLengthExceeded;
        }

        info!("Updating leaf certificate: {certificate_type}");

        let Some((cert_path, key_path, _)) = self.leaf_directories_of(certificate_type) else {
            error!("Attempt to update leaf certificate for non CSMS/V2G certificate");
            return InstallCertificateResult::WriteError;
        };

        let chain_certificate =
            match CertificateBundle::from_data(certificate_chain.as_bytes(), EncodingFormat::Pem) {
                Ok(bundle) => bundle,
                Err(_) => {
                    warn!("Could not load leaf certificate chain because of invalid format");
                    return InstallCertificateResult::InvalidFormat;
                }
            };

        let chain = chain_certificate.split();
        if chain.is_empty() {
            return InstallCertificateResult::InvalidFormat;
        }

        let result = self.verify_certificate_internal(certificate_chain, &[certificate_type]);
        if result != CertificateValidationResult::Valid {
            return to_install_certificate_result(result);
        }

        // First certificate is always the leaf
        let leaf_certificate = &chain[0];

        let password = self.password_string();
        let Some(private_key_path) =
            private_key_path_of_certificate(leaf_certificate, &key_path, password.as_deref())
        else {
            warn!("Provided certificate does not belong to any private key");
            return InstallCertificateResult::WriteError;
        };

        let extra_filename = fs_utils::random_file_name(&format!(".{PEM_EXTENSION}"));
        let file_name = format!("{}{extra_filename}", certificate_type.filename_prefix());
        let file_path = cert_path.join(file_name);

        let leaf_pem = match leaf_certificate.export_string() {
            Ok(pem) => pem,
            Err(e) => {
                error!("Could not render leaf certificate: {e}");
                return InstallCertificateResult::WriteError;
            }
        };

        if fs_utils::write_to_file(&file_path, leaf_pem.as_bytes()).is_err() {
            return InstallCertificateResult::WriteError;
        }

        // The CSR is fulfilled, its key is paired now and must not be
        // garbage collected
        self.managed_csrs.remove(&private_key_path);

        if chain.len() > 1 {
            let chain_file_name = format!(
                "CPO_CERT_{}CHAIN_{extra_filename}",
                certificate_type.filename_prefix()
            );
            let chain_file_path = cert_path.join(chain_file_name);

            let chain_pem = match chain_certificate.to_export_string() {
                Ok(pem) => pem,
                Err(e) => {
                    error!("Could not render leaf certificate chain: {e}");
                    return InstallCertificateResult::WriteError;
                }
            };

            if fs_utils::write_to_file(&chain_file_path, chain_pem.as_bytes()).is_err() {
                // The sub CAs are required for the connection
                error!("Could not write leaf certificate chain to file");
                return InstallCertificateResult::WriteError;
            }
        }

        InstallCertificateResult::Accepted
    }

    fn get_installed_certificates(
        &mut self,
        certificate_types: &[CertificateType],
    ) -> GetInstalledCertificatesResult {
        let mut certificate_chains: Vec<CertificateHashDataChain> = Vec::new();

        // CA roots and their descendants
        for certificate_type in certificate_types {
            let Some(ca_certificate_type) = certificate_type.ca_certificate_type() else {
                continue;
            };
            let Some(ca_bundle_path) = self.ca_bundle_paths.get(&ca_certificate_type).cloned()
            else {
                continue;
            };

            let mut ca_bundle = match CertificateBundle::from_path(&ca_bundle_path) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(
                        "Could not load CA bundle file at: {} error: {e}",
                        ca_bundle_path.display()
                    );
                    continue;
                }
            };

            let hierarchy = match ca_bundle.hierarchy() {
                Ok(hierarchy) => hierarchy,
                Err(e) => {
                    warn!("Could not build hierarchy: {e}");
                    continue;
                }
            };

            debug!(
                "Hierarchy ({ca_certificate_type}):\n{}",
                hierarchy.debug_string()
            );

            for root in hierarchy.roots() {
                if !root.state.is_self_signed {
                    continue;
                }
                let Some(root_hash) = root.hash.clone() else {
                    continue;
                };

                let mut chain = CertificateHashDataChain {
                    certificate_type: *certificate_type,
                    certificate_hash_data: root_hash,
                    child_certificate_hash_data: Vec::new(),
                };

                let mut collect = |child: &crate::x509_hierarchy::X509Node, _depth: i32| {
                    if let Some(hash) = &child.hash {
                        chain.child_certificate_hash_data.push(hash.clone());
                    }
                };
                CertificateHierarchy::for_each_descendant(root, 0, &mut collect);

                certificate_chains.push(chain);
            }
        }

        // Full V2G chains, one per installed valid leaf
        if certificate_types.contains(&CertificateType::V2gCertificateChain) {
            let mut params =
                CertificateQueryParams::new(LeafCertificateType::V2g, EncodingFormat::Pem);
            params.include_all_valid = true;
            params.remove_duplicates = true;

            let secc_key_pairs = self.get_full_leaf_certificate_info_internal(params);

            if secc_key_pairs.status == GetCertificateInfoStatus::Accepted {
                for secc_key_pair in &secc_key_pairs.info {
                    let Some(certificate_path) = secc_key_pair
                        .certificate
                        .as_ref()
                        .or(secc_key_pair.certificate_single.as_ref())
                    else {
                        error!("Leaf certificate single/bundle not present");
                        continue;
                    };

                    let chains = self.v2g_chain_hash_data(certificate_path);
                    certificate_chains.extend(chains);
                }
            }
        }

        let status = if certificate_chains.is_empty() {
            GetInstalledCertificatesStatus::NotFound
        } else {
            GetInstalledCertificatesStatus::Accepted
        };

        GetInstalledCertificatesResult {
            status,
            certificate_hash_data_chain: certificate_chains,
        }
    }

    /// Merge one leaf chain file with the V2G trust bundle and render the
    /// linked chains leaf-first.
    fn v2g_chain_hash_data(&self, certificate_path: &Path) -> Vec<CertificateHashDataChain> {
        let mut chains = Vec::new();

        let Some(v2g_bundle_path) = self.ca_bundle_paths.get(&CaCertificateType::V2g) else {
            return chains;
        };

        let leaf_bundle = match CertificateBundle::from_path(certificate_path) {
            Ok(bundle) => bundle,
            Err(e) => {
                error!("Could not load installed leaf certificates: {e}");
                return chains;
            }
        };

        let mut ca_bundle = match CertificateBundle::from_path(v2g_bundle_path) {
            Ok(bundle) => bundle,
            Err(e) => {
                error!("Could not load V2G bundle: {e}");
                return chains;
            }
        };

        // Merge for the full (root -> sub CAs -> leaf) linkage
        for certificate in leaf_bundle.split() {
            if let Err(e) = ca_bundle.add_certificate_unique(certificate) {
                warn!("Could not merge leaf certificate into V2G view: {e}");
            }
        }

        let hierarchy = match ca_bundle.hierarchy() {
            Ok(hierarchy) => hierarchy,
            Err(e) => {
                error!("Could not build V2G chain hierarchy: {e}");
                return chains;
            }
        };

        debug!("Hierarchy (V2GCertificateChain):\n{}", hierarchy.debug_string());

        for root in hierarchy.roots() {
            // Descendants arrive root-side first; the reported chain is
            // leaf first
            let mut hierarchy_hash_data: Vec<CertificateHashData> = Vec::new();

            let mut collect = |child: &crate::x509_hierarchy::X509Node, _depth: i32| {
                if let Some(hash) = &child.hash {
                    hierarchy_hash_data.push(hash.clone());
                }
            };
            CertificateHierarchy::for_each_descendant(root, 0, &mut collect);

            if hierarchy_hash_data.is_empty() {
                continue;
            }

            let mut iter = hierarchy_hash_data.into_iter().rev();
            let Some(leaf_hash) = iter.next() else {
                continue;
            };

            chains.push(CertificateHashDataChain {
                certificate_type: CertificateType::V2gCertificateChain,
                certificate_hash_data: leaf_hash,
                child_certificate_hash_data: iter.collect(),
            });
        }

        chains
    }

    fn get_count_of_installed_certificates(
        &mut self,
        certificate_types: &[CertificateType],
    ) -> usize {
        let mut count = 0;

        let mut unique_paths: BTreeSet<PathBuf> = BTreeSet::new();
        for certificate_type in certificate_types {
            if let Some(ca_type) = certificate_type.ca_certificate_type() {
                if let Some(path) = self.ca_bundle_paths.get(&ca_type) {
                    unique_paths.insert(path.clone());
                }
            }
        }

        for unique_path in &unique_paths {
            match CertificateBundle::from_path(unique_path) {
                Ok(bundle) => count += bundle.certificate_count(),
                Err(e) => error!("Could not load bundle for certificate count: {e}"),
            }
        }

        if certificate_types.contains(&CertificateType::V2gCertificateChain) {
            // All leaf chains count, including expired and unused ones
            let leaf_dir = self.directories.secc_leaf_cert_directory.clone();
            match CertificateBundle::from_path(&leaf_dir) {
                Ok(bundle) => count += bundle.certificate_count(),
                Err(e) => error!("Could not load bundle for certificate count: {e}"),
            }
        }

        count
    }

    fn get_v2g_ocsp_request_data(&mut self) -> Vec<OcspRequestData> {
        let mut params = CertificateQueryParams::new(LeafCertificateType::V2g, EncodingFormat::Pem);
        params.include_all_valid = true;
        params.include_future_valid = true;
        params.remove_duplicates = true;

        let result = self.get_full_leaf_certificate_info_internal(params);

        if result.status != GetCertificateInfoStatus::Accepted || result.info.is_empty() {
            error!("Could not get key pair for v2g ocsp request");
            return Vec::new();
        }

        let mut full_list: Vec<OcspRequestData> = Vec::new();

        for secc_key_pair in &result.info {
            let Some(chain_path) = secc_key_pair
                .certificate
                .as_ref()
                .or(secc_key_pair.certificate_single.as_ref())
            else {
                error!("Could not load v2g ocsp cache leaf chain");
                continue;
            };

            let leaf_chain = match CertificateBundle::from_path(chain_path) {
                Ok(bundle) => bundle.split(),
                Err(e) => {
                    error!("Could not load v2g ocsp cache leaf chain: {e}");
                    continue;
                }
            };

            if leaf_chain.is_empty() {
                continue;
            }

            let partial = ocsp::generate_ocsp_request_data(
                &self.ca_bundle_paths,
                &[CaCertificateType::V2g],
                &leaf_chain,
            );

            for request_data in partial {
                let contained = full_list.iter().any(|existing| {
                    existing.certificate_hash_data == request_data.certificate_hash_data
                });
                if !contained {
                    full_list.push(request_data);
                }
            }
        }

        full_list
    }

    fn get_mo_ocsp_request_data(&mut self, certificate_chain: &str) -> Vec<OcspRequestData> {
        let leaf_chain =
            match CertificateBundle::from_data(certificate_chain.as_bytes(), EncodingFormat::Pem) {
                Ok(bundle) => bundle.split(),
                Err(e) => {
                    error!("Could not load mo ocsp cache leaf chain: {e}");
                    return Vec::new();
                }
            };

        // Contract chains may terminate in either the V2G or the MO PKI
        ocsp::generate_ocsp_request_data(
            &self.ca_bundle_paths,
            &[CaCertificateType::V2g, CaCertificateType::Mo],
            &leaf_chain,
        )
    }

    fn update_ocsp_cache(
        &mut self,
        certificate_hash_data: &CertificateHashData,
        ocsp_response: &str,
    ) {
        info!("Updating OCSP cache");

        let Some(ca_bundle_path) = self.ca_bundle_paths.get(&CaCertificateType::V2g).cloned()
        else {
            return;
        };
        let leaf_cert_dir = self.directories.secc_leaf_cert_directory.clone();

        let certs = (|| -> crate::error::Result<Vec<Certificate>> {
            let ca_bundle = CertificateBundle::from_path(&ca_bundle_path)?;
            let leaf_bundle = CertificateBundle::from_path(&leaf_cert_dir)?;

            let hierarchy =
                CertificateHierarchy::build_with_leaves(ca_bundle.split(), leaf_bundle.split())?;
            Ok(hierarchy.find_certificates_multi(certificate_hash_data))
        })();

        match certs {
            Ok(certs) if certs.is_empty() => {
                error!("Could not find any certificate for ocsp cache update");
            }
            Ok(certs) => {
                for certificate in &certs {
                    debug!("Writing OCSP response to filesystem");
                    if let Err(e) =
                        ocsp::write_ocsp_response(certificate, certificate_hash_data, ocsp_response)
                    {
                        error!("Could not write OCSP response: {e}");
                    }
                }
            }
            Err(e) => error!("Could not update ocsp cache, certificate load failure: {e}"),
        }
    }

    fn retrieve_ocsp_cache(
        &mut self,
        certificate_hash_data: &CertificateHashData,
    ) -> Option<PathBuf> {
        self.retrieve_ocsp_cache_internal(certificate_hash_data)
    }

    fn retrieve_ocsp_cache_internal(
        &self,
        certificate_hash_data: &CertificateHashData,
    ) -> Option<PathBuf> {
        let ca_bundle_path = self.ca_bundle_paths.get(&CaCertificateType::V2g)?;
        let leaf_cert_dir = &self.directories.secc_leaf_cert_directory;

        let found = (|| -> crate::error::Result<Option<Certificate>> {
            let ca_bundle = CertificateBundle::from_path(ca_bundle_path)?;
            let leaf_bundle = CertificateBundle::from_path(leaf_cert_dir)?;

            let hierarchy =
                CertificateHierarchy::build_with_leaves(ca_bundle.split(), leaf_bundle.split())?;
            Ok(hierarchy.find_certificate(certificate_hash_data, false))
        })();

        match found {
            Ok(Some(certificate)) => {
                debug!("Reading OCSP response from filesystem");
                ocsp::ocsp_data_of_certificate(&certificate, certificate_hash_data)
                    .map(|(_, data_path)| data_path)
            }
            Ok(None) => {
                error!("Could not find any certificate for ocsp cache retrieve");
                None
            }
            Err(e) => {
                error!("Could not retrieve ocsp cache, certificate load failure: {e}");
                None
            }
        }
    }

    fn is_ca_certificate_installed(&mut self, certificate_type: CaCertificateType) -> bool {
        self.is_ca_certificate_installed_internal(certificate_type)
    }

    fn is_ca_certificate_installed_internal(&self, certificate_type: CaCertificateType) -> bool {
        let Some(path) = self.ca_bundle_paths.get(&certificate_type) else {
            return false;
        };

        let installed = (|| -> crate::error::Result<bool> {
            let mut bundle = CertificateBundle::from_path(path)?;
            let hierarchy = bundle.hierarchy()?;

            // Search for a valid self-signed root
            Ok(hierarchy.roots().iter().any(|root| {
                root.certificate.is_self_signed() && root.certificate.is_valid()
            }))
        })();

        match installed {
            Ok(installed) => installed,
            Err(_) => {
                error!("Could not load ca certificate type: {certificate_type}");
                false
            }
        }
    }

    fn generate_certificate_signing_request(
        &mut self,
        certificate_type: LeafCertificateType,
        country: &str,
        organization: &str,
        common_name: &str,
        use_custom_provider: bool,
    ) -> GetCertificateSignRequestResult {
        // Custom-provider keys get their own extension for identification
        let extension = if use_custom_provider {
            CUSTOM_KEY_EXTENSION
        } else {
            KEY_EXTENSION
        };
        let file_name = format!(
            "{}{}",
            certificate_type.filename_prefix(),
            fs_utils::random_file_name(&format!(".{extension}"))
        );

        let Some((_, key_dir, _)) = self.leaf_directories_of(certificate_type) else {
            error!("Generate CSR requested for non CSMS/V2G leaf");
            return GetCertificateSignRequestResult {
                status: GetCertificateSignRequestStatus::InvalidRequestedType,
                csr: None,
            };
        };
        let key_path = key_dir.join(file_name);

        let private_key_pass = if use_custom_provider {
            None
        } else {
            self.password_string()
        };

        let info = CertificateSigningRequestInfo {
            n_version: 0,
            country: country.to_string(),
            organization: organization.to_string(),
            common_name: common_name.to_string(),
            dns_name: crypto::CSR_DNS_NAME.map(str::to_string),
            ip_address: crypto::CSR_IP_ADDRESS.map(str::to_string),
            key_info: KeyGenerationInfo {
                private_key_file: key_path,
                private_key_pass,
                generate_on_custom: use_custom_provider,
            },
        };

        self.generate_certificate_signing_request_internal(certificate_type, info)
    }

    fn generate_certificate_signing_request_internal(
        &mut self,
        certificate_type: LeafCertificateType,
        info: CertificateSigningRequestInfo,
    ) -> GetCertificateSignRequestResult {
        info!("Generating CSR for leaf: {certificate_type}");

        match crypto::generate_csr(&info) {
            Ok(csr) => {
                debug!("Generated CSR end. CSR: {csr}");

                // Track the pairing key; it is deleted if no certificate
                // arrives within the expiry
                self.managed_csrs
                    .insert(info.key_info.private_key_file.clone(), Instant::now());

                GetCertificateSignRequestResult {
                    status: GetCertificateSignRequestStatus::Accepted,
                    csr: Some(csr),
                }
            }
            Err(e) => {
                error!("CSR leaf generation error: {e}");

                let status = match e {
                    CsrError::KeyGeneration(_) => GetCertificateSignRequestStatus::KeyGenError,
                    _ => GetCertificateSignRequestStatus::GenerationError,
                };

                GetCertificateSignRequestResult { status, csr: None }
            }
        }
    }

    fn get_leaf_certificate_info(
        &mut self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateInfoResult {
        self.get_leaf_certificate_info_internal(certificate_type, encoding, include_ocsp)
    }

    fn get_leaf_certificate_info_internal(
        &mut self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateInfoResult {
        let mut params = CertificateQueryParams::new(certificate_type, encoding);
        params.include_ocsp = include_ocsp;

        let mut result = self.get_full_leaf_certificate_info_internal(params);

        GetCertificateInfoResult {
            status: result.status,
            info: if result.info.is_empty() {
                None
            } else {
                Some(result.info.remove(0))
            },
        }
    }

    fn get_all_valid_certificates_info(
        &mut self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateFullInfoResult {
        let mut params = CertificateQueryParams::new(certificate_type, encoding);
        params.include_ocsp = include_ocsp;
        params.include_root = true;
        params.include_all_valid = true;
        params.remove_duplicates = true;

        let result = self.get_full_leaf_certificate_info_internal(params);
        if result.status != GetCertificateInfoStatus::Accepted {
            return result;
        }

        // Keep only the newest leaf per distinct root; the internal query
        // returns them newest first
        let mut unique_roots: BTreeSet<String> = BTreeSet::new();
        let mut filtered = GetCertificateFullInfoResult {
            status: result.status,
            info: Vec::new(),
        };

        for chain in result.info {
            let Some(root) = chain.certificate_root.clone() else {
                continue;
            };

            if unique_roots.insert(root) {
                filtered.info.push(chain);
            }
        }

        filtered
    }

    fn get_full_leaf_certificate_info_internal(
        &mut self,
        params: CertificateQueryParams,
    ) -> GetCertificateFullInfoResult {
        let certificate_type = params.certificate_type;

        info!(
            "Requesting leaf certificate info: {certificate_type} ({})",
            params.encoding
        );

        let mut result = GetCertificateFullInfoResult {
            status: GetCertificateInfoStatus::NotFound,
            info: Vec::new(),
        };

        let Some((cert_dir, key_dir, root_type)) = self.leaf_directories_of(certificate_type)
        else {
            warn!("Rejected attempt to retrieve non CSMS/V2G key pair");
            result.status = GetCertificateInfoStatus::Rejected;
            return result;
        };

        let Some(root_dir) = self.ca_bundle_paths.get(&root_type).cloned() else {
            result.status = GetCertificateInfoStatus::NotFound;
            return result;
        };

        let leaf_certificates = match CertificateBundle::from_path(&cert_dir) {
            Ok(bundle) => bundle,
            Err(_) => {
                warn!("Leaf certificate load exception");
                result.status = GetCertificateInfoStatus::NotFound;
                return result;
            }
        };

        if leaf_certificates.is_empty() {
            warn!("Could not find any key pair");
            result.status = GetCertificateInfoStatus::NotFound;
            return result;
        }

        struct LeafKeyPair {
            certificate: Certificate,
            certificate_key: PathBuf,
        }

        let password = self.password_string();

        let mut valid_leafs: Vec<LeafKeyPair> = Vec::new();
        let mut any_valid_certificate = false;
        let mut any_valid_key = false;

        // Iterate all chains from the newest leaf to the oldest
        leaf_certificates.for_each_chain_ordered(
            |file, chain| {
                let mut is_valid = false;
                if let Some(leaf) = chain.first() {
                    is_valid |= leaf.is_valid();
                    if params.include_future_valid {
                        is_valid |= leaf.is_valid_in_future();
                    }
                }

                if !is_valid {
                    return true;
                }

                any_valid_certificate = true;

                let leaf = &chain[0];
                let Some(key_path) =
                    private_key_path_of_certificate(leaf, &key_dir, password.as_deref())
                else {
                    return true;
                };

                any_valid_key = true;

                // A leaf present in both its single and its chain file
                // would otherwise be reported twice
                let duplicate = params.remove_duplicates
                    && valid_leafs.iter().any(|pair| pair.certificate == *leaf);

                if !duplicate {
                    valid_leafs.push(LeafKeyPair {
                        certificate: leaf.clone(),
                        certificate_key: key_path,
                    });
                }

                info!("Found valid leaf: [{}]", file.display());

                if !params.include_all_valid {
                    return false;
                }

                true
            },
            |a, b| {
                let a_to = a.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                let b_to = b.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                b_to.cmp(&a_to)
            },
        );

        if !any_valid_certificate {
            warn!("Could not find valid certificate");
            result.status = GetCertificateInfoStatus::NotFoundValid;
            return result;
        }

        if !any_valid_key {
            warn!("Could not find private key for the valid certificate");
            result.status = GetCertificateInfoStatus::PrivateKeyNotFound;
            return result;
        }

        for valid_leaf in &valid_leafs {
            let certificate = &valid_leaf.certificate;

            // Locate both the full chain file and the single-leaf file
            let mut leaf_fullchain: Option<(PathBuf, Vec<Certificate>)> = None;
            let mut leaf_single: Option<(PathBuf, Vec<Certificate>)> = None;

            leaf_certificates.for_each_chain(|file, chain| {
                if chain.iter().any(|member| member == certificate) {
                    if chain.len() > 1 {
                        leaf_fullchain = Some((file.to_path_buf(), chain.to_vec()));
                    } else if chain.len() == 1 {
                        leaf_single = Some((file.to_path_buf(), chain.to_vec()));
                    }
                }

                leaf_fullchain.is_none() || leaf_single.is_none()
            });

            if leaf_fullchain.is_none() && leaf_single.is_none() {
                error!("Could not find any leaf certificate for: {certificate_type}");
                continue;
            }

            let chain_file = leaf_fullchain.as_ref().map(|(file, _)| file.clone());
            let certificate_file = leaf_single.as_ref().map(|(file, _)| file.clone());
            let chain_len = leaf_fullchain
                .as_ref()
                .map(|(_, chain)| chain.len())
                .unwrap_or(1);

            let mut certificate_ocsp: Vec<CertificateOcsp> = Vec::new();
            let mut leafs_root: Option<String> = None;

            if params.include_ocsp || params.include_root {
                let hierarchy = CertificateBundle::from_path(&root_dir)
                    .map_err(Error::from)
                    .and_then(|root_bundle| {
                        CertificateHierarchy::build_with_leaves(
                            root_bundle.split(),
                            leaf_certificates.split(),
                        )
                    });

                let hierarchy = match hierarchy {
                    Ok(hierarchy) => hierarchy,
                    Err(e) => {
                        warn!("Could not build root hierarchy: {e}");
                        continue;
                    }
                };

                if params.include_ocsp {
                    if let Some((_, chain)) = &leaf_fullchain {
                        for chain_certificate in chain {
                            match hierarchy.get_certificate_hash(chain_certificate) {
                                Ok(hash) => {
                                    let data = self.retrieve_ocsp_cache_internal(&hash);
                                    certificate_ocsp.push(CertificateOcsp {
                                        hash: Some(hash),
                                        ocsp_path: data,
                                    });
                                }
                                // Always add, preserving the file order
                                Err(_) => certificate_ocsp.push(CertificateOcsp {
                                    hash: None,
                                    ocsp_path: None,
                                }),
                            }
                        }
                    } else if let Some((_, single)) = &leaf_single {
                        if let Ok(hash) = hierarchy.get_certificate_hash(&single[0]) {
                            let data = self.retrieve_ocsp_cache_internal(&hash);
                            certificate_ocsp.push(CertificateOcsp {
                                hash: Some(hash),
                                ocsp_path: data,
                            });
                        }
                    }
                }

                if params.include_root {
                    let top = leaf_fullchain
                        .as_ref()
                        .map(|(_, chain)| &chain[0])
                        .or_else(|| leaf_single.as_ref().map(|(_, chain)| &chain[0]));

                    if let Some(top) = top {
                        match hierarchy.find_certificate_root(top) {
                            Some(root_certificate) => {
                                leafs_root = root_certificate.export_string().ok();
                            }
                            None => warn!(
                                "Root required for [{certificate_type}] leaf certificate, but no root could be found"
                            ),
                        }
                    }
                }
            }

            result.info.push(CertificateInfo {
                key: valid_leaf.certificate_key.clone(),
                certificate: chain_file,
                certificate_single: certificate_file,
                certificate_count: chain_len,
                password: password.clone(),
                ocsp: certificate_ocsp,
                certificate_root: leafs_root,
            });
            result.status = GetCertificateInfoStatus::Accepted;
        }

        if result.info.is_empty() {
            result.status = GetCertificateInfoStatus::NotFound;
        }

        result
    }

    fn update_certificate_links(&mut self) -> bool {
        let mut changed = false;

        let cert_link_path = self.links.secc_leaf_cert_link.clone();
        let key_link_path = self.links.secc_leaf_key_link.clone();
        let chain_link_path = self.links.cpo_cert_chain_link.clone();

        // Most recent valid leaf with a key
        let key_pair = self.get_leaf_certificate_info_internal(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );

        if let (GetCertificateInfoStatus::Accepted, Some(info)) = (key_pair.status, key_pair.info) {
            if let Some(link) = &cert_link_path {
                if let Some(cert_path) = &info.certificate_single {
                    changed |= update_symlink(link, cert_path);
                }
            }

            if let Some(link) = &key_link_path {
                changed |= update_symlink(link, &info.key);
            }

            if let Some(link) = &chain_link_path {
                if let Some(chain_path) = &info.certificate {
                    changed |= update_symlink(link, chain_path);
                }
            }
        } else {
            // No valid leaf: drop the exposed links
            for link in [&cert_link_path, &key_link_path, &chain_link_path]
                .into_iter()
                .flatten()
            {
                if link.is_symlink() {
                    if let Err(e) = fs::remove_file(link) {
                        error!("Could not remove link {}: {e}", link.display());
                    } else {
                        changed = true;
                    }
                }
            }
        }

        changed
    }

    fn get_ca_certificate_info(
        &mut self,
        certificate_type: CaCertificateType,
    ) -> GetCertificateInfoResult {
        self.get_ca_certificate_info_internal(certificate_type)
    }

    fn get_ca_certificate_info_internal(
        &self,
        certificate_type: CaCertificateType,
    ) -> GetCertificateInfoResult {
        let Some(path) = self.ca_bundle_paths.get(&certificate_type) else {
            return GetCertificateInfoResult {
                status: GetCertificateInfoStatus::NotFound,
                info: None,
            };
        };

        match CertificateBundle::from_path(path) {
            Ok(mut verify_file) => {
                info!(
                    "Requesting certificate file: [{certificate_type}] file: {}",
                    verify_file.path().display()
                );

                if verify_file.is_using_directory() {
                    // Use the first valid self-signed root file
                    if let Ok(hierarchy) = verify_file.hierarchy() {
                        for root in hierarchy.roots() {
                            if !root.certificate.is_self_signed() || !root.certificate.is_valid() {
                                continue;
                            }

                            if let Some(file) = root.certificate.file() {
                                return GetCertificateInfoResult {
                                    status: GetCertificateInfoStatus::Accepted,
                                    info: Some(CertificateInfo {
                                        key: PathBuf::new(),
                                        certificate: Some(file.to_path_buf()),
                                        certificate_single: Some(file.to_path_buf()),
                                        certificate_count: 1,
                                        password: None,
                                        ocsp: Vec::new(),
                                        certificate_root: None,
                                    }),
                                };
                            }
                        }
                    }
                } else {
                    return GetCertificateInfoResult {
                        status: GetCertificateInfoStatus::Accepted,
                        info: Some(CertificateInfo {
                            key: PathBuf::new(),
                            certificate: Some(verify_file.path().to_path_buf()),
                            certificate_single: Some(verify_file.path().to_path_buf()),
                            certificate_count: verify_file.certificate_count(),
                            password: None,
                            ocsp: Vec::new(),
                            certificate_root: None,
                        }),
                    };
                }
            }
            Err(e) => error!(
                "Could not obtain verify file, wrong format for certificate: {} with error: {e}",
                path.display()
            ),
        }

        error!("Could not find any CA certificate for: {certificate_type}");
        GetCertificateInfoResult {
            status: GetCertificateInfoStatus::NotFound,
            info: None,
        }
    }

    fn get_verify_file(&mut self, certificate_type: CaCertificateType) -> String {
        let result = self.get_ca_certificate_info_internal(certificate_type);

        if result.status == GetCertificateInfoStatus::Accepted {
            if let Some(certificate) = result.info.and_then(|info| info.certificate) {
                return certificate.to_string_lossy().into_owned();
            }
        }

        String::new()
    }

    fn get_leaf_expiry_days_count(&mut self, certificate_type: LeafCertificateType) -> i64 {
        info!("Requesting certificate expiry: {certificate_type}");

        let key_pair =
            self.get_leaf_certificate_info_internal(certificate_type, EncodingFormat::Pem, false);

        if key_pair.status != GetCertificateInfoStatus::Accepted {
            return 0;
        }

        let Some(certificate_path) = key_pair
            .info
            .and_then(|info| info.certificate.or(info.certificate_single))
        else {
            return 0;
        };

        // The leaf is always first in a chain file
        match CertificateBundle::from_path(&certificate_path) {
            Ok(bundle) => bundle
                .split()
                .first()
                .map(|leaf| leaf.valid_to() / 86400)
                .unwrap_or(0),
            Err(e) => {
                error!("Could not obtain leaf expiry certificate: {e}");
                0
            }
        }
    }

    fn verify_certificate_internal(
        &mut self,
        certificate_chain: &str,
        certificate_types: &[LeafCertificateType],
    ) -> CertificateValidationResult {
        info!("Verifying leaf certificate");

        let mut ca_certificate_types: BTreeSet<CaCertificateType> = BTreeSet::new();
        for certificate_type in certificate_types {
            info!("Including trust anchor for leaf certificate: {certificate_type}");
            ca_certificate_types.insert(certificate_type.ca_certificate_type());
        }

        if ca_certificate_types.is_empty() {
            warn!("No valid CA certificate types could be determined from leaf types");
            return CertificateValidationResult::IssuerNotFound;
        }

        let bundle =
            match CertificateBundle::from_data(certificate_chain.as_bytes(), EncodingFormat::Pem) {
                Ok(bundle) => bundle,
                Err(_) => {
                    warn!("Could not validate certificate chain because of invalid format");
                    return CertificateValidationResult::Unknown;
                }
            };

        let chain = bundle.split();
        if chain.is_empty() {
            return CertificateValidationResult::Unknown;
        }

        // The leaf is to be verified
        let leaf_certificate = &chain[0];

        // Untrusted intermediates from the chain, excluding any root
        let mut untrusted_subcas = Vec::new();
        for certificate in &chain[1..] {
            if certificate.is_self_signed() {
                warn!("Ignore root certificate: {}", certificate.common_name());
            } else {
                untrusted_subcas.push(certificate.to_x509());
            }
        }

        // Trusted parents from our internal store. A root chain is used
        // instead of OpenSSL store directories, which would require
        // subject-hash file naming
        let mut trusted_parent_certificates = Vec::new();
        for ca_type in &ca_certificate_types {
            if !self.is_ca_certificate_installed_internal(*ca_type) {
                continue;
            }

            let Some(root_store) = self.ca_bundle_paths.get(ca_type) else {
                continue;
            };

            match CertificateBundle::from_path(root_store) {
                Ok(roots) => {
                    for root_certificate in roots.split() {
                        trusted_parent_certificates.push(root_certificate.to_x509());
                    }
                }
                Err(e) => warn!("Could not load trust anchors: {e}"),
            }
        }

        if trusted_parent_certificates.is_empty() {
            return CertificateValidationResult::IssuerNotFound;
        }

        crypto::verify_certificate_chain(
            leaf_certificate.x509(),
            &trusted_parent_certificates,
            &untrusted_subcas,
            true,
            None,
            None,
        )
    }

    fn verify_file_signature(
        &self,
        path: &Path,
        signing_certificate: &str,
        signature: &str,
    ) -> bool {
        info!("Verifying file signature for {}", path.display());

        let signature_decoded = crypto::base64_decode_to_bytes(signature);
        if signature_decoded.is_empty() {
            error!("Error during decoding signature: {signature}");
            return false;
        }

        let certificate =
            match Certificate::from_data(signing_certificate.as_bytes(), EncodingFormat::Pem) {
                Ok(certificate) => certificate,
                Err(e) => {
                    error!("Could not parse signing certificate: {e}");
                    return false;
                }
            };

        match crypto::verify_file_signature(certificate.x509(), &signature_decoded, path) {
            Ok(true) => {
                debug!("Signature verified successfully");
                true
            }
            Ok(false) => {
                error!("Failure to verify signature");
                false
            }
            Err(e) => {
                error!("Error during file signature verification: {e}");
                false
            }
        }
    }

    /// Total tracked files exceed either the entry cap or the byte cap.
    fn is_filesystem_full(&self) -> bool {
        let mut unique_paths: BTreeSet<PathBuf> = BTreeSet::new();

        let mut collect = |path: &Path| {
            if path.is_file() {
                unique_paths.insert(path.to_path_buf());
            } else if path.is_dir() {
                if let Ok(files) = fs_utils::enumerate_files(path) {
                    unique_paths.extend(files);
                }
            }
        };

        for bundle_path in self.ca_bundle_paths.values() {
            collect(bundle_path);
        }

        collect(&self.directories.csms_leaf_cert_directory);
        collect(&self.directories.csms_leaf_key_directory);
        collect(&self.directories.secc_leaf_cert_directory);
        collect(&self.directories.secc_leaf_key_directory);

        let total_entries = unique_paths.len() as u64;
        debug!("Total entries used: {total_entries}");

        if total_entries > self.max_fs_certificate_store_entries {
            warn!(
                "Exceeded maximum entries: {} with: {total_entries} total entries",
                self.max_fs_certificate_store_entries
            );
            return true;
        }

        let mut total_size_bytes: u64 = 0;
        for path in &unique_paths {
            total_size_bytes += fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        }

        debug!("Total bytes used: {total_size_bytes}");
        if total_size_bytes >= self.max_fs_usage_bytes {
            warn!("Exceeded maximum byte size: {total_size_bytes}");
            return true;
        }

        false
    }

    /// One garbage collection pass: drop expired leaf chains beyond the
    /// protected newest entries, expire unfulfilled CSR keys and sweep
    /// orphaned OCSP side-car entries. Best effort throughout.
    fn garbage_collect(&mut self) {
        // Only collect when the store is full
        if !self.is_filesystem_full() {
            debug!("Garbage collect postponed, filesystem is not full");
            return;
        }

        info!("Starting garbage collect");

        let leaf_paths = [
            (
                self.directories.csms_leaf_cert_directory.clone(),
                self.directories.csms_leaf_key_directory.clone(),
                CaCertificateType::Csms,
            ),
            (
                self.directories.secc_leaf_cert_directory.clone(),
                self.directories.secc_leaf_key_directory.clone(),
                CaCertificateType::V2g,
            ),
        ];

        let password = self.password_string();

        // Certificates go first; dangling keys are handled afterwards
        let mut invalid_certificate_files: BTreeSet<PathBuf> = BTreeSet::new();

        // Keys paired with protected certificates are never deleted
        let mut protected_private_keys: BTreeSet<PathBuf> = BTreeSet::new();

        for (cert_dir, key_dir, ca_type) in &leaf_paths {
            let Some(ca_bundle_path) = self.ca_bundle_paths.get(ca_type) else {
                continue;
            };

            // Roots are required for the OCSP cache hashes
            let root_bundle = match CertificateBundle::from_path(ca_bundle_path) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Could not load bundle from file: {e}");
                    continue;
                }
            };

            let expired_certs = match CertificateBundle::from_path(cert_dir) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Could not load bundle from file: {e}");
                    continue;
                }
            };

            // Only collect above the protected minimum entry count
            if expired_certs.chain_count() <= DEFAULT_MINIMUM_CERTIFICATE_ENTRIES {
                continue;
            }

            let root_split = root_bundle.split();
            let mut skipped = 0usize;

            expired_certs.for_each_chain_ordered(
                |file, chain| {
                    if chain.is_empty() {
                        invalid_certificate_files.insert(file.to_path_buf());
                        return true;
                    }

                    skipped += 1;
                    if skipped > DEFAULT_MINIMUM_CERTIFICATE_ENTRIES {
                        // Beyond the protected newest entries: collect the
                        // expired ones with their keys and OCSP data
                        if chain[0].is_expired() {
                            invalid_certificate_files.insert(file.to_path_buf());

                            if let Some(key_file) = private_key_path_of_certificate(
                                &chain[0],
                                key_dir,
                                password.as_deref(),
                            ) {
                                invalid_certificate_files.insert(key_file);
                            }

                            match CertificateHierarchy::build_with_leaves(
                                root_split.clone(),
                                chain.to_vec(),
                            ) {
                                Ok(hierarchy) => {
                                    if let Ok(hash) = hierarchy.get_certificate_hash(&chain[0]) {
                                        if let Some((hash_path, data_path)) =
                                            ocsp::ocsp_data_of_certificate(&chain[0], &hash)
                                        {
                                            invalid_certificate_files.insert(hash_path);
                                            invalid_certificate_files.insert(data_path);
                                        }
                                    }
                                }
                                Err(e) => warn!("Could not build hierarchy: {e}"),
                            }
                        }
                    } else if let Some(key_file) = private_key_path_of_certificate(
                        &chain[0],
                        key_dir,
                        password.as_deref(),
                    ) {
                        protected_private_keys.insert(key_file);
                    }

                    true
                },
                |a, b| {
                    // Newest first; those are kept even when expired
                    let a_to = a.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                    let b_to = b.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                    b_to.cmp(&a_to)
                },
            );
        }

        // Protected keys are paired, they are no longer pending CSRs
        for key_file in &protected_private_keys {
            self.managed_csrs.remove(key_file);
        }

        for expired_file in &invalid_certificate_files {
            if fs_utils::delete_file(expired_file) {
                info!("Deleted expired certificate file: {}", expired_file.display());
            } else {
                warn!(
                    "Error deleting expired certificate file: {}",
                    expired_file.display()
                );
            }
        }

        // After a restart the pending CSR table is lost. Re-track orphan
        // keys instead of deleting them outright, so a late CSR response
        // that arrives after a reboot can still be paired; the keys expire
        // through the table eventually
        for (cert_dir, key_dir, _) in &leaf_paths {
            let key_files = match fs_utils::enumerate_files(key_dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!("Could not scan key directory: {e}");
                    continue;
                }
            };

            for key_file in key_files {
                if protected_private_keys.contains(&key_file) {
                    continue;
                }

                if !fs_utils::is_keyfile(&key_file) {
                    continue;
                }

                let orphaned =
                    match certificate_paths_of_key(&key_file, cert_dir, password.as_deref()) {
                        Ok(_) => false,
                        Err(Error::NoCertificateValid(_)) => {
                            debug!(
                                "Could not find matching certificate for key: {}, tracking for deletion",
                                key_file.display()
                            );
                            true
                        }
                        Err(Error::NoPrivateKey(_)) => {
                            debug!(
                                "Could not load private key: {}, tracking for deletion",
                                key_file.display()
                            );
                            true
                        }
                        Err(_) => false,
                    };

                if orphaned && !self.managed_csrs.contains_key(&key_file) {
                    self.managed_csrs.insert(key_file, Instant::now());
                }
            }
        }

        // Expire pending CSR keys that never received their certificate
        let now = Instant::now();
        let csr_expiry = self.csr_expiry;
        self.managed_csrs.retain(|key_file, issued_at| {
            if now.duration_since(*issued_at) > csr_expiry {
                debug!("Found expired csr key, deleting: {}", key_file.display());
                fs_utils::delete_file(key_file);
                false
            } else {
                true
            }
        });

        // Sweep OCSP side-car entries whose certificate is gone
        let mut invalid_ocsp_files: BTreeSet<PathBuf> = BTreeSet::new();

        for (cert_dir, _, ca_type) in &leaf_paths {
            let Some(ca_bundle_path) = self.ca_bundle_paths.get(ca_type) else {
                continue;
            };

            let loaded = (|| -> crate::error::Result<(CertificateBundle, CertificateBundle)> {
                Ok((
                    CertificateBundle::from_path(ca_bundle_path)?,
                    CertificateBundle::from_path(cert_dir)?,
                ))
            })();

            let (root_bundle, leaf_bundle) = match loaded {
                Ok(bundles) => bundles,
                Err(e) => {
                    warn!("Could not load ca bundle from file: {e}");
                    continue;
                }
            };

            let root_ocsp = if root_bundle.is_using_bundle_file() {
                root_bundle
                    .path()
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join("ocsp")
            } else {
                root_bundle.path().join("ocsp")
            };

            let leaf_ocsp = if leaf_bundle.is_using_bundle_file() {
                leaf_bundle
                    .path()
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join("ocsp")
            } else {
                leaf_bundle.path().join("ocsp")
            };

            // Roots are required for correct certificate hashes
            let hierarchy = match CertificateHierarchy::build_with_leaves(
                root_bundle.split(),
                leaf_bundle.split(),
            ) {
                Ok(hierarchy) => hierarchy,
                Err(e) => {
                    warn!("Could not build hierarchy: {e}");
                    continue;
                }
            };

            for ocsp_dir in [&leaf_ocsp, &root_ocsp] {
                if !ocsp_dir.exists() {
                    continue;
                }

                let entries = match fs::read_dir(ocsp_dir) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!("Could not iterate ocsp dir: {e}");
                        continue;
                    }
                };

                for entry in entries.flatten() {
                    let entry_path = entry.path();
                    if !entry_path.is_file() {
                        continue;
                    }

                    let Some(read_hash) = fs_utils::read_hash_from_file(&entry_path) else {
                        continue;
                    };

                    // The certificate was deleted from under this entry
                    if !hierarchy.contains_certificate_hash(&read_hash, true) {
                        let mut data_path = entry_path.clone();
                        data_path.set_extension(crate::types::DER_EXTENSION);

                        invalid_ocsp_files.insert(entry_path);
                        invalid_ocsp_files.insert(data_path);
                    }
                }
            }
        }

        for invalid_ocsp in &invalid_ocsp_files {
            if fs_utils::delete_file(invalid_ocsp) {
                info!("Deleted invalid ocsp file: {}", invalid_ocsp.display());
            } else {
                warn!("Error deleting invalid ocsp file: {}", invalid_ocsp.display());
            }
        }
    }
}
