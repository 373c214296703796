//! A mutable collection of certificates tied to one on-disk source.
//!
//! A bundle is backed by a single PEM file, a directory of certificate
//! files, or a raw in-memory string. Mutations are in-memory only until
//! [`CertificateBundle::export`] re-synchronizes the disk representation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::crypto;
use crate::error::{Error, Result};
use crate::fs_utils;
use crate::types::{CertificateHashData, EncodingFormat, DER_EXTENSION};
use crate::x509_hierarchy::CertificateHierarchy;
use crate::x509_wrapper::{Certificate, CertificateSource};

/// Certificates grouped by the chain file they live in, plus the cached
/// hierarchy view. For FILE sources the map has exactly one key (the
/// bundle path); for STRING sources the single key is empty.
pub struct CertificateBundle {
    certificates: BTreeMap<PathBuf, Vec<Certificate>>,
    path: PathBuf,
    source: CertificateSource,
    hierarchy: Option<CertificateHierarchy>,
}

fn encoding_for(path: &Path) -> EncodingFormat {
    if path.extension().and_then(|e| e.to_str()) == Some(DER_EXTENSION) {
        EncodingFormat::Der
    } else {
        EncodingFormat::Pem
    }
}

impl CertificateBundle {
    /// Open a bundle from a file or directory, creating an empty file (or
    /// directory, for extensionless paths) when nothing exists yet.
    pub fn from_path(path: &Path) -> Result<Self> {
        fs_utils::create_file_or_dir_if_nonexistent(path)?;

        let mut bundle = Self {
            certificates: BTreeMap::new(),
            path: path.to_path_buf(),
            source: CertificateSource::File,
            hierarchy: None,
        };

        if path.is_dir() {
            bundle.source = CertificateSource::Directory;

            for file in fs_utils::enumerate_certificate_files(path)? {
                let data = fs::read(&file)?;
                bundle.add_certificates_from_data(&data, encoding_for(&file), Some(file))?;
            }
        } else if fs_utils::is_certificate_file(path) {
            let data = fs::read(path)?;
            bundle.add_certificates_from_data(
                &data,
                encoding_for(path),
                Some(path.to_path_buf()),
            )?;
        } else {
            return Err(Error::CertificateLoad(format!(
                "failed to create certificate bundle from path: {}",
                path.display()
            )));
        }

        Ok(bundle)
    }

    /// Build an in-memory bundle from raw certificate data. Export is not
    /// available for string-sourced bundles.
    pub fn from_data(data: &[u8], encoding: EncodingFormat) -> Result<Self> {
        let mut bundle = Self {
            certificates: BTreeMap::new(),
            path: PathBuf::new(),
            source: CertificateSource::String,
            hierarchy: None,
        };

        bundle.add_certificates_from_data(data, encoding, None)?;
        Ok(bundle)
    }

    fn add_certificates_from_data(
        &mut self,
        data: &[u8],
        encoding: EncodingFormat,
        file: Option<PathBuf>,
    ) -> Result<()> {
        let loaded = crypto::load_certificates(data, encoding)?;

        let key = file.clone().unwrap_or_default();
        let chain = self.certificates.entry(key).or_default();
        for x509 in loaded {
            chain.push(Certificate::new(x509, file.clone())?);
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> CertificateSource {
        self.source
    }

    pub fn is_using_directory(&self) -> bool {
        self.source == CertificateSource::Directory
    }

    pub fn is_using_bundle_file(&self) -> bool {
        self.source == CertificateSource::File
    }

    pub fn is_empty(&self) -> bool {
        self.certificate_count() == 0
    }

    /// Total number of contained certificates across all chains.
    pub fn certificate_count(&self) -> usize {
        self.certificates.values().map(Vec::len).sum()
    }

    /// Number of chain files tracked by the bundle.
    pub fn chain_count(&self) -> usize {
        self.certificates.len()
    }

    /// Flatten all chains into one list of certificates.
    pub fn split(&self) -> Vec<Certificate> {
        self.certificates
            .values()
            .flat_map(|chain| chain.iter().cloned())
            .collect()
    }

    /// Visit every `(chain file, certificates)` pair while the function
    /// returns true.
    pub fn for_each_chain(&self, mut func: impl FnMut(&Path, &[Certificate]) -> bool) {
        for (file, chain) in &self.certificates {
            if !func(file, chain) {
                break;
            }
        }
    }

    /// Same as [`Self::for_each_chain`], visiting chains in the order
    /// established by `order`.
    pub fn for_each_chain_ordered(
        &self,
        mut func: impl FnMut(&Path, &[Certificate]) -> bool,
        order: impl Fn(&[Certificate], &[Certificate]) -> std::cmp::Ordering,
    ) {
        let mut chains: Vec<(&PathBuf, &Vec<Certificate>)> = self.certificates.iter().collect();
        chains.sort_by(|a, b| order(a.1, b.1));

        for (file, chain) in chains {
            if !func(file, chain) {
                break;
            }
        }
    }

    pub fn contains_certificate(&self, certificate: &Certificate) -> bool {
        self.certificates
            .values()
            .any(|chain| chain.iter().any(|c| c == certificate))
    }

    /// A certificate with the given hash is contained. Roots match
    /// directly; everything else resolves through the hierarchy.
    pub fn contains_certificate_hash(&mut self, hash: &CertificateHashData) -> Result<bool> {
        for chain in self.certificates.values() {
            let found = chain
                .iter()
                .any(|c| c.is_self_signed() && c.matches_hash_data(hash, false));
            if found {
                return Ok(true);
            }
        }

        Ok(self.hierarchy()?.contains_certificate_hash(hash, true))
    }

    /// Find a certificate by hash, resolving non-roots through the
    /// hierarchy.
    pub fn find_certificate(
        &mut self,
        hash: &CertificateHashData,
        ignore_case: bool,
    ) -> Result<Option<Certificate>> {
        for chain in self.certificates.values() {
            for certificate in chain {
                if certificate.is_self_signed() && certificate.matches_hash_data(hash, ignore_case)
                {
                    return Ok(Some(certificate.clone()));
                }
            }
        }

        Ok(self.hierarchy()?.find_certificate(hash, ignore_case))
    }

    /// Add a certificate in memory. Directory bundles only accept
    /// certificates whose file lies below the bundle root.
    pub fn add_certificate(&mut self, certificate: Certificate) -> Result<()> {
        let key = match self.source {
            CertificateSource::Directory => {
                let file = certificate
                    .file()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();

                if !fs_utils::is_subdirectory(&self.path, &file) {
                    return Err(Error::InvalidOperation(format!(
                        "added certificate must reside under the bundle directory: {}",
                        self.path.display()
                    )));
                }

                file
            }
            CertificateSource::File => self.path.clone(),
            CertificateSource::String => PathBuf::new(),
        };

        self.certificates.entry(key).or_default().push(certificate);
        self.invalidate_hierarchy();
        Ok(())
    }

    /// Add a certificate unless an equal one is already contained.
    pub fn add_certificate_unique(&mut self, certificate: Certificate) -> Result<()> {
        if !self.contains_certificate(&certificate) {
            self.add_certificate(certificate)?;
        }

        Ok(())
    }

    /// Replace an already contained certificate by equality. Returns false
    /// when no equal certificate is present.
    pub fn update_certificate(&mut self, certificate: Certificate) -> bool {
        for chain in self.certificates.values_mut() {
            for contained in chain.iter_mut() {
                if *contained == certificate {
                    *contained = certificate;
                    self.hierarchy = None;
                    return true;
                }
            }
        }

        false
    }

    /// Delete every instance of the certificate, and of its descendants
    /// when `include_issued` is set. Returns the deleted certificates.
    pub fn delete_certificate(
        &mut self,
        certificate: &Certificate,
        include_issued: bool,
    ) -> Result<Vec<Certificate>> {
        let mut to_delete = Vec::new();

        if include_issued {
            to_delete.extend(self.hierarchy()?.collect_descendants(certificate));
        }
        to_delete.push(certificate.clone());

        let mut deleted = Vec::new();
        for chain in self.certificates.values_mut() {
            chain.retain(|contained| {
                if to_delete.contains(contained) {
                    deleted.push(contained.clone());
                    false
                } else {
                    true
                }
            });
        }

        if !deleted.is_empty() {
            self.invalidate_hierarchy();
        }

        Ok(deleted)
    }

    /// Delete by hash, resolving the target through the hierarchy first.
    pub fn delete_certificate_by_hash(
        &mut self,
        hash: &CertificateHashData,
        include_issued: bool,
    ) -> Result<Vec<Certificate>> {
        let target = self.hierarchy()?.find_certificate(hash, true);

        match target {
            Some(certificate) => self.delete_certificate(&certificate, include_issued),
            None => Ok(Vec::new()),
        }
    }

    pub fn delete_all_certificates(&mut self) {
        self.certificates.clear();
        self.invalidate_hierarchy();
    }

    fn export_chain_string(chain: &[Certificate]) -> Result<String> {
        let mut out = String::new();
        for certificate in chain {
            out.push_str(&certificate.export_string()?);
        }
        Ok(out)
    }

    /// Full PEM rendering of the bundle.
    pub fn to_export_string(&self) -> Result<String> {
        let mut out = String::new();
        for chain in self.certificates.values() {
            out.push_str(&Self::export_chain_string(chain)?);
        }
        Ok(out)
    }

    /// PEM rendering of one contained chain file, empty when unknown.
    pub fn chain_export_string(&self, chain: &Path) -> Result<String> {
        match self.certificates.get(chain) {
            Some(certificates) => Self::export_chain_string(certificates),
            None => Ok(String::new()),
        }
    }

    /// Re-synchronize the on-disk representation with the in-memory
    /// state. Writes are atomic at file granularity; a failed write fails
    /// the export but already committed files remain.
    pub fn export(&mut self) -> Result<()> {
        match self.source {
            CertificateSource::String => Err(Error::InvalidOperation(
                "cannot export a string-sourced bundle".to_string(),
            )),
            CertificateSource::File => {
                if self.certificate_count() == 0 {
                    self.certificates.clear();
                    if self.path.exists() && !fs_utils::delete_file(&self.path) {
                        return Err(Error::Io(std::io::Error::other(
                            "failed to delete emptied bundle file",
                        )));
                    }
                    return Ok(());
                }

                // Write to a separate file and rename to minimise the
                // window for corruption
                let tmp = PathBuf::from(format!("{}$", self.path.display()));
                if tmp.exists() {
                    let _ = fs::remove_file(&tmp);
                }

                fs_utils::write_to_file(&tmp, self.to_export_string()?.as_bytes())?;
                fs::rename(&tmp, &self.path)?;
                Ok(())
            }
            CertificateSource::Directory => {
                let mut success = true;

                let on_disk = fs_utils::enumerate_certificate_files(&self.path)?;
                for file in &on_disk {
                    if !self.certificates.contains_key(file) {
                        if !fs_utils::delete_file(file) {
                            success = false;
                        }
                    }
                }

                for (file, chain) in &self.certificates {
                    if chain.is_empty() {
                        // The last certificate of this chain was deleted
                        if file.exists() && !fs_utils::delete_file(file) {
                            success = false;
                        }
                        continue;
                    }

                    let content = Self::export_chain_string(chain)?;
                    let current = fs_utils::read_from_file(file).ok();

                    if current.as_deref() != Some(content.as_str())
                        && fs_utils::write_to_file(file, content.as_bytes()).is_err()
                    {
                        error!("Could not write chain file: {}", file.display());
                        success = false;
                    }
                }

                self.certificates.retain(|_, chain| !chain.is_empty());

                if success {
                    Ok(())
                } else {
                    Err(Error::Io(std::io::Error::other(
                        "failed to export one or more chain files",
                    )))
                }
            }
        }
    }

    /// Current hierarchy of all contained certificates, rebuilt lazily
    /// after mutations.
    pub fn hierarchy(&mut self) -> Result<&CertificateHierarchy> {
        if self.hierarchy.is_none() {
            debug!("Building new certificate hierarchy");

            let certificates: Vec<Certificate> = self
                .certificates
                .values()
                .flat_map(|chain| chain.iter().cloned())
                .collect();
            self.hierarchy = Some(CertificateHierarchy::build_hierarchy(certificates)?);
        }

        match &self.hierarchy {
            Some(hierarchy) => Ok(hierarchy),
            None => Err(Error::InvalidState("hierarchy cache missing".to_string())),
        }
    }

    fn invalidate_hierarchy(&mut self) {
        self.hierarchy = None;
    }
}
