//! Filesystem helpers for the certificate store: whole-file reads and
//! writes, managed-name generation and the OCSP side-car hash file codec.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use rand::Rng;
use tracing::error;

use crate::error::{Error, Result};
use crate::types::{
    CertificateHashData, HashAlgorithm, CERT_HASH_EXTENSION, CUSTOM_KEY_EXTENSION, DER_EXTENSION,
    KEY_EXTENSION, PEM_EXTENSION,
};

/// Hex length of a SHA-256 digest, the fixed width of the two hash fields
/// inside a side-car hash file.
const SHA256_HEX_LEN: usize = 64;

pub fn is_certificate_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some(PEM_EXTENSION) | Some(DER_EXTENSION)
        )
}

pub fn is_keyfile(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some(KEY_EXTENSION) | Some(CUSTOM_KEY_EXTENSION)
        )
}

/// True when `path` points below `base` (path prefix, no symlink
/// resolution).
pub fn is_subdirectory(base: &Path, path: &Path) -> bool {
    path.starts_with(base)
}

pub fn read_from_file(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a regular file: {}", path.display()),
        )));
    }

    Ok(fs::read_to_string(path)?)
}

pub fn write_to_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Delete a regular file, logging on failure. Returns false when the path
/// is not a regular file or the removal failed.
pub fn delete_file(path: &Path) -> bool {
    if path.is_file() {
        match fs::remove_file(path) {
            Ok(()) => return true,
            Err(e) => {
                error!("Error deleting file {}: {e}", path.display());
                return false;
            }
        }
    }

    error!("Error deleting file, not a regular file: {}", path.display());
    false
}

/// Create an empty file unless something already exists at the path.
/// Fails when the path names an existing directory.
pub fn create_file_if_nonexistent(path: &Path) -> Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::File::create(path)?;
        return Ok(());
    }

    if path.is_dir() {
        return Err(Error::InvalidOperation(format!(
            "attempting to create file over existing directory: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Create an empty file or a directory at the path unless one exists. A
/// path with an extension becomes a file, an extensionless path a
/// directory.
pub fn create_file_or_dir_if_nonexistent(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    if path.extension().is_some() {
        create_file_if_nonexistent(path)
    } else {
        fs::create_dir_all(path)?;
        Ok(())
    }
}

/// Recursively enumerate certificate files below `dir`, skipping the OCSP
/// side-car directories which hold DER responses rather than
/// certificates. Order is deterministic (sorted per directory).
pub fn enumerate_certificate_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries: Vec<PathBuf> = fs::read_dir(&current)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for entry in entries {
            if entry.is_dir() {
                if entry.file_name().and_then(|n| n.to_str()) != Some("ocsp") {
                    pending.push(entry);
                }
            } else if is_certificate_file(&entry) {
                found.push(entry);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Recursively enumerate every regular file below `dir`.
pub fn enumerate_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries: Vec<PathBuf> = fs::read_dir(&current)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for entry in entries {
            if entry.is_dir() {
                pending.push(entry);
            } else if entry.is_file() {
                found.push(entry);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Generate a unique managed file name with the given suffix, for example
/// `M07_D28_Y2026_H10_M30_S12_i4_r1283912.pem`. The name embeds the UTC
/// timestamp, a process-wide counter and a random component.
pub fn random_file_name(suffix: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let stamp = Utc::now().format("M%m_D%d_Y%Y_H%H_M%M_S%S");
    let increment = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let random: u32 = rand::thread_rng().gen_range(1..u32::MAX);

    format!("{stamp}_i{increment}_r{random}{suffix}")
}

/// Read certificate hash data from a side-car `.hash` file.
///
/// The file holds the issuer name hash, the issuer key hash and the
/// serial number concatenated without separators; the two hashes are
/// fixed-width lowercase hex.
pub fn read_hash_from_file(path: &Path) -> Option<CertificateHashData> {
    if path.extension().and_then(|e| e.to_str()) != Some(CERT_HASH_EXTENSION) {
        return None;
    }

    let contents = match read_from_file(path) {
        Ok(data) => data,
        Err(e) => {
            error!("Error reading cert hash file {}: {e}", path.display());
            return None;
        }
    };

    let contents = contents.trim();
    if contents.len() <= 2 * SHA256_HEX_LEN {
        error!("Malformed cert hash file: {}", path.display());
        return None;
    }

    let (issuer_name_hash, rest) = contents.split_at(SHA256_HEX_LEN);
    let (issuer_key_hash, serial_number) = rest.split_at(SHA256_HEX_LEN);

    if !issuer_name_hash.chars().all(|c| c.is_ascii_hexdigit())
        || !issuer_key_hash.chars().all(|c| c.is_ascii_hexdigit())
        || !serial_number.chars().all(|c| c.is_ascii_hexdigit())
    {
        error!("Malformed cert hash file: {}", path.display());
        return None;
    }

    Some(CertificateHashData {
        hash_algorithm: HashAlgorithm::Sha256,
        issuer_name_hash: issuer_name_hash.to_string(),
        issuer_key_hash: issuer_key_hash.to_string(),
        serial_number: serial_number.to_string(),
    })
}

/// Write certificate hash data to a side-car `.hash` file, replacing the
/// extension when the given path carries a different one.
pub fn write_hash_to_file(path: &Path, hash: &CertificateHashData) -> Result<PathBuf> {
    let mut real_path = path.to_path_buf();
    if real_path.extension().and_then(|e| e.to_str()) != Some(CERT_HASH_EXTENSION) {
        real_path.set_extension(CERT_HASH_EXTENSION);
    }

    let serialized = format!(
        "{}{}{}",
        hash.issuer_name_hash, hash.issuer_key_hash, hash.serial_number
    );
    write_to_file(&real_path, serialized.as_bytes())?;

    Ok(real_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> CertificateHashData {
        CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: "a".repeat(64),
            issuer_key_hash: "b".repeat(64),
            serial_number: "1f03e4".to_string(),
        }
    }

    #[test]
    fn hash_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("entry.hash");

        let written = write_hash_to_file(&path, &sample_hash()).expect("write hash");
        assert_eq!(written, path);

        let read = read_hash_from_file(&path).expect("read hash");
        assert_eq!(read, sample_hash());
    }

    #[test]
    fn hash_file_extension_is_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("entry.der");

        let written = write_hash_to_file(&path, &sample_hash()).expect("write hash");
        assert_eq!(written, dir.path().join("entry.hash"));

        // A non-hash extension is not read back
        assert!(read_hash_from_file(&path).is_none());
    }

    #[test]
    fn truncated_hash_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("entry.hash");
        write_to_file(&path, b"deadbeef").expect("write");

        assert!(read_hash_from_file(&path).is_none());
    }

    #[test]
    fn random_file_names_are_unique() {
        let a = random_file_name(".pem");
        let b = random_file_name(".pem");

        assert!(a.ends_with(".pem"));
        assert_ne!(a, b);
    }

    #[test]
    fn subdirectory_check() {
        assert!(is_subdirectory(
            Path::new("/certs/ca"),
            Path::new("/certs/ca/v2g/root.pem")
        ));
        assert!(!is_subdirectory(
            Path::new("/certs/ca"),
            Path::new("/certs/client/root.pem")
        ));
    }
}
