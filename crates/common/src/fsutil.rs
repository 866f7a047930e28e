//! Filesystem helpers shared by the store and the daemon.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Errors from certificate reading.
#[derive(Debug, Error)]
pub enum CertError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("not a PEM certificate: {0}")]
    Pem(#[from] pem::PemError),

    #[error("invalid X.509 certificate: {0}")]
    X509(String),
}

/// The pieces of a certificate the renewal logic cares about.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
}

/// Whether `path` exists, surfacing errors other than "not found".
pub fn file_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create a symlink at `link` pointing at `target`, replacing any existing
/// file or link at `link`.
pub fn force_symlink(target: &Path, link: &Path) -> io::Result<()> {
    match fs::symlink_metadata(link) {
        Ok(_) => fs::remove_file(link)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, link)
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(io::Error::other)
}

/// Serialize `v` as JSON into `path`, created with `mode`.
pub fn write_json<T: Serialize>(path: &Path, v: &T, mode: u32) -> io::Result<()> {
    let data = serde_json::to_vec(v).map_err(io::Error::other)?;
    write_with_mode(path, &data, mode)
}

/// Write `data` into `path` with the given Unix mode.
pub fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    f.write_all(data)
}

/// Parse the first PEM block of `path` as an X.509 certificate and pull out
/// its expiry and subject alternative names.
pub fn read_cert(path: &Path) -> Result<CertInfo, CertError> {
    let data = fs::read(path)?;
    parse_cert(&data)
}

/// [`read_cert`] over in-memory PEM bytes.
pub fn parse_cert(data: &[u8]) -> Result<CertInfo, CertError> {
    let block = pem::parse(data)?;
    let (_, cert) =
        X509Certificate::from_der(block.contents()).map_err(|e| CertError::X509(e.to_string()))?;

    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| CertError::X509("notAfter out of range".into()))?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_string());
            }
        }
    }
    Ok(CertInfo {
        not_after,
        dns_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::os::unix::fs::PermissionsExt;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Blob {
        name: String,
    }

    #[test]
    fn test_json_roundtrip_with_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob.json");
        let blob = Blob {
            name: "hello".into(),
        };
        write_json(&path, &blob, 0o600).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let got: Blob = read_json(&path).unwrap();
        assert_eq!(got, blob);
    }

    #[test]
    fn test_force_symlink_replaces_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let link = dir.path().join("link");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        force_symlink(&a, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), a);
        force_symlink(&b, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), b);
    }

    #[test]
    fn test_file_exists_distinguishes_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing");
        assert!(!file_exists(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(file_exists(&path).unwrap());
    }
}
