//! Account and certificate key material.
//!
//! Keys are held and stored as PKCS#8 DER. Loading checks that the file on
//! disk actually matches the configured type and size; a mismatch (the
//! operator changed `acme_key`) regenerates the key, which in turn forces
//! the account to be re-registered.

use std::fs;
use std::io;
use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use tracing::debug;

use acmehugger_common::fsutil::write_with_mode;

use crate::error::AcmeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Ec256,
    Ec384,
    Rsa2048,
    Rsa3072,
    Rsa4096,
    Rsa8192,
}

impl KeyType {
    pub fn parse(s: &str) -> Result<Self, AcmeError> {
        match s {
            "ec256" => Ok(KeyType::Ec256),
            "ec384" => Ok(KeyType::Ec384),
            "rsa2048" => Ok(KeyType::Rsa2048),
            "rsa3072" => Ok(KeyType::Rsa3072),
            "rsa4096" => Ok(KeyType::Rsa4096),
            "rsa8192" => Ok(KeyType::Rsa8192),
            _ => Err(AcmeError::InvalidKeyType(s.to_string())),
        }
    }

    /// Curve size or modulus size in bits.
    pub fn size(self) -> usize {
        match self {
            KeyType::Ec256 => 256,
            KeyType::Ec384 => 384,
            KeyType::Rsa2048 => 2048,
            KeyType::Rsa3072 => 3072,
            KeyType::Rsa4096 => 4096,
            KeyType::Rsa8192 => 8192,
        }
    }

    fn is_rsa(self) -> bool {
        matches!(
            self,
            KeyType::Rsa2048 | KeyType::Rsa3072 | KeyType::Rsa4096 | KeyType::Rsa8192
        )
    }

    fn ec_alg(self) -> Option<&'static rcgen::SignatureAlgorithm> {
        match self {
            KeyType::Ec256 => Some(&rcgen::PKCS_ECDSA_P256_SHA256),
            KeyType::Ec384 => Some(&rcgen::PKCS_ECDSA_P384_SHA384),
            _ => None,
        }
    }
}

/// A private key as PKCS#8 DER, tagged with its configured type.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    key_type: KeyType,
    der: Vec<u8>,
}

impl PrivateKey {
    pub fn from_der(key_type: KeyType, der: Vec<u8>) -> Self {
        PrivateKey { key_type, der }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Generate a fresh key of the given type.
    pub fn generate(t: KeyType) -> Result<Self, AcmeError> {
        let der = match t {
            KeyType::Ec256 | KeyType::Ec384 => {
                let alg = t.ec_alg().expect("ec key type");
                let pair = rcgen::KeyPair::generate_for(alg)
                    .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
                pair.serialize_der()
            }
            _ => {
                let mut rng = rand::thread_rng();
                let key = rsa::RsaPrivateKey::new(&mut rng, t.size())
                    .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
                key.to_pkcs8_der()
                    .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?
                    .as_bytes()
                    .to_vec()
            }
        };
        Ok(PrivateKey { key_type: t, der })
    }

    /// Whether `der` parses as a key of type `t` with the right size.
    fn matches(t: KeyType, der: &[u8]) -> bool {
        if t.is_rsa() {
            match rsa::RsaPrivateKey::from_pkcs8_der(der) {
                Ok(key) => key.size() * 8 == t.size(),
                Err(_) => false,
            }
        } else {
            let alg = t.ec_alg().expect("ec key type");
            match rcgen::KeyPair::try_from(der) {
                Ok(pair) => pair.is_compatible(alg),
                Err(_) => false,
            }
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes stay out of logs.
        f.debug_struct("PrivateKey")
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

/// Load the key at `path` if it exists and matches `t`, otherwise create
/// one there (mode 0600). The bool reports whether a new key was written.
pub fn load_or_create_key(t: KeyType, path: &Path) -> Result<(PrivateKey, bool), AcmeError> {
    let data = match fs::read(path) {
        Ok(data) => Some(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(data) = data {
        if !data.is_empty() {
            if PrivateKey::matches(t, &data) {
                debug!(name = %path.display(), key_type = ?t, "existing acme key found");
                return Ok((PrivateKey::from_der(t, data), false));
            }
            debug!("acme key type changed, creating a new one");
        }
    }

    let key = PrivateKey::generate(t)?;
    write_with_mode(path, key.der(), 0o600)?;
    debug!(name = %path.display(), key_type = ?t, "new acme key created");
    Ok((key, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_key_types() {
        assert_eq!(KeyType::parse("ec256").unwrap(), KeyType::Ec256);
        assert_eq!(KeyType::parse("rsa4096").unwrap(), KeyType::Rsa4096);
        assert!(KeyType::parse("dsa").is_err());
    }

    #[test]
    fn test_creates_then_reuses_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("account.key");

        let (key, created) = load_or_create_key(KeyType::Ec256, &path).unwrap();
        assert!(created);
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let (again, created) = load_or_create_key(KeyType::Ec256, &path).unwrap();
        assert!(!created);
        assert_eq!(key.der(), again.der());
    }

    #[test]
    fn test_type_change_regenerates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("account.key");

        let (ec, _) = load_or_create_key(KeyType::Ec256, &path).unwrap();
        let (other, created) = load_or_create_key(KeyType::Ec384, &path).unwrap();
        assert!(created);
        assert_ne!(ec.der(), other.der());
        assert_eq!(other.key_type(), KeyType::Ec384);
    }

    #[test]
    fn test_garbage_on_disk_regenerates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("account.key");
        fs::write(&path, b"not a key").unwrap();
        let (_, created) = load_or_create_key(KeyType::Ec256, &path).unwrap();
        assert!(created);
    }
}
