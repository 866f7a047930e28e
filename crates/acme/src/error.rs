//! Error types for the ACME store.

use std::io;

use thiserror::Error;

use acmehugger_common::fsutil::CertError;

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("invalid key type: {0}")]
    InvalidKeyType(String),

    #[error("invalid challenge type: {0}")]
    InvalidChallengeType(String),

    #[error("invalid domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("failed to generate key: {0}")]
    KeyGeneration(String),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
