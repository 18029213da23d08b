use crate::crypto::storage::{self, StorageError};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use x509_cert::name::Name;

pub const DEFAULT_ISSUER_NAME: &str = "CN=FATSUN";

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("Invalid issuer name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Issuer key error: {0}")]
    Storage(#[from] StorageError),

    #[error("Issuer key is not valid UTF-8 PEM")]
    NotPem,

    #[error("Issuer key is neither PKCS#8 nor PKCS#1 RSA PEM: {0}")]
    UnsupportedKey(String),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),
}

/// The signing identity every issued certificate names as its issuer.
#[derive(Clone)]
pub struct Issuer {
    name: Name,
    signer: SigningKey<Sha256>,
    key_bits: usize,
}

impl Issuer {
    /// Load the issuer key from a PEM file and pair it with `name`.
    pub fn load(name: &str, key_path: &Path) -> Result<Self, IssuerError> {
        let bytes = storage::load_key_secure(key_path)?;
        let pem = String::from_utf8(bytes).map_err(|_| IssuerError::NotPem)?;
        let key = parse_private_key_pem(&pem)?;
        Self::from_key(name, key)
    }

    pub fn from_key(name: &str, key: RsaPrivateKey) -> Result<Self, IssuerError> {
        let name = parse_name(name)?;
        let key_bits = key.size() * 8;
        Ok(Self {
            name,
            signer: SigningKey::<Sha256>::new(key),
            key_bits,
        })
    }

    /// Generate a fresh RSA key suitable for an issuer
    pub fn generate_key(bits: usize) -> Result<RsaPrivateKey, IssuerError> {
        Ok(RsaPrivateKey::new(&mut OsRng, bits)?)
    }

    /// PKCS#8 PEM, the format `load` reads first
    pub fn key_to_pem(key: &RsaPrivateKey) -> Result<String, IssuerError> {
        key.to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| IssuerError::UnsupportedKey(e.to_string()))
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn signer(&self) -> &SigningKey<Sha256> {
        &self.signer
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }
}

impl std::fmt::Debug for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issuer")
            .field("name", &self.name.to_string())
            .field("key_bits", &self.key_bits)
            .finish_non_exhaustive()
    }
}

/// Parse an RFC 4514 distinguished name such as `CN=FATSUN,O=Example`
pub fn parse_name(name: &str) -> Result<Name, IssuerError> {
    let invalid = |reason: String| IssuerError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("name is empty".to_string()));
    }
    let parsed = Name::from_str(name).map_err(|e| invalid(e.to_string()))?;
    if parsed.0.is_empty() {
        return Err(invalid("name has no attributes".to_string()));
    }
    Ok(parsed)
}

fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, IssuerError> {
    match RsaPrivateKey::from_pkcs8_pem(pem) {
        Ok(key) => Ok(key),
        Err(pkcs8_err) => RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
            IssuerError::UnsupportedKey(format!("pkcs8: {}; pkcs1: {}", pkcs8_err, pkcs1_err))
        }),
    }
}
