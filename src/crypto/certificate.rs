use crate::crypto::issuer::Issuer;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::Signature;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use spki::SubjectPublicKeyInfoOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::{Any, ObjectIdentifier, SetOfVec};
use x509_cert::der::{Encode, EncodePem, Tag};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;
use x509_cert::Certificate;

/// id-at-commonName
const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Longest certificate lifetime, keeps `notAfter` well below year 9999
pub const MAX_VALIDITY_DAYS: u32 = 100 * 365;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Invalid subject name: {0}")]
    InvalidSubject(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("DER encoding failed: {0}")]
    Der(#[from] x509_cert::der::Error),

    #[error("Public key encoding failed: {0}")]
    PublicKey(String),

    #[error("Certificate signing failed: {0}")]
    Signing(String),
}

/// A validated subject common name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectName(String);

impl SubjectName {
    /// Trim `raw` and check it is usable as a common name of at most `max_len` bytes
    pub fn parse(raw: &str, max_len: usize) -> Result<Self, CertificateError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(CertificateError::InvalidSubject(
                "name is empty".to_string(),
            ));
        }
        if name.len() > max_len {
            return Err(CertificateError::InvalidSubject(format!(
                "name is {} bytes, limit is {}",
                name.len(),
                max_len
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(CertificateError::InvalidSubject(
                "name contains control characters".to_string(),
            ));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `CN=<name>` as a single UTF8String attribute
    pub fn to_distinguished_name(&self) -> Result<Name, CertificateError> {
        let value = Any::new(Tag::Utf8String, self.0.as_bytes())?;
        let atv = AttributeTypeAndValue {
            oid: COMMON_NAME,
            value,
        };
        let rdn = RelativeDistinguishedName(SetOfVec::try_from(vec![atv])?);
        Ok(RdnSequence(vec![rdn]))
    }
}

impl std::fmt::Display for SubjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public key and certificate handed back to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedKey {
    pub subject: SubjectName,
    pub public_key_pem: String,
    pub certificate_pem: String,
    pub serial_hex: String,
    /// Hex SHA-256 of the certificate DER
    pub fingerprint: String,
}

impl IssuedKey {
    /// Wire form: public key PEM, a blank line, certificate PEM
    pub fn to_response(&self) -> String {
        format!(
            "{}\n\n{}\n",
            self.public_key_pem.trim_end(),
            self.certificate_pem.trim_end()
        )
    }
}

/// Anything able to turn a subject name into an issued key.
pub trait KeyIssuer: Send + Sync + 'static {
    fn issue(&self, subject: &SubjectName) -> Result<IssuedKey, CertificateError>;
}

/// Generates RSA key pairs and signs certificates for them with the issuer key
#[derive(Debug, Clone)]
pub struct Authority {
    issuer: Issuer,
    key_bits: usize,
    validity: Duration,
}

impl Authority {
    pub fn new(issuer: Issuer, key_bits: usize, validity_days: u32) -> Self {
        Self {
            issuer,
            key_bits,
            validity: Duration::from_secs(u64::from(validity_days) * SECONDS_PER_DAY),
        }
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn validity_days(&self) -> u64 {
        self.validity.as_secs() / SECONDS_PER_DAY
    }

    /// Build and sign the certificate for `public_key`
    pub fn certify(
        &self,
        subject: &SubjectName,
        public_key: &RsaPublicKey,
    ) -> Result<Certificate, CertificateError> {
        let spki = SubjectPublicKeyInfoOwned::from_key(public_key.clone())
            .map_err(|e| CertificateError::PublicKey(e.to_string()))?;
        let profile = Profile::Leaf {
            issuer: self.issuer.name().clone(),
            enable_key_agreement: false,
            enable_key_encipherment: true,
        };

        let builder = CertificateBuilder::new(
            profile,
            random_serial()?,
            Validity::from_now(self.validity)?,
            subject.to_distinguished_name()?,
            spki,
            self.issuer.signer(),
        )
        .map_err(|e| CertificateError::Signing(e.to_string()))?;

        builder
            .build::<Signature>()
            .map_err(|e| CertificateError::Signing(e.to_string()))
    }
}

impl KeyIssuer for Authority {
    fn issue(&self, subject: &SubjectName) -> Result<IssuedKey, CertificateError> {
        debug!("Generating {}-bit key pair for {}", self.key_bits, subject);
        let private_key = RsaPrivateKey::new(&mut OsRng, self.key_bits)?;
        let public_key = RsaPublicKey::from(&private_key);

        let certificate = self.certify(subject, &public_key)?;

        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CertificateError::PublicKey(e.to_string()))?;
        let certificate_pem = certificate.to_pem(LineEnding::LF)?;
        let fingerprint = hex::encode(Sha256::digest(certificate.to_der()?));
        let serial_hex = hex::encode(certificate.tbs_certificate.serial_number.as_bytes());

        Ok(IssuedKey {
            subject: subject.clone(),
            public_key_pem,
            certificate_pem,
            serial_hex,
            fingerprint,
        })
    }
}

/// Random positive 64-bit serial with a minimal DER encoding
fn random_serial() -> Result<SerialNumber, CertificateError> {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    Ok(SerialNumber::new(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::VerifyingKey;
    use rsa::signature::Verifier;
    use x509_cert::der::{Decode, DecodePem};

    fn test_authority() -> (Authority, RsaPublicKey) {
        let key = Issuer::generate_key(1024).unwrap();
        let public = RsaPublicKey::from(&key);
        let issuer = Issuer::from_key("CN=Test Issuer", key).unwrap();
        (Authority::new(issuer, 1024, 365), public)
    }

    #[test]
    fn test_subject_name_validation() {
        assert_eq!(SubjectName::parse("  alice \n", 64).unwrap().as_str(), "alice");
        assert!(SubjectName::parse("   ", 64).is_err());
        assert!(SubjectName::parse("a\u{7}b", 64).is_err());
        assert!(SubjectName::parse(&"x".repeat(65), 64).is_err());
        assert!(SubjectName::parse(&"x".repeat(64), 64).is_ok());
    }

    #[test]
    fn test_subject_name_keeps_special_characters() {
        let subject = SubjectName::parse("Doe, John+admin=yes", 64).unwrap();
        let name = subject.to_distinguished_name().unwrap();

        assert_eq!(name.0.len(), 1);
        let atv = name.0[0].0.iter().next().unwrap();
        assert_eq!(atv.oid, COMMON_NAME);
        assert_eq!(atv.value.value(), "Doe, John+admin=yes".as_bytes());
    }

    #[test]
    fn test_random_serial_is_positive() {
        for _ in 0..32 {
            let serial = random_serial().unwrap();
            let bytes = serial.as_bytes();
            assert_eq!(bytes.len(), 8);
            assert!(bytes[0] & 0x80 == 0);
        }
    }

    #[test]
    fn test_issue_produces_signed_certificate() {
        let (authority, issuer_public) = test_authority();
        let subject = SubjectName::parse("alice", 64).unwrap();

        let issued = authority.issue(&subject).unwrap();
        assert!(issued.public_key_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(issued.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(issued.fingerprint.len(), 64);

        let cert = Certificate::from_pem(issued.certificate_pem.as_bytes()).unwrap();
        let tbs = &cert.tbs_certificate;
        assert_eq!(tbs.subject.to_string(), "CN=alice");
        assert_eq!(tbs.issuer.to_string(), "CN=Test Issuer");
        assert_eq!(hex::encode(tbs.serial_number.as_bytes()), issued.serial_hex);

        let not_before = tbs.validity.not_before.to_unix_duration();
        let not_after = tbs.validity.not_after.to_unix_duration();
        assert_eq!(not_after - not_before, Duration::from_secs(365 * SECONDS_PER_DAY));

        // Certificate key matches the returned public key
        let returned = spki::SubjectPublicKeyInfoOwned::from_pem(issued.public_key_pem.as_bytes())
            .unwrap();
        assert_eq!(tbs.subject_public_key_info, returned);

        // Signature verifies against the issuer key
        let verifier = VerifyingKey::<Sha256>::new(issuer_public);
        let signature = Signature::try_from(cert.signature.raw_bytes()).unwrap();
        verifier.verify(&tbs.to_der().unwrap(), &signature).unwrap();

        let der = cert.to_der().unwrap();
        assert_eq!(hex::encode(Sha256::digest(&der)), issued.fingerprint);
        assert!(Certificate::from_der(&der).is_ok());
    }

    #[test]
    fn test_issue_with_longest_validity() {
        let key = Issuer::generate_key(1024).unwrap();
        let issuer = Issuer::from_key("CN=Test Issuer", key).unwrap();
        let authority = Authority::new(issuer, 1024, MAX_VALIDITY_DAYS);
        assert_eq!(authority.key_bits(), 1024);
        assert_eq!(authority.validity_days(), u64::from(MAX_VALIDITY_DAYS));

        let issued = authority.issue(&SubjectName::parse("erin", 64).unwrap()).unwrap();
        let cert = Certificate::from_pem(issued.certificate_pem.as_bytes()).unwrap();
        let validity = &cert.tbs_certificate.validity;
        assert_eq!(
            validity.not_after.to_unix_duration() - validity.not_before.to_unix_duration(),
            authority.validity()
        );
    }

    #[test]
    fn test_issue_generates_fresh_keys() {
        let (authority, _) = test_authority();
        let subject = SubjectName::parse("bob", 64).unwrap();

        let first = authority.issue(&subject).unwrap();
        let second = authority.issue(&subject).unwrap();
        assert_ne!(first.public_key_pem, second.public_key_pem);
        assert_ne!(first.serial_hex, second.serial_hex);
    }

    #[test]
    fn test_response_layout() {
        let issued = IssuedKey {
            subject: SubjectName::parse("carol", 64).unwrap(),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n"
                .to_string(),
            certificate_pem: "-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n"
                .to_string(),
            serial_hex: "01".to_string(),
            fingerprint: "00".to_string(),
        };

        assert_eq!(
            issued.to_response(),
            "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n\n\
             -----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n"
        );
    }
}
