pub mod certificate;
pub mod issuer;
pub mod storage;

pub use certificate::{
    Authority, CertificateError, IssuedKey, KeyIssuer, SubjectName, MAX_VALIDITY_DAYS,
};
pub use issuer::{Issuer, IssuerError};
pub use storage::{default_issuer_key_path, StorageError};
