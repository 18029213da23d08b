pub mod cli;
pub mod crypto;
pub mod issuance;
pub mod network;

// Re-export key types for easy testing
pub use crypto::{Authority, Issuer, IssuedKey, KeyIssuer, SubjectName};
pub use issuance::{IssuancePool, IssueError};
pub use network::{Client, IssuedBundle, Server, WireConfig};
