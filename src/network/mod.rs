pub mod client;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientError, IssuedBundle};
pub use protocol::{ProtocolError, WireConfig};
pub use server::Server;
