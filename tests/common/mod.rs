//! Shared helpers for the server integration tests
//!
//! Each test gets its own issuer key, its own pool and a server bound to an
//! ephemeral port so tests can run in parallel.

use keyserver::crypto::{Authority, Issuer, KeyIssuer};
use keyserver::network::{Server, WireConfig};
use keyserver::IssuancePool;
use rsa::RsaPublicKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Small keys keep key generation fast in debug builds
pub const TEST_KEY_BITS: usize = 1024;
pub const TEST_ISSUER_NAME: &str = "CN=Test Issuer,O=Keyserver Tests";

pub struct TestServer {
    pub addr: SocketAddr,
    pub pool: Arc<IssuancePool>,
    pub issuer_public_key: RsaPublicKey,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Trigger shutdown and wait for the server task to return
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.await?
    }
}

pub fn test_authority() -> (Authority, RsaPublicKey) {
    let key = Issuer::generate_key(TEST_KEY_BITS).expect("issuer key");
    let public_key = RsaPublicKey::from(&key);
    let issuer = Issuer::from_key(TEST_ISSUER_NAME, key).expect("issuer");
    (Authority::new(issuer, TEST_KEY_BITS, 30), public_key)
}

pub async fn start_server(workers: usize) -> TestServer {
    let (authority, issuer_public_key) = test_authority();
    let issuer: Arc<dyn KeyIssuer> = Arc::new(authority);
    start_server_with(issuer, issuer_public_key, workers).await
}

pub async fn start_server_with(
    issuer: Arc<dyn KeyIssuer>,
    issuer_public_key: RsaPublicKey,
    workers: usize,
) -> TestServer {
    let pool = Arc::new(IssuancePool::start(issuer, workers));
    let server = Server::bind("127.0.0.1:0", Arc::clone(&pool), WireConfig::for_testing())
        .await
        .expect("bind test server");
    let addr = server.local_addr().expect("local addr");

    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    TestServer {
        addr,
        pool,
        issuer_public_key,
        shutdown: Some(shutdown),
        handle,
    }
}
