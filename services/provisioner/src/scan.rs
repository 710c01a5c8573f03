//! Post-create reachability scanning.
//!
//! Verifying that a freshly created node accepts connections is the one
//! genuinely blocking operation in the launch path, so it runs on a
//! bounded worker pool instead of the provider polling loop. The pool
//! hands back a oneshot receiver the launcher polls each tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Semaphore};
use tracing::debug;

/// Scans a host for reachability, returning its advertised host keys.
#[async_trait]
pub trait KeyScanner: Send + Sync {
    async fn scan(&self, host: &str, port: u16, timeout: Duration) -> Result<Vec<String>>;
}

/// Connects over TCP and captures the server's identification banner.
pub struct TcpBannerScanner;

#[async_trait]
impl KeyScanner for TcpBannerScanner {
    async fn scan(&self, host: &str, port: u16, timeout: Duration) -> Result<Vec<String>> {
        let connect = TcpStream::connect((host, port));
        let mut stream = tokio::time::timeout(timeout, connect)
            .await
            .context("connect timed out")?
            .context("connect failed")?;

        let mut buf = [0u8; 256];
        let read = tokio::time::timeout(timeout, stream.read(&mut buf))
            .await
            .context("banner read timed out")?
            .context("banner read failed")?;
        if read == 0 {
            anyhow::bail!("connection closed before banner");
        }

        let banner = String::from_utf8_lossy(&buf[..read]).trim().to_string();
        debug!(host, port, banner = %banner, "Scan complete");
        Ok(vec![banner])
    }
}

/// Scanner with a fixed outcome, for tests and the mock driver path.
pub struct StaticScanner {
    keys: Option<Vec<String>>,
}

impl StaticScanner {
    /// Always succeeds with the given host keys.
    pub fn with_keys(keys: Vec<String>) -> Self {
        Self { keys: Some(keys) }
    }

    /// Always fails.
    pub fn failing() -> Self {
        Self { keys: None }
    }
}

#[async_trait]
impl KeyScanner for StaticScanner {
    async fn scan(&self, host: &str, _port: u16, _timeout: Duration) -> Result<Vec<String>> {
        match &self.keys {
            Some(keys) => Ok(keys.clone()),
            None => anyhow::bail!("host {host} unreachable"),
        }
    }
}

/// Bounded worker pool for reachability scans.
#[derive(Clone)]
pub struct ScanPool {
    scanner: Arc<dyn KeyScanner>,
    permits: Arc<Semaphore>,
}

impl ScanPool {
    pub fn new(scanner: Arc<dyn KeyScanner>, max_workers: usize) -> Self {
        Self {
            scanner,
            permits: Arc::new(Semaphore::new(max_workers)),
        }
    }

    /// Queue a scan; at most `max_workers` run concurrently. The receiver
    /// resolves when the scan finishes (or errors).
    pub fn submit(&self, host: String, port: u16, timeout: Duration) -> oneshot::Receiver<Result<Vec<String>>> {
        let (tx, rx) = oneshot::channel();
        let scanner = Arc::clone(&self.scanner);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            let result = scanner.scan(&host, port, timeout).await;
            let _ = tx.send(result);
        });
        rx
    }
}
