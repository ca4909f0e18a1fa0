//! Node-to-node request client
//!
//! Every request opens a fresh connection, writes one line and performs a
//! single bounded read. Failures are retried with linear backoff; when all
//! attempts fail the caller receives the `ERROR` sentinel instead of an error
//! value, and must treat the peer as unavailable for that request.

use crate::error::{MeshKvError, Result};
use crate::ring::NodeAddr;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Response returned by [`PeerClient::send`] once retries are exhausted
pub const PEER_ERROR: &str = "ERROR";

/// Bounded retry with linear backoff (`base_delay * attempt`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds or the attempt budget is spent, returning
    /// the last error. `op` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(_) => {
                    sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    /// Bound on connect, write and read, each
    pub io_timeout: Duration,
    pub retry: RetryPolicy,
    /// Maximum bytes accepted in the single response read
    pub read_buffer: usize,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            read_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerClient {
    config: PeerClientConfig,
}

impl PeerClient {
    pub fn new(config: PeerClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PeerClientConfig {
        &self.config
    }

    /// Send one request line to `addr` and return the raw bytes of the
    /// single read, or [`PEER_ERROR`] after the last failed attempt.
    pub async fn send(&self, addr: &NodeAddr, request: &str) -> String {
        debug!(peer = %addr, request, "sending request to peer");
        let result = self
            .config
            .retry
            .retry(|attempt| async move {
                self.send_once(addr, request).await.map_err(|err| {
                    warn!(peer = %addr, attempt, error = %err, "peer request attempt failed");
                    err
                })
            })
            .await;

        match result {
            Ok(response) => {
                debug!(peer = %addr, response = response.trim_end(), "received response from peer");
                response
            }
            Err(_) => {
                warn!(
                    peer = %addr,
                    attempts = self.config.retry.attempts,
                    "all attempts to peer failed"
                );
                PEER_ERROR.to_string()
            }
        }
    }

    async fn send_once(&self, addr: &NodeAddr, request: &str) -> Result<String> {
        let limit = self.config.io_timeout;

        let mut stream = timeout(limit, TcpStream::connect((addr.host.as_str(), addr.port)))
            .await
            .map_err(|_| MeshKvError::Timeout(limit))??;

        let message = format!("{}\n", request);
        timeout(limit, stream.write_all(message.as_bytes()))
            .await
            .map_err(|_| MeshKvError::Timeout(limit))??;

        let mut buffer = vec![0u8; self.config.read_buffer];
        let bytes = timeout(limit, stream.read(&mut buffer))
            .await
            .map_err(|_| MeshKvError::Timeout(limit))??;
        if bytes == 0 {
            return Err(MeshKvError::Peer {
                addr: addr.to_string(),
                reason: "connection closed".to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&buffer[..bytes]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn fast_client(attempts: u32, io_timeout: Duration) -> PeerClient {
        PeerClient::new(PeerClientConfig {
            io_timeout,
            retry: RetryPolicy {
                attempts,
                base_delay: Duration::from_millis(5),
            },
            read_buffer: 1024,
        })
    }

    async fn local_listener() -> (TcpListener, NodeAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, NodeAddr::new("127.0.0.1", port))
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_retry_stops_after_budget() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = policy
            .retry(|_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MeshKvError::Server("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let result = policy
            .retry(|attempt| async move {
                if attempt < 2 {
                    Err(MeshKvError::Server("not yet".to_string()))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn test_send_returns_raw_response() {
        let (listener, addr) = local_listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            assert_eq!(line, "PUT k v\n");
            writer.write_all(b"OK\n").await.unwrap();
        });

        let client = fast_client(3, Duration::from_secs(2));
        assert_eq!(client.send(&addr, "PUT k v").await, "OK\n");
    }

    #[tokio::test]
    async fn test_send_retries_after_closed_connection() {
        let (listener, addr) = local_listener().await;
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    // close without answering
                    drop(stream);
                    continue;
                }
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
                stream.write_all(b"value\n").await.unwrap();
                break;
            }
        });

        let client = fast_client(3, Duration::from_secs(2));
        assert_eq!(client.send(&addr, "GET k").await, "value\n");
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_peer_yields_sentinel() {
        let (listener, addr) = local_listener().await;
        drop(listener);

        let client = fast_client(3, Duration::from_secs(1));
        assert_eq!(client.send(&addr, "GET k").await, PEER_ERROR);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (listener, addr) = local_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = fast_client(2, Duration::from_millis(50));
        assert_eq!(client.send(&addr, "GET k").await, PEER_ERROR);
    }
}
