use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::trace;

use crate::ConnectionProbeError;

/// A boxed future returned by connection testers.
pub type ProbeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<bool, ConnectionProbeError>> + Send + 'a>>;

/// Checks whether a peer is reachable.
///
/// `Ok(false)` and `Err(_)` both count as a failed probe.
pub trait ConnectionTester<T>: Send + Sync + 'static {
    fn test_connection<'a>(&'a self, target: &'a T) -> ProbeFuture<'a>;
}

/// Tester that opens (and immediately drops) a TCP connection to a
/// `host:port` address.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ConnectionTester<String> for TcpProbe {
    fn test_connection<'a>(&'a self, target: &'a String) -> ProbeFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, TcpStream::connect(target.as_str())).await {
                Ok(Ok(_stream)) => {
                    trace!(%target, "probe connected");
                    Ok(true)
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConnectionProbeError::Timeout),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reachable_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let ok = TcpProbe::default().test_connection(&target).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn refused_port_is_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpProbe::new(Duration::from_secs(2))
            .test_connection(&target)
            .await;
        assert!(matches!(result, Err(ConnectionProbeError::Io(_))));
    }
}
