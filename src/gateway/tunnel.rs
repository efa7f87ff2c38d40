//! Reverse-tunnel session broker.
//!
//! An operator request parks a one-shot slot under a fresh session id, the
//! worker is told to dial back, and the first tunnel hello carrying that
//! session id claims the slot. Claims are exactly-once: the slot is removed
//! before the stream is handed over, so a duplicate dial-back finds nothing
//! and is dropped. Unclaimed slots expire after a bounded wait.

use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};

pub struct TunnelBroker {
    pending: DashMap<String, oneshot::Sender<TcpStream>>,
    wait: Duration,
}

impl TunnelBroker {
    pub fn new(wait: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            wait,
        }
    }

    /// Park a slot and wait for the worker's dial-back. On timeout the slot
    /// is removed, so a late dial-back cannot attach to a caller that
    /// already gave up.
    pub async fn await_worker(&self, session_id: &str) -> Result<TcpStream> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(session_id.to_string(), tx).is_some() {
            warn!(session = %session_id, "replacing duplicate tunnel session");
        }

        let result = tokio::time::timeout(self.wait, rx).await;
        self.pending.remove(session_id);
        match result {
            Ok(Ok(stream)) => {
                info!(session = %session_id, "tunnel claimed");
                Ok(stream)
            }
            Ok(Err(_)) => Err(FleetError::Transport(format!(
                "tunnel session {session_id} cancelled"
            ))),
            Err(_) => Err(FleetError::Timeout(self.wait)),
        }
    }

    /// Worker dial-back: hand the stream to the waiting slot. Unknown or
    /// already-claimed sessions are an error and the caller drops the
    /// stream.
    pub fn claim(&self, session_id: &str, stream: TcpStream) -> Result<()> {
        let Some((_, tx)) = self.pending.remove(session_id) else {
            return Err(FleetError::Transport(format!(
                "no pending tunnel session {session_id}"
            )));
        };
        tx.send(stream).map_err(|_| {
            FleetError::Transport(format!("tunnel session {session_id} waiter gone"))
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Splice two sockets until either side closes.
pub async fn bridge(mut a: TcpStream, mut b: TcpStream) -> std::io::Result<(u64, u64)> {
    let copied = tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    debug!(a_to_b = copied.0, b_to_a = copied.1, "tunnel bridge closed");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn claim_is_exactly_once() {
        let broker = std::sync::Arc::new(TunnelBroker::new(Duration::from_secs(2)));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_worker("s-1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (first, _keep1) = socket_pair().await;
        broker.claim("s-1", first).unwrap();

        let (second, _keep2) = socket_pair().await;
        assert!(broker.claim("s-1", second).is_err());

        waiter.await.unwrap().unwrap();
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn unclaimed_session_times_out() {
        let broker = TunnelBroker::new(Duration::from_millis(100));
        let err = broker.await_worker("never").await.unwrap_err();
        assert!(matches!(err, FleetError::Timeout(_)));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_claim_after_timeout_fails() {
        let broker = TunnelBroker::new(Duration::from_millis(50));
        let _ = broker.await_worker("slow").await;

        let (stream, _keep) = socket_pair().await;
        assert!(broker.claim("slow", stream).is_err());
    }

    #[tokio::test]
    async fn bridge_relays_both_directions() {
        let (a1, a2) = socket_pair().await;
        let (b1, b2) = socket_pair().await;
        tokio::spawn(bridge(a2, b1));

        let (mut op, mut wk) = (a1, b2);
        op.write_all(b"from-operator").await.unwrap();
        let mut buf = [0u8; 13];
        wk.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-operator");

        wk.write_all(b"from-worker").await.unwrap();
        let mut buf = [0u8; 11];
        op.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-worker");
    }
}
