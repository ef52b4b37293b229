//! Bounded, keyed pool of outgoing TCP connections.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::utils::errors::{AgentError, Result};

struct PoolSlot {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<TcpStream>>,
}

impl PoolSlot {
    fn take_idle(&self) -> Option<TcpStream> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(stream) = idle.pop() {
            if is_alive(&stream) {
                return Some(stream);
            }
            debug!("Dropping idle connection closed by peer");
        }
        None
    }

    fn put_idle(&self, stream: TcpStream) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(stream);
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// An idle stream must have nothing to read; EOF or stray bytes mean it is unusable.
fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        Ok(_) => false,
    }
}

/// Connections keyed by destination server, at most `max_per_destination` in use per key.
pub struct ConnectionPool {
    max_per_destination: usize,
    slots: DashMap<String, Arc<PoolSlot>>,
}

impl ConnectionPool {
    pub fn new(max_per_destination: usize) -> Self {
        Self {
            max_per_destination: max_per_destination.max(1),
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &str) -> Arc<PoolSlot> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(PoolSlot {
                    permits: Arc::new(Semaphore::new(self.max_per_destination)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Wait for a free slot for `key`, then reuse an idle stream or dial `addr`.
    pub async fn acquire(&self, key: &str, addr: &str) -> Result<PooledConnection> {
        let slot = self.slot(key);
        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Daemon("connection pool closed".into()))?;

        let (stream, reused) = match slot.take_idle() {
            Some(stream) => (stream, true),
            None => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                debug!(destination = %key, addr = %addr, "Opened replication connection");
                (stream, false)
            }
        };

        Ok(PooledConnection {
            stream: Some(stream),
            slot,
            reusable: false,
            reused,
            _permit: permit,
        })
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.slots.get(key).map(|slot| slot.idle_len()).unwrap_or(0)
    }
}

/// A checked-out connection.
///
/// Dropping it closes the stream unless [`PooledConnection::release`] was
/// called after a clean session.
pub struct PooledConnection {
    stream: Option<TcpStream>,
    slot: Arc<PoolSlot>,
    reusable: bool,
    reused: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Whether this stream came from the idle list.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// Return the stream to the pool for the next session.
    pub fn release(mut self) {
        self.reusable = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.reusable {
                self.slot.put_idle(stream);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (listener, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let pool = ConnectionPool::new(2);
        let first = pool.acquire("standby", &addr).await.unwrap();
        assert!(!first.was_reused());
        first.release();
        assert_eq!(pool.idle_count("standby"), 1);

        let second = pool.acquire("standby", &addr).await.unwrap();
        assert!(second.was_reused());
        drop(second);
        assert_eq!(pool.idle_count("standby"), 0);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_not_reused() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::new(1);
        let conn = pool.acquire("standby", &addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        conn.release();
        drop(server_side);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let fresh = pool.acquire("standby", &addr).await.unwrap();
        assert!(!fresh.was_reused());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_permits_bound_connections_per_destination() {
        let (_listener, addr) = listener().await;
        let pool = Arc::new(ConnectionPool::new(1));
        let held = pool.acquire("standby", &addr).await.unwrap();

        let waiting = {
            let pool = pool.clone();
            let addr = addr.clone();
            tokio::spawn(async move { pool.acquire("standby", &addr).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
