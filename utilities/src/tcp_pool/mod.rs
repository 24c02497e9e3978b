use std::{collections::HashMap, sync::Arc, time::Duration};

use prost::Message;
use tokio::{net::TcpStream, sync::Mutex};
use tracing::{Instrument, Span, debug, trace};

use crate::{frame::write_frame, result::Result, retry_policy::retry_with_backoff};

type SharedStream = Arc<Mutex<TcpStream>>;

/// Keeps one outgoing stream per peer address, reconnecting with backoff.
#[derive(Clone, Debug)]
pub struct TcpPool {
    store: Arc<Mutex<HashMap<String, SharedStream>>>,
    max_retries: u8,
    base_delay: Duration,
}

impl Default for TcpPool {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

impl TcpPool {
    pub fn new(max_retries: u8, base_delay: Duration) -> Self {
        Self {
            store: Arc::default(),
            max_retries,
            base_delay,
        }
    }
    pub async fn get_connection(&self, tcp_address: &str) -> Result<SharedStream> {
        if let Some(stream) = self.store.lock().await.get(tcp_address) {
            trace!("Connection already present");
            return Ok(stream.clone());
        }
        trace!(%tcp_address, "Creating connection since it is not present already");
        let stream = retry_with_backoff(
            || {
                async move {
                    let stream: Result<TcpStream> =
                        TcpStream::connect(tcp_address).await.map_err(|e| {
                            format!("Error while connecting to stream at {tcp_address:?} {e:?}")
                                .into()
                        });
                    stream
                }
                .instrument(Span::current())
            },
            self.max_retries,
            self.base_delay,
        )
        .await?;
        stream.set_nodelay(true)?;
        let stream = Arc::new(Mutex::new(stream));
        self.store
            .lock()
            .await
            .insert(tcp_address.to_owned(), stream.clone());
        Ok(stream)
    }
    pub async fn evict(&self, tcp_address: &str) {
        self.store.lock().await.remove(tcp_address);
    }
    /// Writes one frame to the peer, dropping the cached stream when the write fails
    /// so the next send reconnects.
    pub async fn send<M: Message>(&self, tcp_address: &str, message: &M) -> Result<()> {
        let stream = self.get_connection(tcp_address).await?;
        let mut stream = stream.lock().await;
        if let Err(e) = write_frame(&mut *stream, message).await {
            debug!(error=%e, %tcp_address, "Write failed, evicting connection");
            drop(stream);
            self.evict(tcp_address).await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use tokio::net::TcpListener;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint32, tag = "1")]
        seq: u32,
    }

    #[tokio::test]
    async fn reuses_connection_for_same_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seqs = Vec::new();
            while let Some(ping) = read_frame::<Ping>(&mut stream).await.unwrap() {
                seqs.push(ping.seq);
                if seqs.len() == 2 {
                    break;
                }
            }
            seqs
        });
        let pool = TcpPool::new(2, Duration::from_millis(1));
        pool.send(&address, &Ping { seq: 1 }).await.unwrap();
        pool.send(&address, &Ping { seq: 2 }).await.unwrap();
        assert_eq!(reader.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unreachable_peer_returns_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let pool = TcpPool::new(2, Duration::from_millis(1));
        assert!(pool.send(&address, &Ping { seq: 1 }).await.is_err());
    }
}
