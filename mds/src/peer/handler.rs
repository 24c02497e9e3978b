use std::net::SocketAddr;

use proto::generated::mds_balancer::Envelope;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use utilities::{
    frame::read_frame,
    logger::{Instrument, Span, error, trace, warn},
    result::Result,
};

use crate::{
    dispatcher::RankEvent,
    wire::{Inbound, decode},
};

/// Incoming side of the peer mesh. Every connection is read frame by frame and
/// the decoded messages are queued for the dispatcher.
pub struct PeerHandler {
    listener: TcpListener,
    events: mpsc::Sender<RankEvent>,
}

impl PeerHandler {
    pub async fn new(address: &str, events: mpsc::Sender<RankEvent>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| format!("Error while binding {address}: {e}"))?;
        Ok(Self { listener, events })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
    pub async fn start_and_accept(&self) -> Result<()> {
        loop {
            let (tcp_stream, remote) = self.listener.accept().await?;
            trace!(%remote, "Peer connected");
            let events = self.events.clone();
            let span = Span::current();
            tokio::spawn(
                async move {
                    if let Err(e) = Self::handle_connection(tcp_stream, events).await {
                        error!(%remote, "Error while handling peer connection {e}");
                    }
                }
                .instrument(span),
            );
        }
    }
    async fn handle_connection(
        mut tcp_stream: TcpStream,
        events: mpsc::Sender<RankEvent>,
    ) -> Result<()> {
        while let Some(envelope) = read_frame::<Envelope>(&mut tcp_stream).await? {
            let event = match decode(envelope) {
                Ok((from, Inbound::Balancer(message))) => RankEvent::Message { from, message },
                Ok((from, Inbound::Export(notice))) => RankEvent::Export { from, notice },
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable frame");
                    continue;
                }
            };
            if events.send(event).await.is_err() {
                return Err("Dispatcher stopped".into());
            }
        }
        trace!("Peer closed connection");
        Ok(())
    }
}
