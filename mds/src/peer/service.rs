use std::collections::HashMap;

use dirtree::Rank;
use proto::generated::mds_balancer::Envelope;
use tokio::sync::mpsc;
use utilities::{
    logger::{Instrument, debug, trace, warn},
    tcp_pool::TcpPool,
};

use crate::dispatcher::RankEvent;

// frames waiting for one peer before new ones are dropped
const PEER_QUEUE_DEPTH: usize = 64;

/// Outgoing side of the peer mesh: one ordered queue and writer task per peer.
#[derive(Clone)]
pub struct PeerService {
    whoami: Rank,
    queues: HashMap<Rank, mpsc::Sender<Envelope>>,
}

impl PeerService {
    /// Spawns a writer for every peer but `whoami`. A peer whose frame cannot
    /// be delivered after the pool's retries is reported as down.
    pub fn start(
        whoami: Rank,
        addresses: &[String],
        pool: TcpPool,
        events: mpsc::Sender<RankEvent>,
    ) -> Self {
        let mut queues = HashMap::new();
        for (rank, address) in addresses.iter().enumerate() {
            let rank = rank as Rank;
            if rank == whoami {
                continue;
            }
            let (tx, mut rx) = mpsc::channel::<Envelope>(PEER_QUEUE_DEPTH);
            let pool = pool.clone();
            let events = events.clone();
            let address = address.clone();
            tokio::spawn(
                async move {
                    while let Some(envelope) = rx.recv().await {
                        match pool.send(&address, &envelope).await {
                            Ok(()) => trace!(to = rank, "Frame sent"),
                            Err(e) => {
                                warn!(error = %e, to = rank, %address, "Peer unreachable");
                                if events.send(RankEvent::PeerDown(rank)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(to = rank, "Peer writer stopped");
                }
                .in_current_span(),
            );
            queues.insert(rank, tx);
        }
        Self { whoami, queues }
    }

    /// Fire and forget.
    pub fn send(&self, to: Rank, envelope: Envelope) {
        let Some(queue) = self.queues.get(&to) else {
            warn!(from = self.whoami, to, "No peer with this rank");
            return;
        };
        if let Err(e) = queue.try_send(envelope) {
            warn!(error = %e, to, "Peer queue full, dropping frame");
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = Rank> + '_ {
        self.queues.keys().copied()
    }
}
