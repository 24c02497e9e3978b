mod config;
mod dispatcher;
mod executor;
mod namespace;
mod peer;
mod rank_cluster;
mod wire;
mod workload;

use std::{path::Path, time::Instant};

use balancer::{Balancer, LoadDump};
use config::CONFIG;
use dispatcher::{Dispatcher, start_ticker};
use peer::{handler::PeerHandler, service::PeerService};
use tokio::sync::mpsc;
use utilities::{
    logger::{Instrument, Level, error, info, init_logger, span},
    result::Result,
    state_logger::StateLogger,
    tcp_pool::TcpPool,
};

// events waiting for the dispatcher: ticks, peer frames and failures
const EVENT_QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let rank = CONFIG.rank.to_string();
    let _gaurd = init_logger(
        "mds",
        &rank,
        &CONFIG.log_level,
        CONFIG.apm_endpoint.as_deref(),
        &CONFIG.log_base,
    )?;
    if let Err(e) = CONFIG.validate() {
        error!(error = %e, "Invalid configuration, shutting down");
        return Err(e);
    }
    let root_span = span!(Level::INFO, "mds", rank = CONFIG.rank);

    let tree = match namespace::build(
        CONFIG.rank,
        CONFIG.cluster_size(),
        CONFIG.root_authority,
        &CONFIG.namespace,
    ) {
        Ok(tree) => tree,
        Err(e) => {
            error!(error = %e, "Error while building the namespace, shutting down");
            return Err(e.into());
        }
    };
    let balancer = match Balancer::new(CONFIG.balancer.clone()) {
        Ok(balancer) => balancer,
        Err(e) => {
            error!(error = %e, "Error while creating the balancer, shutting down");
            return Err(e.into());
        }
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let mut dispatcher = Dispatcher::new(&CONFIG, tree, balancer, Instant::now());
    if let Some(path) = &CONFIG.state_log_file {
        info!(%path, "Writing load dumps");
        let (state_tx, _writer) = StateLogger::<LoadDump>::start(Path::new(path)).await?;
        dispatcher = dispatcher.with_state_log(state_tx);
    }

    let pool = TcpPool::new(CONFIG.send_retries, CONFIG.send_backoff());
    let peers = PeerService::start(CONFIG.rank, &CONFIG.peers, pool, events_tx.clone());
    let handler = PeerHandler::new(&CONFIG.listen_addr, events_tx.clone()).await?;
    info!(address = %handler.local_addr()?, peers = CONFIG.peers.len(), "Listening for peers");

    start_ticker(events_tx, CONFIG.tick());
    tokio::spawn(dispatcher.run(events_rx, peers).instrument(root_span.clone()));
    handler.start_and_accept().instrument(root_span).await
}

