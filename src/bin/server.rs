use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

use raftfs::persister::MemoryPersister;
use raftfs::raft::state::RaftConfig;
use raftfs::raft::{ApplyMsg, RaftNode};
use raftfs::server::FileServer;
use raftfs::transport::{serve_client, serve_raft, TcpTransport};

/// One node of a replicated filesystem cluster.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// This node's id; must be unique within the cluster and must also
    /// appear as the corresponding `--raft-addr` entry.
    #[arg(long)]
    id: String,

    /// Address this node's raft RPC listener binds to.
    #[arg(long)]
    raft_addr: String,

    /// Address this node's clerk-facing RPC listener binds to.
    #[arg(long)]
    client_addr: String,

    /// Every peer's raft address, `id=host:port`, repeated once per peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, String)>,

    #[arg(long, default_value_t = 500)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 1000)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 150)]
    heartbeat_interval_ms: u64,

    /// Once the persisted raft log grows past this many bytes, the
    /// server compacts it into a snapshot. Omit to disable compaction.
    #[arg(long)]
    max_raft_state_bytes: Option<usize>,
}

fn parse_peer(s: &str) -> Result<(String, String), String> {
    let (id, addr) = s.split_once('=').ok_or_else(|| format!("expected id=host:port, got {s}"))?;
    Ok((id.to_string(), addr.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let peer_addrs: Vec<String> = cli.peers.iter().map(|(_, addr)| addr.clone()).collect();
    let config = RaftConfig {
        id: cli.id.clone(),
        peers: peer_addrs,
        election_timeout_min_ms: cli.election_timeout_min_ms,
        election_timeout_max_ms: cli.election_timeout_max_ms,
        heartbeat_interval_ms: cli.heartbeat_interval_ms,
    };

    let persister = Arc::new(MemoryPersister::new());
    let transport = Arc::new(TcpTransport::new());
    let (apply_tx, apply_rx) = mpsc::unbounded_channel::<ApplyMsg>();

    let raft = RaftNode::new(config, persister.clone(), transport, apply_tx);
    let server = FileServer::new(raft.clone(), persister, apply_rx, cli.max_raft_state_bytes);

    serve_raft(&cli.raft_addr, raft.clone()).await?;
    serve_client(&cli.client_addr, server).await?;
    raft.start();

    info!("{}: raft listening on {}, clients on {}", cli.id, cli.raft_addr, cli.client_addr);

    tokio::signal::ctrl_c().await?;
    info!("{}: shutting down", cli.id);
    Ok(())
}
