//! Pluggable RPC boundary between raft nodes, and between a clerk and
//! the cluster.
//!
//! The teacher dialed a fresh `TcpStream` per call and framed each
//! message as a big-endian length prefix followed by a `serde_json`
//! payload; `TcpTransport` keeps exactly that wire format. The traits
//! exist so tests can swap in an in-process transport without opening
//! real sockets, and so the raft engine and the dispatcher never
//! import `tokio::net` directly.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::ops::{OperationReply, OperationRequest};
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &str, args: RequestVoteArgs) -> anyhow::Result<RequestVoteReply>;
    async fn append_entries(&self, peer: &str, args: AppendEntriesArgs) -> anyhow::Result<AppendEntriesReply>;
    async fn install_snapshot(&self, peer: &str, args: InstallSnapshotArgs) -> anyhow::Result<InstallSnapshotReply>;
}

#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn operation(&self, leader: &str, req: OperationRequest) -> anyhow::Result<OperationReply>;
}

/// Everything a peer's raft listener might receive on one socket.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
enum RaftRpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
enum RaftRpcResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
}

async fn write_framed<T: Serialize + Sync>(stream: &mut TcpStream, msg: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(msg)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_framed<T: DeserializeOwned>(stream: &mut TcpStream) -> anyhow::Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// A raft RPC handler, implemented by `RaftNode`. `serve_raft` decodes
/// the envelope and dispatches to one of these; the node itself never
/// touches a socket.
#[async_trait]
pub trait RaftRpcHandler: Send + Sync {
    async fn on_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply;
    async fn on_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply;
    async fn on_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply;
}

/// A client RPC handler, implemented by the replicated dispatcher.
#[async_trait]
pub trait ClientRpcHandler: Send + Sync {
    async fn on_operation(&self, req: OperationRequest) -> OperationReply;
}

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }

    async fn call_raft(&self, peer: &str, req: RaftRpcRequest) -> anyhow::Result<RaftRpcResponse> {
        let mut stream = TcpStream::connect(peer).await?;
        write_framed(&mut stream, &req).await?;
        read_framed(&mut stream).await
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn request_vote(&self, peer: &str, args: RequestVoteArgs) -> anyhow::Result<RequestVoteReply> {
        match self.call_raft(peer, RaftRpcRequest::RequestVote(args)).await? {
            RaftRpcResponse::RequestVote(reply) => Ok(reply),
            _ => anyhow::bail!("peer {peer} replied with the wrong RPC kind"),
        }
    }

    async fn append_entries(&self, peer: &str, args: AppendEntriesArgs) -> anyhow::Result<AppendEntriesReply> {
        match self.call_raft(peer, RaftRpcRequest::AppendEntries(args)).await? {
            RaftRpcResponse::AppendEntries(reply) => Ok(reply),
            _ => anyhow::bail!("peer {peer} replied with the wrong RPC kind"),
        }
    }

    async fn install_snapshot(&self, peer: &str, args: InstallSnapshotArgs) -> anyhow::Result<InstallSnapshotReply> {
        match self.call_raft(peer, RaftRpcRequest::InstallSnapshot(args)).await? {
            RaftRpcResponse::InstallSnapshot(reply) => Ok(reply),
            _ => anyhow::bail!("peer {peer} replied with the wrong RPC kind"),
        }
    }
}

#[async_trait]
impl ClientTransport for TcpTransport {
    async fn operation(&self, leader: &str, req: OperationRequest) -> anyhow::Result<OperationReply> {
        let mut stream = TcpStream::connect(leader).await?;
        write_framed(&mut stream, &req).await?;
        read_framed(&mut stream).await
    }
}

/// Accepts connections on `addr` forever, decoding one `RaftRpcRequest`
/// per connection and replying with the matching response. Mirrors the
/// teacher's `start_listener` test helper, generalized into library
/// code instead of living only in a test file.
pub async fn serve_raft(addr: &str, handler: std::sync::Arc<dyn RaftRpcHandler>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("raft listener accept failed: {e}");
                    continue;
                }
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let req: RaftRpcRequest = match read_framed(&mut stream).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
                let resp = match req {
                    RaftRpcRequest::RequestVote(args) => {
                        RaftRpcResponse::RequestVote(handler.on_request_vote(args).await)
                    }
                    RaftRpcRequest::AppendEntries(args) => {
                        RaftRpcResponse::AppendEntries(handler.on_append_entries(args).await)
                    }
                    RaftRpcRequest::InstallSnapshot(args) => {
                        RaftRpcResponse::InstallSnapshot(handler.on_install_snapshot(args).await)
                    }
                };
                let _ = write_framed(&mut stream, &resp).await;
            });
        }
    });
    Ok(())
}

/// Accepts connections on `addr` forever, decoding one `OperationRequest`
/// per connection and replying with the matching `OperationReply`.
pub async fn serve_client(addr: &str, handler: std::sync::Arc<dyn ClientRpcHandler>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("client listener accept failed: {e}");
                    continue;
                }
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let req: OperationRequest = match read_framed(&mut stream).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
                let resp = handler.on_operation(req).await;
                let _ = write_framed(&mut stream, &resp).await;
            });
        }
    });
    Ok(())
}
