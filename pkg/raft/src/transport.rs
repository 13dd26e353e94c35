//! The async request/response boundary the consensus core is kept free of.
//! Two implementations: an in-process loopback used by tests, and a
//! length-prefixed TCP transport for real clusters.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::protos::{AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotChunk, InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, ServerId};

/// Default deadline applied to a single RPC attempt when the caller doesn't
/// specify one: one heartbeat interval, per §5 of the design.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(50);

#[async_trait]
pub trait RaftTransport: Send + Sync {
	async fn append_entries(&self, peer: ServerId, req: AppendEntriesRequest, deadline: Duration) -> io::Result<AppendEntriesResponse>;

	async fn request_vote(&self, peer: ServerId, req: RequestVoteRequest, deadline: Duration) -> io::Result<RequestVoteResponse>;

	async fn install_snapshot_chunk(&self, peer: ServerId, req: InstallSnapshotChunk, deadline: Duration) -> io::Result<InstallSnapshotResponse>;
}

/// Routes RPCs directly between `RaftTransport` handlers registered for other
/// servers in the same process. Used by scenario tests so a whole cluster can
/// be driven deterministically without opening a single socket.
#[derive(Default)]
pub struct LoopbackTransport {
	peers: Mutex<HashMap<ServerId, Arc<dyn LoopbackPeer>>>,
}

/// What a loopback-reachable node exposes to the transport: the same three
/// RPC handlers the wire format carries, but as plain synchronous-ish async
/// calls with no framing.
#[async_trait]
pub trait LoopbackPeer: Send + Sync {
	async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;
	async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse;
	async fn handle_install_snapshot(&self, req: InstallSnapshotChunk) -> InstallSnapshotResponse;
}

impl LoopbackTransport {
	pub fn new() -> Self {
		LoopbackTransport { peers: Mutex::new(HashMap::new()) }
	}

	pub fn register(&self, id: ServerId, peer: Arc<dyn LoopbackPeer>) {
		self.peers.lock().unwrap().insert(id, peer);
	}

	pub fn unregister(&self, id: ServerId) {
		self.peers.lock().unwrap().remove(&id);
	}

	fn get(&self, id: ServerId) -> io::Result<Arc<dyn LoopbackPeer>> {
		self.peers
			.lock()
			.unwrap()
			.get(&id)
			.cloned()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no loopback peer registered for {}", id)))
	}
}

#[async_trait]
impl RaftTransport for LoopbackTransport {
	async fn append_entries(&self, peer: ServerId, req: AppendEntriesRequest, _deadline: Duration) -> io::Result<AppendEntriesResponse> {
		Ok(self.get(peer)?.handle_append_entries(req).await)
	}

	async fn request_vote(&self, peer: ServerId, req: RequestVoteRequest, _deadline: Duration) -> io::Result<RequestVoteResponse> {
		Ok(self.get(peer)?.handle_request_vote(req).await)
	}

	async fn install_snapshot_chunk(&self, peer: ServerId, req: InstallSnapshotChunk, _deadline: Duration) -> io::Result<InstallSnapshotResponse> {
		Ok(self.get(peer)?.handle_install_snapshot(req).await)
	}
}

/// The three RPC flows, tagged so a single length-prefixed TCP frame can
/// carry any of them.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum WireRequest {
	AppendEntries(AppendEntriesRequest),
	RequestVote(RequestVoteRequest),
	InstallSnapshot(InstallSnapshotChunk),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum WireResponse {
	AppendEntries(AppendEntriesResponse),
	RequestVote(RequestVoteResponse),
	InstallSnapshot(InstallSnapshotResponse),
}

pub(crate) async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
	let mut framed = BytesMut::with_capacity(4 + payload.len());
	framed.put_u32(payload.len() as u32);
	framed.extend_from_slice(payload);
	writer.write_all(&framed).await
}

pub(crate) async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
	let mut len_buf = [0u8; 4];
	reader.read_exact(&mut len_buf).await?;
	let len = u32::from_be_bytes(len_buf) as usize;

	let mut payload = vec![0u8; len];
	reader.read_exact(&mut payload).await?;
	Ok(payload)
}

/// A length-prefixed (4-byte big-endian), `rmp-serde`-encoded TCP transport.
/// One connection is dialed per outbound RPC; this keeps the implementation
/// simple at the cost of handshake overhead, which is acceptable given at
/// most one in-flight request per peer per leader term (§4.4).
pub struct TcpTransport {
	addresses: HashMap<ServerId, String>,
	/// Serialises concurrent outbound sends per-peer so a stray timeout and a
	/// fresh retry can't interleave frames on the same reused connection.
	/// Currently unused since each call dials fresh, but kept so a pooled
	/// implementation can be dropped in without changing the trait.
	_send_locks: AsyncMutex<()>,
}

impl TcpTransport {
	pub fn new(addresses: HashMap<ServerId, String>) -> Self {
		TcpTransport { addresses, _send_locks: AsyncMutex::new(()) }
	}

	async fn roundtrip(&self, peer: ServerId, req: WireRequest, deadline: Duration) -> io::Result<WireResponse> {
		let addr = self
			.addresses
			.get(&peer)
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address configured for peer {}", peer)))?;

		let fut = async {
			let mut stream = TcpStream::connect(addr).await?;
			let payload = rmp_serde::to_vec(&req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
			write_frame(&mut stream, &payload).await?;

			let resp_bytes = read_frame(&mut stream).await?;
			let resp: WireResponse = rmp_serde::from_slice(&resp_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
			Ok(resp)
		};

		match tokio::time::timeout(deadline, fut).await {
			Ok(result) => result,
			Err(_) => {
				debug!(peer, "rpc timed out");
				Err(io::Error::new(io::ErrorKind::TimedOut, "rpc deadline exceeded"))
			}
		}
	}
}

#[async_trait]
impl RaftTransport for TcpTransport {
	async fn append_entries(&self, peer: ServerId, req: AppendEntriesRequest, deadline: Duration) -> io::Result<AppendEntriesResponse> {
		match self.roundtrip(peer, WireRequest::AppendEntries(req), deadline).await? {
			WireResponse::AppendEntries(r) => Ok(r),
			_ => Err(io::Error::new(io::ErrorKind::InvalidData, "mismatched response variant")),
		}
	}

	async fn request_vote(&self, peer: ServerId, req: RequestVoteRequest, deadline: Duration) -> io::Result<RequestVoteResponse> {
		match self.roundtrip(peer, WireRequest::RequestVote(req), deadline).await? {
			WireResponse::RequestVote(r) => Ok(r),
			_ => Err(io::Error::new(io::ErrorKind::InvalidData, "mismatched response variant")),
		}
	}

	async fn install_snapshot_chunk(&self, peer: ServerId, req: InstallSnapshotChunk, deadline: Duration) -> io::Result<InstallSnapshotResponse> {
		match self.roundtrip(peer, WireRequest::InstallSnapshot(req), deadline).await? {
			WireResponse::InstallSnapshot(r) => Ok(r),
			_ => Err(io::Error::new(io::ErrorKind::InvalidData, "mismatched response variant")),
		}
	}
}

/// Accepts inbound connections for `TcpTransport` peers and dispatches each
/// frame to the handler `H`. Runs until the listener is dropped or errors.
pub async fn serve_tcp<H: LoopbackPeer + 'static>(listener: TcpListener, handler: Arc<H>) -> io::Result<()> {
	loop {
		let (mut stream, addr) = listener.accept().await?;
		let handler = handler.clone();

		tokio::spawn(async move {
			loop {
				let payload = match read_frame(&mut stream).await {
					Ok(p) => p,
					Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
					Err(e) => {
						warn!(%addr, error = %e, "connection read failed");
						return;
					}
				};

				let req: WireRequest = match rmp_serde::from_slice(&payload) {
					Ok(r) => r,
					Err(e) => {
						warn!(%addr, error = %e, "failed to decode frame");
						return;
					}
				};

				let resp = match req {
					WireRequest::AppendEntries(r) => WireResponse::AppendEntries(handler.handle_append_entries(r).await),
					WireRequest::RequestVote(r) => WireResponse::RequestVote(handler.handle_request_vote(r).await),
					WireRequest::InstallSnapshot(r) => WireResponse::InstallSnapshot(handler.handle_install_snapshot(r).await),
				};

				let encoded = match rmp_serde::to_vec(&resp) {
					Ok(b) => b,
					Err(e) => {
						warn!(%addr, error = %e, "failed to encode response");
						return;
					}
				};

				if let Err(e) = write_frame(&mut stream, &encoded).await {
					warn!(%addr, error = %e, "connection write failed");
					return;
				}
			}
		});
	}
}
