//! The client-facing half of the wire protocol: `Put`/`Get` framed the same
//! way as the inter-node RPCs (4-byte big-endian length prefix, `rmp-serde`
//! payload) but carried over a separate connection from `RaftTransport`, since
//! a client never needs to speak `AppendEntries`/`RequestVote`/`InstallSnapshot`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use super::protos::{GetRequest, GetResponse, PutRequest, PutResponse, ServerId};
use super::transport::{read_frame, write_frame};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum ClientWireRequest {
	Put(PutRequest),
	Get(GetRequest),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum ClientWireResponse {
	Put(PutResponse),
	Get(GetResponse),
}

/// What a node exposes to a connecting client. Implemented by `Node`.
#[async_trait]
pub trait ClientHandler: Send + Sync {
	async fn handle_put(&self, req: PutRequest) -> PutResponse;
	async fn handle_get(&self, req: GetRequest) -> GetResponse;
}

/// Accepts client connections on `listener` and dispatches each request to
/// `handler`, one task per connection, mirroring `transport::serve_tcp`.
pub async fn serve_clients<H: ClientHandler + 'static>(listener: TcpListener, handler: Arc<H>) -> io::Result<()> {
	loop {
		let (mut stream, addr) = listener.accept().await?;
		let handler = handler.clone();

		tokio::spawn(async move {
			loop {
				let payload = match read_frame(&mut stream).await {
					Ok(p) => p,
					Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
					Err(e) => {
						warn!(%addr, error = %e, "client connection read failed");
						return;
					}
				};

				let req: ClientWireRequest = match rmp_serde::from_slice(&payload) {
					Ok(r) => r,
					Err(e) => {
						warn!(%addr, error = %e, "failed to decode client frame");
						return;
					}
				};

				let resp = match req {
					ClientWireRequest::Put(r) => ClientWireResponse::Put(handler.handle_put(r).await),
					ClientWireRequest::Get(r) => ClientWireResponse::Get(handler.handle_get(r).await),
				};

				let encoded = match rmp_serde::to_vec(&resp) {
					Ok(b) => b,
					Err(e) => {
						warn!(%addr, error = %e, "failed to encode client response");
						return;
					}
				};

				if let Err(e) = write_frame(&mut stream, &encoded).await {
					warn!(%addr, error = %e, "client connection write failed");
					return;
				}
			}
		});
	}
}

async fn roundtrip(addr: &str, req: &ClientWireRequest, deadline: Duration) -> io::Result<ClientWireResponse> {
	let fut = async {
		let mut stream = TcpStream::connect(addr).await?;
		let payload = rmp_serde::to_vec(req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		write_frame(&mut stream, &payload).await?;

		let resp_bytes = read_frame(&mut stream).await?;
		rmp_serde::from_slice(&resp_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
	};

	match tokio::time::timeout(deadline, fut).await {
		Ok(result) => result,
		Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "client rpc deadline exceeded")),
	}
}

/// A thin client that remembers the last server it believes is the leader and
/// tries there first, falling back to the full member list and following a
/// `NotLeader` hint for one retry before giving up. Does not itself retry
/// network errors; callers decide whether a failed `put`/`get` is worth
/// repeating against a different server.
pub struct RaftClient {
	addresses: HashMap<ServerId, String>,
	leader_hint: Mutex<Option<ServerId>>,
	deadline: Duration,
}

impl RaftClient {
	pub fn new(addresses: HashMap<ServerId, String>) -> Self {
		RaftClient { addresses, leader_hint: Mutex::new(None), deadline: Duration::from_millis(200) }
	}

	fn candidates(&self) -> Vec<ServerId> {
		let hint = *self.leader_hint.lock().unwrap();
		let mut ids: Vec<ServerId> = self.addresses.keys().copied().collect();
		if let Some(h) = hint {
			ids.sort_by_key(|id| if *id == h { 0 } else { 1 });
		}
		ids
	}

	fn set_hint(&self, hint: Option<ServerId>) {
		*self.leader_hint.lock().unwrap() = hint;
	}

	pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> io::Result<()> {
		let req = ClientWireRequest::Put(PutRequest { key, value });

		for id in self.candidates() {
			let addr = match self.addresses.get(&id) {
				Some(a) => a,
				None => continue,
			};

			let resp = match roundtrip(addr, &req, self.deadline).await {
				Ok(ClientWireResponse::Put(r)) => r,
				Ok(_) => continue,
				Err(_) => continue,
			};

			if resp.success {
				self.set_hint(Some(id));
				return Ok(());
			}
			self.set_hint(resp.leader_hint);
		}

		Err(io::Error::new(io::ErrorKind::NotConnected, "no reachable server accepted the write"))
	}

	pub async fn get(&self, key: Vec<u8>) -> io::Result<Option<Vec<u8>>> {
		let req = ClientWireRequest::Get(GetRequest { key });

		for id in self.candidates() {
			let addr = match self.addresses.get(&id) {
				Some(a) => a,
				None => continue,
			};

			match roundtrip(addr, &req, self.deadline).await {
				Ok(ClientWireResponse::Get(r)) => {
					self.set_hint(Some(id));
					return Ok(if r.found { r.value } else { None });
				}
				Ok(_) => continue,
				Err(_) => continue,
			}
		}

		Err(io::Error::new(io::ErrorKind::NotConnected, "no reachable server answered the read"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn candidates_prefers_hinted_leader_first() {
		let mut addresses = HashMap::new();
		addresses.insert(1, "127.0.0.1:1".to_string());
		addresses.insert(2, "127.0.0.1:2".to_string());
		addresses.insert(3, "127.0.0.1:3".to_string());

		let client = RaftClient::new(addresses);
		client.set_hint(Some(2));

		assert_eq!(client.candidates()[0], 2);
	}
}
