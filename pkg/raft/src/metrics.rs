//! A minimal plaintext metrics endpoint: one `GET /metrics` route that reads
//! the consensus lock exactly once per request and formats a fixed set of
//! gauges a scraper can line-diff over time.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tracing::info;

use super::consensus::ConsensusModuleHandle;
use super::node::NodeMetrics;

fn render(module: &ConsensusModuleHandle, metrics: &NodeMetrics, log_len: u64) -> String {
	let module = module.lock().unwrap();
	let meta = module.meta();

	format!(
		"raft_role {}\n\
		 raft_current_term {}\n\
		 raft_commit_index {}\n\
		 raft_last_applied {}\n\
		 raft_log_length {}\n\
		 raft_elections_started {}\n\
		 raft_replication_failures {}\n",
		role_code(module.role_name()),
		meta.current_term,
		module.commit_index(),
		metrics.last_applied.load(std::sync::atomic::Ordering::SeqCst),
		log_len,
		module.elections_started(),
		module.replication_failures(),
	)
}

/// Numeric encoding of the role so the text stays one value per line, the way
/// a Prometheus-style gauge expects.
fn role_code(role: &str) -> u8 {
	match role {
		"follower" => 0,
		"candidate" => 1,
		"leader" => 2,
		_ => 255,
	}
}

async fn handle(req: Request<Body>, module: ConsensusModuleHandle, metrics: Arc<NodeMetrics>, log_len: u64) -> Result<Response<Body>, Infallible> {
	if req.uri().path() != "/metrics" {
		return Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()).unwrap());
	}

	let body = render(&module, &metrics, log_len);
	Ok(Response::builder()
		.status(StatusCode::OK)
		.header("Content-Type", "text/plain; version=0.0.4")
		.body(Body::from(body))
		.unwrap())
}

/// Serves `/metrics` on `addr` until the returned future is dropped or the
/// process exits. `log_len` is read fresh from the log on every request by
/// the caller's choice of `current_log_len` closure, since `LogStorage` isn't
/// `Sync`-cheap to snapshot from inside this module.
pub async fn serve_metrics(addr: SocketAddr, module: ConsensusModuleHandle, metrics: Arc<NodeMetrics>, current_log_len: impl Fn() -> u64 + Send + Sync + 'static) -> hyper::Result<()> {
	let current_log_len = Arc::new(current_log_len);

	let make_svc = make_service_fn(move |_conn| {
		let module = module.clone();
		let metrics = metrics.clone();
		let current_log_len = current_log_len.clone();

		async move {
			Ok::<_, Infallible>(service_fn(move |req| {
				let module = module.clone();
				let metrics = metrics.clone();
				let log_len = current_log_len();
				handle(req, module, metrics, log_len)
			}))
		}
	});

	info!(%addr, "metrics server listening");
	Server::bind(&addr).serve(make_svc).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn role_code_matches_known_roles() {
		assert_eq!(role_code("follower"), 0);
		assert_eq!(role_code("candidate"), 1);
		assert_eq!(role_code("leader"), 2);
		assert_eq!(role_code("bogus"), 255);
	}
}
