use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::caller::{CallResult, Caller, RawRequest, RawResponse, ResultCode};
use crate::error::{LoaderError, Result};
use crate::rcode::Rcode;

/// Message terminator on the wire
pub const DELIMITER: u8 = b'\n';

/// Supported operators
pub const OPERATORS: [&str; 4] = ["+", "-", "*", "/"];

/// Longest line either side will buffer
const MAX_LINE_LEN: u64 = 64 * 1024;

/// Request body: apply `operator` left to right over `operands`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRequest {
	pub id: u64,
	pub operands: Vec<i64>,
	pub operator: String,
}

/// Reply body. `err` is set when the server could not compute a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
	pub id: u64,
	pub result: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub err: Option<String>,
}

/// Evaluate `operands` folded with `operator`.
pub fn evaluate(operands: &[i64], operator: &str) -> std::result::Result<i64, String> {
	let (first, rest) = operands
		.split_first()
		.ok_or_else(|| "no operands".to_string())?;
	rest.iter().try_fold(*first, |acc, &value| {
		let next = match operator {
			"+" => acc.checked_add(value),
			"-" => acc.checked_sub(value),
			"*" => acc.checked_mul(value),
			"/" => {
				if value == 0 {
					return Err("division by zero".to_string());
				}
				acc.checked_div(value)
			}
			other => return Err(format!("unknown operator '{}'", other)),
		};
		next.ok_or_else(|| format!("overflow computing {} {} {}", acc, operator, value))
	})
}

/// Read one delimited message, without its delimiter.
async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>>
where
	R: tokio::io::AsyncBufRead + Unpin,
{
	let mut line = Vec::new();
	reader.read_until(DELIMITER, &mut line).await?;
	match line.pop() {
		Some(DELIMITER) => Ok(line),
		_ => Err(LoaderError::Protocol(format!(
			"connection closed after {} bytes without a delimiter",
			line.len(),
		))),
	}
}

async fn write_message(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
	let mut frame = Vec::with_capacity(payload.len() + 1);
	frame.extend_from_slice(payload);
	frame.push(DELIMITER);
	stream.write_all(&frame).await?;
	Ok(())
}

/// Caller for the arithmetic server.
///
/// Each call dials a fresh connection, writes one JSON request followed by
/// [`DELIMITER`] and reads one JSON reply up to the same byte.
pub struct JsonTcpCaller {
	target: SocketAddr,
	next_id: AtomicU64,
	rng: Mutex<StdRng>,
}

impl JsonTcpCaller {
	pub fn new(target: SocketAddr, seed: Option<u64>) -> Self {
		let rng = match seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};
		JsonTcpCaller {
			target,
			next_id: AtomicU64::new(1),
			rng: Mutex::new(rng),
		}
	}

	pub fn target(&self) -> SocketAddr {
		self.target
	}

	async fn round_trip(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
		let mut stream = tokio::time::timeout(timeout, TcpStream::connect(self.target))
			.await
			.map_err(|_| LoaderError::Timeout(timeout))??;
		write_message(&mut stream, payload).await?;
		let mut reader = BufReader::new(stream).take(MAX_LINE_LEN);
		read_message(&mut reader).await
	}
}

impl Caller for JsonTcpCaller {
	fn build_request(&self) -> Result<RawRequest> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let request = {
			let mut rng = self.rng.lock();
			ServerRequest {
				id,
				operands: vec![rng.gen_range(1..=1000), rng.gen_range(1..=1000)],
				operator: OPERATORS[rng.gen_range(0..OPERATORS.len())].to_string(),
			}
		};
		let payload = serde_json::to_vec(&request)?;
		Ok(RawRequest { id, payload })
	}

	async fn execute(&self, request: &RawRequest, timeout: Duration) -> Result<Option<Vec<u8>>> {
		// Dial, write and read share one deadline
		let reply = tokio::time::timeout(timeout, self.round_trip(&request.payload, timeout))
			.await
			.map_err(|_| LoaderError::Timeout(timeout))??;
		Ok(Some(reply))
	}

	fn classify_response(&self, request: &RawRequest, response: &RawResponse) -> CallResult {
		let sent: ServerRequest = match serde_json::from_slice(&request.payload) {
			Ok(sent) => sent,
			Err(e) => {
				return CallResult::new(request.id, ResultCode::Response(Rcode::FormatError), response.elapsed)
					.with_message(format!("request does not parse: {}", e));
			}
		};
		let reply: ServerResponse = match serde_json::from_slice(&response.payload) {
			Ok(reply) => reply,
			Err(e) => {
				return CallResult::new(request.id, ResultCode::MalformedResponse, response.elapsed).with_message(
					format!("reply does not parse ({}): {}", e, String::from_utf8_lossy(&response.payload)),
				);
			}
		};
		if reply.id != sent.id {
			return CallResult::new(request.id, ResultCode::IdMismatch, response.elapsed)
				.with_message(format!("reply id {} != request id {}", reply.id, sent.id));
		}
		if let Some(err) = reply.err {
			return CallResult::new(request.id, ResultCode::ServerError, response.elapsed)
				.with_message(format!("server reported: {}", err));
		}
		CallResult::new(request.id, ResultCode::Response(Rcode::NoError), response.elapsed)
	}
}

/// Arithmetic server answering one request per connection.
pub struct ArithServer {
	local_addr: SocketAddr,
	active: Arc<AtomicBool>,
	shutdown: watch::Sender<bool>,
}

impl ArithServer {
	/// Bind `addr` and start accepting in the background.
	pub async fn bind(addr: SocketAddr) -> Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		let local_addr = listener.local_addr()?;
		let active = Arc::new(AtomicBool::new(true));
		let (shutdown, shutdown_rx) = watch::channel(false);
		tokio::spawn(accept_loop(listener, Arc::clone(&active), shutdown_rx));
		info!(%local_addr, "arithmetic server listening");
		Ok(ArithServer {
			local_addr,
			active,
			shutdown,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	/// Stop accepting. Returns false if the server was already closed.
	pub fn close(&self) -> bool {
		if self
			.active
			.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return false;
		}
		let _ = self.shutdown.send(true);
		info!(local_addr = %self.local_addr, "arithmetic server closed");
		true
	}
}

impl Drop for ArithServer {
	fn drop(&mut self) {
		self.close();
	}
}

async fn accept_loop(listener: TcpListener, active: Arc<AtomicBool>, mut shutdown: watch::Receiver<bool>) {
	loop {
		tokio::select! {
			biased;
			_ = shutdown.changed() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					tokio::spawn(async move {
						if let Err(e) = handle_connection(stream).await {
							debug!(%peer, error = %e, "request failed");
						}
					});
				}
				Err(e) => {
					if !active.load(Ordering::Acquire) {
						break;
					}
					warn!(error = %e, "accept failed");
				}
			},
		}
	}
}

async fn handle_connection(stream: TcpStream) -> Result<()> {
	let mut reader = BufReader::new(stream);
	let reply = match read_message(&mut (&mut reader).take(MAX_LINE_LEN)).await {
		Ok(line) => match serde_json::from_slice::<ServerRequest>(&line) {
			Ok(request) => match evaluate(&request.operands, &request.operator) {
				Ok(result) => ServerResponse {
					id: request.id,
					result,
					err: None,
				},
				Err(err) => ServerResponse {
					id: request.id,
					result: 0,
					err: Some(err),
				},
			},
			Err(e) => ServerResponse {
				id: 0,
				result: 0,
				err: Some(format!("request does not parse: {}", e)),
			},
		},
		Err(e) => ServerResponse {
			id: 0,
			result: 0,
			err: Some(format!("request read failed: {}", e)),
		},
	};
	let payload = serde_json::to_vec(&reply)?;
	write_message(reader.get_mut(), &payload).await
}
