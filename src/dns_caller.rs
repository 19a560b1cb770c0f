use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::caller::{CallResult, Caller, RawRequest, RawResponse, ResultCode};
use crate::dns::{PacketTemplate, Protocol, QueryOptions};
use crate::error::{LoaderError, Result};
use crate::rcode::response_code;
use crate::transport::{Connection, MAX_MESSAGE_LEN};

/// Receive buffer for inline UDP reads, large enough for EDNS replies
const UDP_READ_BUF: usize = 4096;

/// Where DNS replies are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
	/// Background receiver per connection tallies reply codes off the wire
	#[default]
	Receiver,
	/// Each call waits for one reply and the engine classifies it
	Inline,
}

impl fmt::Display for ReadMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReadMode::Receiver => f.write_str("receiver"),
			ReadMode::Inline => f.write_str("inline"),
		}
	}
}

impl FromStr for ReadMode {
	type Err = LoaderError;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"receiver" => Ok(ReadMode::Receiver),
			"inline" => Ok(ReadMode::Inline),
			other => Err(LoaderError::InvalidConfig(format!(
				"invalid read mode '{}', [receiver, inline] only", other,
			))),
		}
	}
}

/// Everything needed to open a DNS caller.
#[derive(Debug, Clone)]
pub struct DnsCallerOptions {
	pub target: SocketAddr,
	pub protocol: Protocol,
	/// Number of parallel connections, used round-robin
	pub clients: usize,
	pub read_mode: ReadMode,
	pub query: QueryOptions,
	pub dial_timeout: Duration,
}

/// DNS over UDP or TCP, sending a refreshed template on every call.
pub struct DnsCaller {
	template: Mutex<PacketTemplate>,
	connections: Vec<Arc<Connection>>,
	read_mode: ReadMode,
	next_id: AtomicU64,
	next_conn: AtomicUsize,
}

impl DnsCaller {
	/// Build the query template and dial every client connection.
	pub async fn connect(options: DnsCallerOptions) -> Result<Self> {
		if options.clients == 0 {
			return Err(LoaderError::InvalidConfig("client number must be at least 1".to_string()));
		}
		let mut template = PacketTemplate::new(options.protocol);
		template.initialize(&options.query)?;

		let mut connections = Vec::with_capacity(options.clients);
		for _ in 0..options.clients {
			let conn = Connection::dial(options.protocol, options.target, options.dial_timeout).await?;
			connections.push(Arc::new(conn));
		}
		info!(
			server = %options.target,
			protocol = %options.protocol,
			clients = options.clients,
			read_mode = %options.read_mode,
			"dns caller connected",
		);

		Ok(DnsCaller {
			template: Mutex::new(template),
			connections,
			read_mode: options.read_mode,
			next_id: AtomicU64::new(1),
			next_conn: AtomicUsize::new(0),
		})
	}

	pub fn read_mode(&self) -> ReadMode {
		self.read_mode
	}

	pub fn client_count(&self) -> usize {
		self.connections.len()
	}

	fn pick_connection(&self) -> &Arc<Connection> {
		let n = self.next_conn.fetch_add(1, Ordering::Relaxed);
		&self.connections[n % self.connections.len()]
	}
}

impl Caller for DnsCaller {
	fn build_request(&self) -> Result<RawRequest> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let mut template = self.template.lock();
		let payload = template.next_query()?.to_vec();
		Ok(RawRequest { id, payload })
	}

	async fn execute(&self, request: &RawRequest, timeout: Duration) -> Result<Option<Vec<u8>>> {
		let conn = self.pick_connection();
		tokio::time::timeout(timeout, conn.send(&request.payload))
			.await
			.map_err(|_| LoaderError::Timeout(timeout))??;

		if self.read_mode == ReadMode::Receiver {
			return Ok(None);
		}

		let capacity = match conn.protocol() {
			Protocol::Udp => UDP_READ_BUF,
			Protocol::Tcp => MAX_MESSAGE_LEN,
		};
		let mut buf = vec![0u8; capacity];
		let n = tokio::time::timeout(timeout, conn.recv_message(&mut buf))
			.await
			.map_err(|_| LoaderError::Timeout(timeout))??;
		buf.truncate(n);
		Ok(Some(buf))
	}

	fn classify_response(&self, request: &RawRequest, response: &RawResponse) -> CallResult {
		// Replies from inline reads never carry the TCP prefix
		match response_code(&response.payload) {
			Some(rcode) => CallResult::new(request.id, ResultCode::Response(rcode), response.elapsed),
			None => CallResult::new(request.id, ResultCode::MalformedResponse, response.elapsed)
				.with_message(format!("{} byte reply is shorter than a dns header", response.payload.len())),
		}
	}

	fn connections(&self) -> Vec<Arc<Connection>> {
		match self.read_mode {
			ReadMode::Receiver => self.connections.clone(),
			ReadMode::Inline => Vec::new(),
		}
	}
}
