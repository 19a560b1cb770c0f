use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use crate::dns::{Protocol, TCP_PREFIX_LEN};
use crate::error::{LoaderError, Result};

/// Largest DNS message a receive buffer must hold
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Read half of a TCP connection plus the bytes of any partial frame.
///
/// Bytes stay buffered here when a read is cancelled mid-frame, so the
/// next read resumes at the same frame boundary.
#[derive(Debug)]
pub struct FrameReader {
	half: OwnedReadHalf,
	pending: Vec<u8>,
}

impl FrameReader {
	fn new(half: OwnedReadHalf) -> Self {
		FrameReader {
			half,
			pending: Vec::with_capacity(MAX_MESSAGE_LEN + TCP_PREFIX_LEN),
		}
	}

	/// Next length-prefixed message, copied into `buf` without its prefix.
	///
	/// Cancel safe: `read_buf` either appends to `pending` or reads nothing.
	async fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		loop {
			if self.pending.len() >= TCP_PREFIX_LEN {
				let size = u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
				if size > buf.len() {
					return Err(io::Error::new(
						io::ErrorKind::InvalidData,
						format!("frame of {} bytes exceeds buffer of {}", size, buf.len()),
					));
				}
				let end = TCP_PREFIX_LEN + size;
				if self.pending.len() >= end {
					buf[..size].copy_from_slice(&self.pending[TCP_PREFIX_LEN..end]);
					self.pending.drain(..end);
					return Ok(size);
				}
			}
			if self.half.read_buf(&mut self.pending).await? == 0 {
				return Err(io::Error::new(
					io::ErrorKind::UnexpectedEof,
					format!("connection closed with {} bytes of a partial frame", self.pending.len()),
				));
			}
		}
	}
}

/// An established connection to the target server.
///
/// UDP sockets are connected so `send`/`recv` only talk to the target.
/// TCP streams are split; each half sits behind an async lock so writers
/// and readers never interleave a frame.
#[derive(Debug)]
pub enum Connection {
	Udp(UdpSocket),
	Tcp {
		reader: Mutex<FrameReader>,
		writer: Mutex<OwnedWriteHalf>,
	},
}

impl Connection {
	/// Open a connection to `target`, bounding the TCP handshake by `timeout`.
	pub async fn dial(protocol: Protocol, target: SocketAddr, timeout: Duration) -> Result<Self> {
		match protocol {
			Protocol::Udp => {
				let bind_addr = if target.is_ipv4() {
					"0.0.0.0:0"
				} else {
					"[::]:0"
				};
				let socket = UdpSocket::bind(bind_addr).await?;
				socket.connect(target).await?;
				debug!(server = %target, local = ?socket.local_addr().ok(), "udp connection ready");
				Ok(Connection::Udp(socket))
			}
			Protocol::Tcp => {
				let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
					.await
					.map_err(|_| LoaderError::Timeout(timeout))??;
				stream.set_nodelay(true)?;
				debug!(server = %target, "tcp connection ready");
				let (reader, writer) = stream.into_split();
				Ok(Connection::Tcp {
					reader: Mutex::new(FrameReader::new(reader)),
					writer: Mutex::new(writer),
				})
			}
		}
	}

	pub fn protocol(&self) -> Protocol {
		match self {
			Connection::Udp(_) => Protocol::Udp,
			Connection::Tcp { .. } => Protocol::Tcp,
		}
	}

	/// Write one encoded query. TCP payloads must already carry their length prefix.
	pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
		match self {
			Connection::Udp(socket) => {
				socket.send(payload).await?;
				Ok(())
			}
			Connection::Tcp { writer, .. } => {
				let mut writer = writer.lock().await;
				writer.write_all(payload).await
			}
		}
	}

	/// Read one DNS message into `buf`, stripping the TCP length prefix.
	///
	/// Returns the message length. Several TCP frames delivered in a single
	/// segment are returned one per call, and a read dropped by a timeout
	/// leaves the stream aligned for the next one.
	pub async fn recv_message(&self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Connection::Udp(socket) => socket.recv(buf).await,
			Connection::Tcp { reader, .. } => reader.lock().await.next_frame(buf).await,
		}
	}
}
