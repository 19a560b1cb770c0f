use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// Turn a query into a reply carrying `rcode`.
pub fn answer(query: &[u8], rcode: u8) -> Vec<u8> {
	let mut reply = query.to_vec();
	if reply.len() >= 4 {
		reply[2] |= 0x80;
		reply[3] = (reply[3] & 0xf0) | (rcode & 0x0f);
	}
	reply
}

/// Answer every UDP query with `rcode`.
pub async fn udp_responder(rcode: u8) -> SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	tokio::spawn(async move {
		let mut buf = vec![0u8; 4096];
		while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
			let _ = socket.send_to(&answer(&buf[..n], rcode), peer).await;
		}
	});
	addr
}

/// Swallow every UDP query without answering.
pub async fn udp_black_hole() -> SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	tokio::spawn(async move {
		let mut buf = vec![0u8; 4096];
		while socket.recv_from(&mut buf).await.is_ok() {}
	});
	addr
}

/// Answer every length-prefixed TCP query with `rcode`.
pub async fn tcp_responder(rcode: u8) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				loop {
					let size = match stream.read_u16().await {
						Ok(size) => size as usize,
						Err(_) => return,
					};
					let mut query = vec![0u8; size];
					if stream.read_exact(&mut query).await.is_err() {
						return;
					}
					let reply = answer(&query, rcode);
					let mut frame = (reply.len() as u16).to_be_bytes().to_vec();
					frame.extend_from_slice(&reply);
					if stream.write_all(&frame).await.is_err() {
						return;
					}
				}
			});
		}
	});
	addr
}
