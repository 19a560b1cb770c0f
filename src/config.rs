use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dns::{Protocol, QueryOptions};
use crate::dns_caller::{DnsCallerOptions, ReadMode};
use crate::domains::{pack_domain_name, MAX_LABEL_LEN};
use crate::error::{LoaderError, Result};
use crate::generator::{RunSpec, DEFAULT_RESULT_CAPACITY};
use crate::rcode::parse_query_type;

pub const DEFAULT_PORT: u16 = 53;

/// One load job as an operator describes it.
///
/// Field names match the JSON job files pushed to agents, so a job can be
/// stored and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
	/// Target server IP, optionally with a port
	pub server: String,
	/// Port used when `server` carries none
	pub port: u16,
	pub protocol: Protocol,
	pub domain: String,
	pub domain_random_length: usize,
	/// Record type name, or "random" for a new type on every call
	pub query_type: String,
	pub edns: bool,
	pub dnssec: bool,
	/// 0 sends as fast as the ticket pool allows
	pub qps: u32,
	pub duration_secs: u64,
	pub timeout_ms: u64,
	/// 0 for no cap
	pub max_query: u64,
	pub client_number: usize,
	/// 0 derives the in-flight limit from timeout and QPS
	pub concurrency: usize,
	pub read_mode: ReadMode,
	pub seed: Option<u64>,
	pub force_high_bit_ids: bool,
	pub drain_grace_ms: u64,
}

impl Default for JobConfig {
	fn default() -> Self {
		JobConfig {
			server: "127.0.0.1".to_string(),
			port: DEFAULT_PORT,
			protocol: Protocol::Udp,
			domain: "example.com".to_string(),
			domain_random_length: 0,
			query_type: "A".to_string(),
			edns: false,
			dnssec: false,
			qps: 100,
			duration_secs: 10,
			timeout_ms: 1000,
			max_query: 0,
			client_number: 1,
			concurrency: 0,
			read_mode: ReadMode::Receiver,
			seed: None,
			force_high_bit_ids: false,
			drain_grace_ms: 2000,
		}
	}
}

/// Parse a server address, falling back to `default_port`.
///
/// Accepts:
///   "192.0.2.1"         IPv4
///   "192.0.2.1:5353"    IPv4 with port
///   "2001:db8::53"      bare IPv6
///   "[2001:db8::53]:53" bracketed IPv6 with port
pub fn parse_target(input: &str, default_port: u16) -> Result<SocketAddr> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(LoaderError::InvalidConfig("empty server address".to_string()));
	}
	let invalid = |e: std::net::AddrParseError| {
		LoaderError::InvalidConfig(format!("invalid server address '{}': {}", trimmed, e))
	};

	if trimmed.starts_with('[') {
		return trimmed.parse().map_err(invalid);
	}
	if let Ok(addr) = trimmed.parse::<SocketAddr>() {
		return Ok(addr);
	}
	let ip: IpAddr = trimmed.parse().map_err(invalid)?;
	Ok(SocketAddr::new(ip, default_port))
}

impl JobConfig {
	pub fn from_json_str(json: &str) -> Result<Self> {
		Ok(serde_json::from_str(json)?)
	}

	pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path).map_err(|e| {
			LoaderError::InvalidConfig(format!("failed to read job file '{}': {}", path.display(), e))
		})?;
		JobConfig::from_json_str(&content)
	}

	pub fn to_json_pretty(&self) -> Result<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}

	/// Check every field, reporting all problems together.
	pub fn validate(&self) -> Result<()> {
		let mut problems = Vec::new();
		if let Err(e) = parse_target(&self.server, self.port) {
			problems.push(e.to_string());
		}
		if self.port == 0 {
			problems.push("port must not be 0".to_string());
		}
		if self.domain_random_length > MAX_LABEL_LEN {
			problems.push(format!(
				"domain random length {} exceeds {} bytes",
				self.domain_random_length, MAX_LABEL_LEN,
			));
		} else {
			// Check the longest name the template will ever carry
			let probe = if self.domain_random_length == 0 {
				self.domain.clone()
			} else {
				format!("{}.{}", "a".repeat(self.domain_random_length), self.domain)
			};
			if let Err(e) = pack_domain_name(&probe) {
				problems.push(e.to_string());
			}
		}
		if let Err(e) = parse_query_type(&self.query_type) {
			problems.push(e.to_string());
		}
		if self.duration_secs == 0 {
			problems.push("duration must be at least 1 second".to_string());
		}
		if self.timeout_ms == 0 {
			problems.push("timeout must be at least 1 ms".to_string());
		}
		if self.client_number == 0 {
			problems.push("client number must be at least 1".to_string());
		}

		if problems.is_empty() {
			Ok(())
		} else {
			Err(LoaderError::InvalidConfig(problems.join("; ")))
		}
	}

	pub fn target(&self) -> Result<SocketAddr> {
		parse_target(&self.server, self.port)
	}

	pub fn duration(&self) -> Duration {
		Duration::from_secs(self.duration_secs)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}

	pub fn drain_grace(&self) -> Duration {
		Duration::from_millis(self.drain_grace_ms)
	}

	pub fn query_options(&self) -> Result<QueryOptions> {
		Ok(QueryOptions {
			domain: self.domain.clone(),
			random_length: self.domain_random_length,
			query_type: parse_query_type(&self.query_type)?,
			edns: self.edns,
			dnssec: self.dnssec,
			force_high_bit_ids: self.force_high_bit_ids,
			seed: self.seed,
		})
	}

	pub fn caller_options(&self) -> Result<DnsCallerOptions> {
		Ok(DnsCallerOptions {
			target: self.target()?,
			protocol: self.protocol,
			clients: self.client_number,
			read_mode: self.read_mode,
			query: self.query_options()?,
			dial_timeout: self.timeout(),
		})
	}

	/// Run parameters for `caller` built from this job.
	pub fn run_spec<C>(&self, caller: Arc<C>) -> RunSpec<C> {
		RunSpec {
			caller: Some(caller),
			timeout: self.timeout(),
			qps: self.qps,
			duration: self.duration(),
			max_calls: self.max_query,
			concurrency: self.concurrency,
			result_capacity: DEFAULT_RESULT_CAPACITY,
			drain_grace: self.drain_grace(),
		}
	}
}
