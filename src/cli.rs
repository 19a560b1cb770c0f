use anyhow::{Context, Result};
use clap::Parser;

use dns_loader::config::JobConfig;
use dns_loader::dns::Protocol;
use dns_loader::dns_caller::ReadMode;

/// DNS traffic generator
#[derive(Parser, Debug)]
#[command(name = "dns-loader")]
#[command(about = "Send paced DNS query load to a server and report response codes")]
pub struct Cli {
	/// Target DNS server (e.g. 192.0.2.1, 192.0.2.1:5353 or [2001:db8::1]:53)
	#[arg(short = 's', long = "server", default_value = "127.0.0.1")]
	pub server: String,

	/// Port used when the server address has none
	#[arg(short = 'p', long = "port", default_value = "53")]
	pub port: u16,

	/// Transport: udp or tcp
	#[arg(long = "protocol", default_value = "udp")]
	pub protocol: Protocol,

	/// Base domain to query
	#[arg(short = 'd', long = "domain", default_value = "example.com")]
	pub domain: String,

	/// Length of the random label prepended to the domain (0 disables)
	#[arg(short = 'l', long = "random-length", default_value = "0")]
	pub random_length: usize,

	/// Query type name, or "random" for a new type on every query
	#[arg(short = 't', long = "query-type", default_value = "A")]
	pub query_type: String,

	/// Append an EDNS0 OPT record
	#[arg(long = "edns")]
	pub edns: bool,

	/// Append an OPT record with the DO bit set
	#[arg(long = "dnssec")]
	pub dnssec: bool,

	/// Target queries per second (0 = unpaced)
	#[arg(short = 'q', long = "qps", default_value = "100")]
	pub qps: u32,

	/// Run duration in seconds
	#[arg(short = 'D', long = "duration", default_value = "10")]
	pub duration: u64,

	/// Per-query timeout in milliseconds
	#[arg(long = "timeout", default_value = "1000")]
	pub timeout: u64,

	/// Stop after this many queries (0 = no cap)
	#[arg(short = 'm', long = "max", default_value = "0")]
	pub max: u64,

	/// Number of client connections, used round-robin
	#[arg(short = 'c', long = "clients", default_value = "1")]
	pub clients: usize,

	/// Maximum in-flight queries (0 = derived from timeout and QPS)
	#[arg(long = "concurrency", default_value = "0")]
	pub concurrency: usize,

	/// Where replies are read: receiver or inline
	#[arg(long = "read-mode", default_value = "receiver")]
	pub read_mode: ReadMode,

	/// Random seed for reproducible labels and IDs
	#[arg(long = "seed")]
	pub seed: Option<u64>,

	/// Force the top bit of every transaction ID
	#[arg(long = "high-bit-ids")]
	pub high_bit_ids: bool,

	/// Milliseconds to keep counting replies after the last query
	#[arg(long = "drain-grace", default_value = "2000")]
	pub drain_grace: u64,

	/// Load the job from a JSON file instead of the flags above
	#[arg(short = 'j', long = "job-file")]
	pub job_file: Option<String>,

	/// Output CSV file path
	#[arg(short = 'o', long = "output")]
	pub output: Option<String>,

	/// Output JSON report file path
	#[arg(long = "json")]
	pub json: Option<String>,

	/// Debug logging (RUST_LOG overrides)
	#[arg(short = 'v', long = "verbose")]
	pub verbose: bool,
}

impl Cli {
	/// Job described by the job file, or by the flags when there is none.
	pub fn job_config(&self) -> Result<JobConfig> {
		if let Some(path) = &self.job_file {
			return JobConfig::from_json_file(path)
				.with_context(|| format!("failed to load job file '{}'", path));
		}
		Ok(JobConfig {
			server: self.server.clone(),
			port: self.port,
			protocol: self.protocol,
			domain: self.domain.clone(),
			domain_random_length: self.random_length,
			query_type: self.query_type.clone(),
			edns: self.edns,
			dnssec: self.dnssec,
			qps: self.qps,
			duration_secs: self.duration,
			timeout_ms: self.timeout,
			max_query: self.max,
			client_number: self.clients,
			concurrency: self.concurrency,
			read_mode: self.read_mode,
			seed: self.seed,
			force_high_bit_ids: self.high_bit_ids,
			drain_grace_ms: self.drain_grace,
		})
	}
}
