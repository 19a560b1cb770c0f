use std::fmt;
use std::str::FromStr;

use hickory_proto::rr::RecordType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domains::{fill_random_label, fqdn, pack_domain_name, random_domain, MAX_LABEL_LEN};
use crate::error::{LoaderError, Result};
use crate::rcode::RANDOM_QUERY_TYPES;

/// Size of the fixed DNS header
pub const HEADER_LEN: usize = 12;

/// Size of the OPT pseudo-record appended when EDNS or DNSSEC is requested
pub const OPT_RECORD_LEN: usize = 11;

/// Size of the TCP length prefix
pub const TCP_PREFIX_LEN: usize = 2;

/// Class IN
pub const CLASS_INET: u16 = 1;

// Root name, type OPT (41), UDP payload 4096, zero TTL, empty rdata.
const EDNS_OPT_RECORD: [u8; OPT_RECORD_LEN] = [0, 0, 41, 16, 0, 0, 0, 0, 0, 0, 0];
// Same record with the DO bit set in the flags half of the TTL.
const DNSSEC_OPT_RECORD: [u8; OPT_RECORD_LEN] = [0, 0, 41, 16, 0, 0, 0, 128, 0, 0, 0];

const FLAG_QR: u16 = 1 << 15;
const FLAG_AA: u16 = 1 << 10;
const FLAG_TC: u16 = 1 << 9;
const FLAG_RD: u16 = 1 << 8;
const FLAG_RA: u16 = 1 << 7;
const FLAG_Z: u16 = 1 << 6;
const FLAG_AD: u16 = 1 << 5;
const FLAG_CD: u16 = 1 << 4;

/// Transport a query is encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	#[default]
	Udp,
	Tcp,
}

impl Protocol {
	/// Offset of the DNS header inside an encoded buffer
	pub fn header_offset(self) -> usize {
		match self {
			Protocol::Udp => 0,
			Protocol::Tcp => TCP_PREFIX_LEN,
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Udp => f.write_str("udp"),
			Protocol::Tcp => f.write_str("tcp"),
		}
	}
}

impl FromStr for Protocol {
	type Err = LoaderError;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"udp" => Ok(Protocol::Udp),
			"tcp" => Ok(Protocol::Tcp),
			other => Err(LoaderError::InvalidConfig(format!(
				"invalid protocol '{}', [tcp, udp] only", other,
			))),
		}
	}
}

/// DNS header fields before packing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
	pub id: u16,
	pub response: bool,
	pub opcode: u8,
	pub authoritative: bool,
	pub truncated: bool,
	pub recursion_desired: bool,
	pub recursion_available: bool,
	pub zero: bool,
	pub authenticated_data: bool,
	pub checking_disabled: bool,
	pub rcode: u8,
}

impl Header {
	/// Pack the flag bits into the second header word.
	pub fn flags(&self) -> u16 {
		let mut bits = (u16::from(self.opcode & 0x0f) << 11) | u16::from(self.rcode & 0x0f);
		let flags = [
			(self.response, FLAG_QR),
			(self.authoritative, FLAG_AA),
			(self.truncated, FLAG_TC),
			(self.recursion_desired, FLAG_RD),
			(self.recursion_available, FLAG_RA),
			(self.zero, FLAG_Z),
			(self.authenticated_data, FLAG_AD),
			(self.checking_disabled, FLAG_CD),
		];
		for (set, bit) in flags {
			if set {
				bits |= bit;
			}
		}
		bits
	}
}

/// Query shape a template is built from.
#[derive(Debug, Clone)]
pub struct QueryOptions {
	pub domain: String,
	/// Length of the random label prepended to `domain`; 0 keeps it verbatim
	pub random_length: usize,
	/// Fixed query type, or None for a random type on every call
	pub query_type: Option<RecordType>,
	pub edns: bool,
	pub dnssec: bool,
	/// Force the top bit of every generated transaction ID
	pub force_high_bit_ids: bool,
	/// Seed for reproducible labels and IDs
	pub seed: Option<u64>,
}

impl QueryOptions {
	pub fn new(domain: &str) -> Self {
		QueryOptions {
			domain: domain.to_string(),
			random_length: 0,
			query_type: Some(RecordType::A),
			edns: false,
			dnssec: false,
			force_high_bit_ids: false,
			seed: None,
		}
	}
}

/// A reusable DNS query buffer.
///
/// Built once per run with [`PacketTemplate::initialize`], then mutated in
/// place for every call: a fresh transaction ID, a fresh random label and,
/// when enabled, a fresh query type. The buffer length never changes after
/// the build.
pub struct PacketTemplate {
	protocol: Protocol,
	header: Header,
	additional_count: u16,
	raw: Vec<u8>,
	built: bool,
	random_length: usize,
	random_type: bool,
	force_high_bit_ids: bool,
	/// Encoded question name length, root byte included
	name_len: usize,
	offset: usize,
	rng: StdRng,
}

impl PacketTemplate {
	/// Create an unbuilt template for the given transport.
	pub fn new(protocol: Protocol) -> Self {
		PacketTemplate {
			protocol,
			header: Header::default(),
			additional_count: 0,
			raw: Vec::new(),
			built: false,
			random_length: 0,
			random_type: false,
			force_high_bit_ids: false,
			name_len: 0,
			offset: protocol.header_offset(),
			rng: StdRng::from_entropy(),
		}
	}

	/// Build the query buffer and mark the template ready for refreshes.
	pub fn initialize(&mut self, options: &QueryOptions) -> Result<&[u8]> {
		if options.random_length > MAX_LABEL_LEN {
			return Err(LoaderError::InvalidDomain {
				domain: options.domain.clone(),
				reason: format!("random label length {} exceeds {}", options.random_length, MAX_LABEL_LEN),
			});
		}
		info!(
			protocol = %self.protocol,
			domain = %options.domain,
			length = options.random_length,
			edns = options.edns,
			dnssec = options.dnssec,
			"initializing dns packet template",
		);
		if let Some(seed) = options.seed {
			self.rng = StdRng::seed_from_u64(seed);
		}
		self.force_high_bit_ids = options.force_high_bit_ids;
		self.random_length = options.random_length;
		self.random_type = options.query_type.is_none();

		let qtype = u16::from(options.query_type.unwrap_or(RecordType::A));
		let name = fqdn(&random_domain(&mut self.rng, options.random_length, &options.domain));
		let packed_name = pack_domain_name(&name)?;

		self.header = Header {
			id: self.next_id(),
			recursion_desired: true,
			..Header::default()
		};
		self.additional_count = 0;
		if options.edns || options.dnssec {
			self.header.authenticated_data = true;
			self.additional_count = 1;
		}

		let mut msg = Vec::with_capacity(
			TCP_PREFIX_LEN + HEADER_LEN + packed_name.len() + 4 + OPT_RECORD_LEN,
		);
		msg.extend_from_slice(&self.header.id.to_be_bytes());
		msg.extend_from_slice(&self.header.flags().to_be_bytes());
		// QDCOUNT, ANCOUNT, NSCOUNT, ARCOUNT
		msg.extend_from_slice(&1u16.to_be_bytes());
		msg.extend_from_slice(&0u16.to_be_bytes());
		msg.extend_from_slice(&0u16.to_be_bytes());
		msg.extend_from_slice(&self.additional_count.to_be_bytes());

		msg.extend_from_slice(&packed_name);
		msg.extend_from_slice(&qtype.to_be_bytes());
		msg.extend_from_slice(&CLASS_INET.to_be_bytes());

		// OPT goes after the question and before the TCP prefix, which covers it
		if options.dnssec {
			msg.extend_from_slice(&DNSSEC_OPT_RECORD);
		} else if options.edns {
			msg.extend_from_slice(&EDNS_OPT_RECORD);
		}

		if self.protocol == Protocol::Tcp {
			let size = u16::try_from(msg.len()).map_err(|_| LoaderError::InvalidDomain {
				domain: options.domain.clone(),
				reason: "message too large for tcp framing".to_string(),
			})?;
			let mut framed = Vec::with_capacity(msg.len() + TCP_PREFIX_LEN);
			framed.extend_from_slice(&size.to_be_bytes());
			framed.extend_from_slice(&msg);
			msg = framed;
		}

		self.name_len = packed_name.len();
		self.raw = msg;
		self.built = true;
		Ok(&self.raw)
	}

	/// Overwrite ID, random label and (if enabled) type in place.
	///
	/// `label` must be exactly `random_length` bytes. Returns the shared
	/// buffer; it is only valid until the next refresh.
	pub fn refresh_for_next_call(&mut self, label: &[u8]) -> Result<&[u8]> {
		if !self.built {
			return Err(LoaderError::NotInitialized);
		}
		if label.len() != self.random_length {
			return Err(LoaderError::LabelLength {
				expected: self.random_length,
				actual: label.len(),
			});
		}
		let id = self.next_id();
		let offset = self.offset;
		self.raw[offset..offset + 2].copy_from_slice(&id.to_be_bytes());
		if !label.is_empty() {
			// Skip the first label's length byte
			let start = offset + HEADER_LEN + 1;
			self.raw[start..start + label.len()].copy_from_slice(label);
		}
		if self.random_type {
			let qtype = u16::from(RANDOM_QUERY_TYPES[self.rng.gen_range(0..RANDOM_QUERY_TYPES.len())]);
			let type_offset = offset + HEADER_LEN + self.name_len;
			self.raw[type_offset..type_offset + 2].copy_from_slice(&qtype.to_be_bytes());
		}
		Ok(&self.raw)
	}

	/// Refresh with a freshly generated random label, without allocating.
	pub fn next_query(&mut self) -> Result<&[u8]> {
		let mut label = [0u8; MAX_LABEL_LEN];
		let length = self.random_length.min(MAX_LABEL_LEN);
		fill_random_label(&mut self.rng, &mut label[..length]);
		self.refresh_for_next_call(&label[..length])
	}

	/// Generate a transaction ID, optionally with the top bit forced on.
	fn next_id(&mut self) -> u16 {
		let id: u16 = self.rng.gen();
		if self.force_high_bit_ids {
			id | 0x8000
		} else {
			id
		}
	}

	pub fn header(&self) -> &Header {
		&self.header
	}

	pub fn additional_count(&self) -> u16 {
		self.additional_count
	}

	pub fn random_type(&self) -> bool {
		self.random_type
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.raw
	}
}
