use std::fmt;
use std::str::FromStr;

use hickory_proto::rr::RecordType;

use crate::error::{LoaderError, Result};

/// DNS response code carried in the low nibble of header byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rcode {
	NoError,
	FormatError,
	ServerFailure,
	NameError,
	NotImplemented,
	Refused,
	YxDomain,
	YxRrSet,
	NxRrSet,
	NotAuth,
	NotZone,
	Reserved(u8),
}

/// Fixed lookup table from nibble value to symbolic code.
const RCODE_TABLE: [Rcode; 16] = [
	Rcode::NoError,
	Rcode::FormatError,
	Rcode::ServerFailure,
	Rcode::NameError,
	Rcode::NotImplemented,
	Rcode::Refused,
	Rcode::YxDomain,
	Rcode::YxRrSet,
	Rcode::NxRrSet,
	Rcode::NotAuth,
	Rcode::NotZone,
	Rcode::Reserved(11),
	Rcode::Reserved(12),
	Rcode::Reserved(13),
	Rcode::Reserved(14),
	Rcode::Reserved(15),
];

impl Rcode {
	/// Map the low four bits of `value` to a response code.
	pub fn from_nibble(value: u8) -> Self {
		RCODE_TABLE[(value & 0x0f) as usize]
	}

	pub fn value(self) -> u8 {
		match self {
			Rcode::NoError => 0,
			Rcode::FormatError => 1,
			Rcode::ServerFailure => 2,
			Rcode::NameError => 3,
			Rcode::NotImplemented => 4,
			Rcode::Refused => 5,
			Rcode::YxDomain => 6,
			Rcode::YxRrSet => 7,
			Rcode::NxRrSet => 8,
			Rcode::NotAuth => 9,
			Rcode::NotZone => 10,
			Rcode::Reserved(v) => v & 0x0f,
		}
	}

	/// Report label for this code
	pub fn name(self) -> &'static str {
		match self {
			Rcode::NoError => "Success",
			Rcode::FormatError => "FormatError",
			Rcode::ServerFailure => "ServerFailure",
			Rcode::NameError => "NXDOMAIN",
			Rcode::NotImplemented => "NotImplemented",
			Rcode::Refused => "Refused",
			Rcode::YxDomain => "YXDOMAIN",
			Rcode::YxRrSet => "YXRRSET",
			Rcode::NxRrSet => "NXRRSET",
			Rcode::NotAuth => "NotAuth",
			Rcode::NotZone => "NotZone",
			Rcode::Reserved(11) => "Reserved11",
			Rcode::Reserved(12) => "Reserved12",
			Rcode::Reserved(13) => "Reserved13",
			Rcode::Reserved(14) => "Reserved14",
			Rcode::Reserved(_) => "Reserved15",
		}
	}
}

impl fmt::Display for Rcode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Extract the response code of a DNS message (no TCP length prefix).
///
/// Returns None when the buffer is too short to hold header byte 3.
pub fn response_code(message: &[u8]) -> Option<Rcode> {
	message.get(3).map(|b| Rcode::from_nibble(*b))
}

/// Query types drawn from when the template randomizes the type per call.
pub const RANDOM_QUERY_TYPES: [RecordType; 9] = [
	RecordType::A,
	RecordType::AAAA,
	RecordType::CNAME,
	RecordType::MX,
	RecordType::NS,
	RecordType::PTR,
	RecordType::SOA,
	RecordType::SRV,
	RecordType::TXT,
];

/// Parse an operator query type such as "a", "AAAA" or "mx".
///
/// Empty input and "random" yield None, meaning a random type per call.
pub fn parse_query_type(input: &str) -> Result<Option<RecordType>> {
	let trimmed = input.trim();
	if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("random") {
		return Ok(None);
	}
	let upper = trimmed.to_ascii_uppercase();
	match RecordType::from_str(&upper) {
		Ok(RecordType::Unknown(_)) | Err(_) => Err(LoaderError::InvalidConfig(
			format!("unknown query type '{}'", trimmed),
		)),
		Ok(record_type) => Ok(Some(record_type)),
	}
}
