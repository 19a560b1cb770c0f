use rand::Rng;

use crate::error::{LoaderError, Result};

/// Characters a randomized sub-domain label is drawn from.
pub const LABEL_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Longest label allowed on the wire (RFC 1035 section 2.3.4).
pub const MAX_LABEL_LEN: usize = 63;

/// Longest encoded name allowed on the wire, length bytes included.
pub const MAX_NAME_LEN: usize = 255;

/// Fill `out` with characters drawn from [`LABEL_ALPHABET`].
///
/// Writes in place so the per-call refresh path never allocates.
pub fn fill_random_label<R: Rng + ?Sized>(rng: &mut R, out: &mut [u8]) {
	for byte in out.iter_mut() {
		*byte = LABEL_ALPHABET[rng.gen_range(0..LABEL_ALPHABET.len())];
	}
}

/// Generate a random label of exactly `length` characters.
pub fn random_label<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
	let mut label = vec![0u8; length];
	fill_random_label(rng, &mut label);
	// Alphabet is pure ASCII
	String::from_utf8(label).unwrap_or_default()
}

/// Build "<random label>.<base>" or return the base verbatim when length is 0.
pub fn random_domain<R: Rng + ?Sized>(rng: &mut R, length: usize, base: &str) -> String {
	if length == 0 {
		return base.to_string();
	}
	let mut domain = random_label(rng, length);
	domain.push('.');
	domain.push_str(base);
	domain
}

/// Append the root dot if the name does not already end with one.
pub fn fqdn(name: &str) -> String {
	if name.ends_with('.') {
		name.to_string()
	} else {
		format!("{}.", name)
	}
}

/// Encode a domain name into length-prefixed label form, root label included.
///
/// "www.example.com" becomes `3www7example3com0`. The root name "." encodes
/// to a single zero byte.
pub fn pack_domain_name(name: &str) -> Result<Vec<u8>> {
	let trimmed = name.trim_end_matches('.');
	let mut packed = Vec::with_capacity(trimmed.len() + 2);
	if !trimmed.is_empty() {
		for label in trimmed.split('.') {
			if label.is_empty() {
				return Err(invalid(name, "empty label"));
			}
			if label.len() > MAX_LABEL_LEN {
				return Err(invalid(name, &format!(
					"label '{}' longer than {} bytes", label, MAX_LABEL_LEN,
				)));
			}
			if !label.is_ascii() {
				return Err(invalid(name, "non-ascii label"));
			}
			packed.push(label.len() as u8);
			packed.extend_from_slice(label.as_bytes());
		}
	}
	packed.push(0);
	if packed.len() > MAX_NAME_LEN {
		return Err(invalid(name, &format!("encoded name longer than {} bytes", MAX_NAME_LEN)));
	}
	Ok(packed)
}

fn invalid(name: &str, reason: &str) -> LoaderError {
	LoaderError::InvalidDomain {
		domain: name.to_string(),
		reason: reason.to_string(),
	}
}
