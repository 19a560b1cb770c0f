use thiserror::Error;

/// Errors produced by the load generator and its callers.
#[derive(Debug, Error)]
pub enum LoaderError {
	/// Run parameters rejected before any task was started
	#[error("invalid run parameters: {0}")]
	InvalidSpec(String),

	/// Operator job description rejected
	#[error("invalid job configuration: {0}")]
	InvalidConfig(String),

	/// The packet template was mutated before it was built
	#[error("packet template not initialized, call initialize() first")]
	NotInitialized,

	#[error("invalid domain name '{domain}': {reason}")]
	InvalidDomain { domain: String, reason: String },

	/// A refresh label does not fit the space reserved by the template
	#[error("label length mismatch: template holds {expected} bytes, got {actual}")]
	LabelLength { expected: usize, actual: usize },

	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),

	#[error("call timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
