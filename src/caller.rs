use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::LoaderError;
use crate::rcode::Rcode;
use crate::transport::Connection;

/// A request ready to be sent, tagged with a local correlation ID.
///
/// The ID is independent of any wire-level identifier such as the 16-bit
/// DNS transaction ID.
#[derive(Debug, Clone)]
pub struct RawRequest {
	pub id: u64,
	pub payload: Vec<u8>,
}

/// A reply read back for a [`RawRequest`].
#[derive(Debug, Clone)]
pub struct RawResponse {
	pub id: u64,
	pub payload: Vec<u8>,
	pub elapsed: Duration,
}

/// Classification of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
	/// Server answered; `Rcode::NoError` doubles as generic success
	Response(Rcode),
	/// No completion before the per-call deadline
	Timeout,
	/// Build, dial, write or read failure, or a panic inside the call
	CallError,
	/// Reply could not be decoded
	MalformedResponse,
	/// Reply carried another request's correlation ID
	IdMismatch,
	/// Server reported an error in its reply
	ServerError,
}

impl ResultCode {
	pub fn is_success(self) -> bool {
		self == ResultCode::Response(Rcode::NoError)
	}

	pub fn label(self) -> &'static str {
		match self {
			ResultCode::Response(rcode) => rcode.name(),
			ResultCode::Timeout => "Timeout",
			ResultCode::CallError => "CallError",
			ResultCode::MalformedResponse => "MalformedResponse",
			ResultCode::IdMismatch => "IdMismatch",
			ResultCode::ServerError => "ServerError",
		}
	}
}

impl fmt::Display for ResultCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.label())
	}
}

/// Outcome of one issued call.
#[derive(Debug, Clone)]
pub struct CallResult {
	/// Correlation ID, None when the request never got built
	pub id: Option<u64>,
	pub code: ResultCode,
	pub message: String,
	pub elapsed: Duration,
}

impl CallResult {
	pub fn new(id: u64, code: ResultCode, elapsed: Duration) -> Self {
		CallResult {
			id: Some(id),
			code,
			message: String::new(),
			elapsed,
		}
	}

	pub fn with_message(mut self, message: impl Into<String>) -> Self {
		self.message = message.into();
		self
	}

	pub fn timeout(id: Option<u64>, timeout: Duration) -> Self {
		CallResult {
			id,
			code: ResultCode::Timeout,
			message: format!("no reply within {:?}", timeout),
			elapsed: timeout,
		}
	}

	pub fn call_error(id: Option<u64>, message: impl Into<String>, elapsed: Duration) -> Self {
		CallResult {
			id,
			code: ResultCode::CallError,
			message: message.into(),
			elapsed,
		}
	}
}

/// Something the load generator can drive.
///
/// `execute` returns `Some(reply)` when it read a reply for the engine to
/// classify, or `None` when it only sent the request and replies are
/// consumed by receiver loops over [`Caller::connections`].
pub trait Caller: Send + Sync + 'static {
	/// Produce the next request.
	fn build_request(&self) -> Result<RawRequest, LoaderError>;

	/// Send one request, reading at most until `timeout` elapses.
	fn execute(
		&self,
		request: &RawRequest,
		timeout: Duration,
	) -> impl Future<Output = Result<Option<Vec<u8>>, LoaderError>> + Send;

	/// Map a reply to a result code.
	fn classify_response(&self, request: &RawRequest, response: &RawResponse) -> CallResult;

	/// Connections whose replies should be read by background receivers.
	fn connections(&self) -> Vec<Arc<Connection>> {
		Vec::new()
	}
}

const CALL_NOT_FINISHED: u8 = 0;
const CALL_COMPLETED: u8 = 1;
const CALL_TIMED_OUT: u8 = 2;
const CALL_FAILED: u8 = 3;

/// How a call was finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
	Completed,
	TimedOut,
	Failed,
}

/// Per-call finished flag; the first `try_finish` wins.
#[derive(Debug, Default)]
pub struct CallState {
	status: AtomicU8,
	request_id: OnceLock<u64>,
}

impl CallState {
	pub fn new() -> Self {
		CallState::default()
	}

	/// Mark the call finished. Returns false if another path got there first.
	pub fn try_finish(&self, how: Finish) -> bool {
		let next = match how {
			Finish::Completed => CALL_COMPLETED,
			Finish::TimedOut => CALL_TIMED_OUT,
			Finish::Failed => CALL_FAILED,
		};
		self.status
			.compare_exchange(CALL_NOT_FINISHED, next, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Remember the correlation ID once the request is built.
	pub fn set_request_id(&self, id: u64) {
		let _ = self.request_id.set(id);
	}

	pub fn request_id(&self) -> Option<u64> {
		self.request_id.get().copied()
	}

	pub fn finished(&self) -> Option<Finish> {
		match self.status.load(Ordering::Acquire) {
			CALL_COMPLETED => Some(Finish::Completed),
			CALL_TIMED_OUT => Some(Finish::TimedOut),
			CALL_FAILED => Some(Finish::Failed),
			_ => None,
		}
	}
}
