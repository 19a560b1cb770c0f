use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::caller::{CallResult, CallState, Caller, Finish, RawResponse};
use crate::dns::Protocol;
use crate::error::{LoaderError, Result};
use crate::rcode::response_code;
use crate::stats::{Report, StatsAggregator};
use crate::ticket::{Ticket, TicketPool};
use crate::transport::{Connection, MAX_MESSAGE_LEN};

/// Ticket pool size when neither concurrency nor QPS bound it
pub const DEFAULT_POOL_SIZE: usize = 1024;

/// Result channel capacity of a fresh [`RunSpec`]
pub const DEFAULT_RESULT_CAPACITY: usize = 4096;

/// How often `stop` and `wait` look at the status
const STATUS_POLL: Duration = Duration::from_millis(1);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters of one run.
pub struct RunSpec<C> {
	pub caller: Option<Arc<C>>,
	/// Per-call deadline
	pub timeout: Duration,
	/// Target calls per second, 0 for no pacing
	pub qps: u32,
	pub duration: Duration,
	/// Stop after this many calls, 0 for no cap
	pub max_calls: u64,
	/// In-flight call limit, 0 to derive it from timeout and QPS
	pub concurrency: usize,
	pub result_capacity: usize,
	/// Wait after pacing ends so late replies are still counted
	pub drain_grace: Duration,
}

impl<C> Clone for RunSpec<C> {
	fn clone(&self) -> Self {
		RunSpec {
			caller: self.caller.clone(),
			timeout: self.timeout,
			qps: self.qps,
			duration: self.duration,
			max_calls: self.max_calls,
			concurrency: self.concurrency,
			result_capacity: self.result_capacity,
			drain_grace: self.drain_grace,
		}
	}
}

impl<C> fmt::Debug for RunSpec<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RunSpec")
			.field("caller", &self.caller.as_ref().map(|_| "set"))
			.field("timeout", &self.timeout)
			.field("qps", &self.qps)
			.field("duration", &self.duration)
			.field("max_calls", &self.max_calls)
			.field("concurrency", &self.concurrency)
			.field("result_capacity", &self.result_capacity)
			.field("drain_grace", &self.drain_grace)
			.finish()
	}
}

impl<C> RunSpec<C> {
	/// A 10 second run at 100 QPS with a one second call timeout.
	pub fn new(caller: Arc<C>) -> Self {
		RunSpec {
			caller: Some(caller),
			timeout: Duration::from_secs(1),
			qps: 100,
			duration: Duration::from_secs(10),
			max_calls: 0,
			concurrency: 0,
			result_capacity: DEFAULT_RESULT_CAPACITY,
			drain_grace: Duration::ZERO,
		}
	}

	/// Reject a run that cannot work. Every problem is reported at once.
	pub fn validate(&self) -> Result<()> {
		let mut problems = Vec::new();
		if self.caller.is_none() {
			problems.push("caller is not set");
		}
		if self.timeout.is_zero() {
			problems.push("timeout must be greater than zero");
		}
		if self.duration.is_zero() {
			problems.push("duration must be greater than zero");
		}
		if self.result_capacity == 0 {
			problems.push("result channel capacity must be greater than zero");
		}
		if problems.is_empty() {
			Ok(())
		} else {
			Err(LoaderError::InvalidSpec(problems.join("; ")))
		}
	}

	/// In-flight limit for this run.
	///
	/// Without an explicit concurrency the pool holds the number of calls
	/// that can be outstanding at the target rate: `timeout / interval + 1`.
	pub fn ticket_pool_size(&self) -> usize {
		if self.concurrency > 0 {
			return self.concurrency;
		}
		if self.qps == 0 {
			return DEFAULT_POOL_SIZE;
		}
		let interval_ns = 1_000_000_000u128 / self.qps as u128;
		let total = self.timeout.as_nanos() / interval_ns.max(1) + 1;
		total.min(u32::MAX as u128) as usize
	}
}

/// Lifecycle of a [`LoadGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Status {
	Stopped = 0,
	Starting = 1,
	Running = 2,
	Stopping = 3,
}

impl Status {
	fn from_u8(value: u8) -> Self {
		match value {
			1 => Status::Starting,
			2 => Status::Running,
			3 => Status::Stopping,
			_ => Status::Stopped,
		}
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Status::Stopped => "stopped",
			Status::Starting => "starting",
			Status::Running => "running",
			Status::Stopping => "stopping",
		};
		f.write_str(name)
	}
}

/// Why the pacing loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
	Cancelled,
	Deadline,
	MaxCalls,
}

impl fmt::Display for StopReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StopReason::Cancelled => f.write_str("stopped"),
			StopReason::Deadline => f.write_str("duration elapsed"),
			StopReason::MaxCalls => f.write_str("call limit reached"),
		}
	}
}

struct Shared<C> {
	spec: RunSpec<C>,
	status: AtomicU8,
	call_count: AtomicU64,
	cancel: Mutex<Option<watch::Sender<bool>>>,
	report: Mutex<Option<Report>>,
}

impl<C> Shared<C> {
	fn status(&self) -> Status {
		Status::from_u8(self.status.load(Ordering::Acquire))
	}

	fn set_status(&self, status: Status) {
		self.status.store(status as u8, Ordering::Release);
	}

	fn transition(&self, from: Status, to: Status) -> bool {
		self.status
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Hand a finished call to the collector without ever blocking.
	fn report_result(&self, results: &mpsc::Sender<CallResult>, result: CallResult) {
		match self.status() {
			Status::Running | Status::Stopping => {}
			status => {
				debug!(id = ?result.id, code = %result.code, %status, "run not active, ignoring result");
				return;
			}
		}
		match results.try_send(result) {
			Ok(()) => {}
			Err(TrySendError::Full(result)) => {
				warn!(id = ?result.id, code = %result.code, "result channel full, dropping result");
			}
			Err(TrySendError::Closed(result)) => {
				debug!(id = ?result.id, code = %result.code, "result channel closed, ignoring result");
			}
		}
	}
}

/// Paced, bounded, cancellable call loop around a [`Caller`].
///
/// A generator owns at most one run at a time. Handles are cheap to clone
/// and share the same run.
pub struct LoadGenerator<C> {
	shared: Arc<Shared<C>>,
}

impl<C> Clone for LoadGenerator<C> {
	fn clone(&self) -> Self {
		LoadGenerator {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<C: Caller> LoadGenerator<C> {
	pub fn new(spec: RunSpec<C>) -> Self {
		LoadGenerator {
			shared: Arc::new(Shared {
				spec,
				status: AtomicU8::new(Status::Stopped as u8),
				call_count: AtomicU64::new(0),
				cancel: Mutex::new(None),
				report: Mutex::new(None),
			}),
		}
	}

	pub fn spec(&self) -> &RunSpec<C> {
		&self.shared.spec
	}

	pub fn status(&self) -> Status {
		self.shared.status()
	}

	/// Calls issued by the current or last run.
	pub fn call_count(&self) -> u64 {
		self.shared.call_count.load(Ordering::Acquire)
	}

	/// Report of the last finished run.
	pub fn report(&self) -> Option<Report> {
		self.shared.report.lock().clone()
	}

	/// Begin a run. Returns false if the spec is invalid, a run is already
	/// active, or there is no tokio runtime to run on.
	pub fn start(&self) -> bool {
		let shared = &self.shared;
		if let Err(e) = shared.spec.validate() {
			error!(error = %e, "refusing to start");
			return false;
		}
		let caller = match &shared.spec.caller {
			Some(caller) => Arc::clone(caller),
			None => return false,
		};
		if !shared.transition(Status::Stopped, Status::Starting) {
			warn!(status = %shared.status(), "load generator already active");
			return false;
		}
		let runtime = match tokio::runtime::Handle::try_current() {
			Ok(runtime) => runtime,
			Err(e) => {
				error!(error = %e, "no async runtime to start on");
				shared.set_status(Status::Stopped);
				return false;
			}
		};

		shared.call_count.store(0, Ordering::Release);
		*shared.report.lock() = None;
		let (cancel_tx, cancel_rx) = watch::channel(false);
		*shared.cancel.lock() = Some(cancel_tx);

		info!(
			qps = shared.spec.qps,
			duration = ?shared.spec.duration,
			timeout = ?shared.spec.timeout,
			max_calls = shared.spec.max_calls,
			pool = shared.spec.ticket_pool_size(),
			"starting load generator",
		);
		shared.set_status(Status::Running);
		let supervised = Arc::clone(shared);
		runtime.spawn(async move {
			let body = tokio::spawn(run(Arc::clone(&supervised), caller, cancel_rx));
			// A panicking run must still end up Stopped
			if let Err(e) = body.await {
				error!(error = %e, "load generator run aborted");
				*supervised.cancel.lock() = None;
				supervised.set_status(Status::Stopped);
			}
		});
		true
	}

	/// Cancel the active run and wait until it has fully stopped.
	///
	/// Only one concurrent caller gets true; the others return at once.
	pub async fn stop(&self) -> bool {
		let shared = &self.shared;
		if !shared.transition(Status::Running, Status::Stopping) {
			return false;
		}
		if let Some(cancel) = shared.cancel.lock().as_ref() {
			let _ = cancel.send(true);
		}
		while shared.status() != Status::Stopped {
			tokio::time::sleep(STATUS_POLL).await;
		}
		true
	}

	/// Wait for the active run to end on its own and return its report.
	pub async fn wait(&self) -> Option<Report> {
		while self.status() != Status::Stopped {
			tokio::time::sleep(STATUS_POLL).await;
		}
		self.report()
	}
}

async fn run<C: Caller>(shared: Arc<Shared<C>>, caller: Arc<C>, mut cancel: watch::Receiver<bool>) {
	let spec = &shared.spec;
	let stats = Arc::new(StatsAggregator::new());

	let (halt_tx, halt_rx) = watch::channel(false);
	let receivers: Vec<JoinHandle<()>> = caller
		.connections()
		.into_iter()
		.map(|conn| tokio::spawn(receive_replies(conn, Arc::clone(&stats), halt_rx.clone())))
		.collect();

	let (results_tx, results_rx) = mpsc::channel(spec.result_capacity);
	let (collector_stop, collector_stop_rx) = oneshot::channel();
	let collector = tokio::spawn(collect_results(results_rx, Arc::clone(&stats), collector_stop_rx));
	let progress = tokio::spawn(log_progress(Arc::clone(&shared)));

	let mut calls = JoinSet::new();
	let started = Instant::now();
	let reason = pace(&shared, &caller, results_tx, &mut cancel, &mut calls, &halt_rx).await;
	let elapsed = started.elapsed();

	// prepare stop
	shared.set_status(Status::Stopping);
	info!(%reason, calls = shared.call_count.load(Ordering::Acquire), ?elapsed, "pacing ended");
	if !spec.drain_grace.is_zero() {
		tokio::time::sleep(spec.drain_grace).await;
	}
	// Halts receivers and aborts calls still in flight
	let _ = halt_tx.send(true);
	for receiver in receivers {
		let _ = receiver.await;
	}
	let mut abandoned = 0u64;
	while let Some(joined) = calls.join_next().await {
		if let Ok(CallEnd::Abandoned) = joined {
			abandoned += 1;
		}
	}
	if abandoned > 0 {
		debug!(abandoned, "in-flight calls cancelled at stop");
	}
	let _ = collector_stop.send(());
	let _ = collector.await;
	progress.abort();

	let report = stats.report(shared.call_count.load(Ordering::Acquire), elapsed);
	info!(
		issued = report.issued,
		success = report.success,
		errors = report.errors,
		timeouts = report.timeouts,
		unknown = report.unknown,
		qps = report.achieved_qps,
		"run finished",
	);
	*shared.report.lock() = Some(report);
	*shared.cancel.lock() = None;
	drop(caller);
	shared.set_status(Status::Stopped);
}

async fn next_tick(ticker: &mut Option<Interval>) {
	match ticker {
		Some(ticker) => {
			ticker.tick().await;
		}
		None => tokio::task::yield_now().await,
	}
}

/// Issue calls until cancelled, out of time, or out of calls.
async fn pace<C: Caller>(
	shared: &Arc<Shared<C>>,
	caller: &Arc<C>,
	results: mpsc::Sender<CallResult>,
	cancel: &mut watch::Receiver<bool>,
	calls: &mut JoinSet<CallEnd>,
	halt: &watch::Receiver<bool>,
) -> StopReason {
	let spec = &shared.spec;
	let pool = TicketPool::new(spec.ticket_pool_size());
	let deadline = tokio::time::sleep(spec.duration);
	tokio::pin!(deadline);

	let mut ticker = (spec.qps > 0).then(|| {
		// Above 1e9 QPS the period rounds to zero, which interval rejects
		let period = Duration::from_nanos((1_000_000_000 / spec.qps as u64).max(1));
		let mut ticker = tokio::time::interval(period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		ticker
	});

	loop {
		while calls.try_join_next().is_some() {}
		tokio::select! {
			biased;
			_ = cancel.changed() => return StopReason::Cancelled,
			_ = &mut deadline => return StopReason::Deadline,
			_ = next_tick(&mut ticker) => {}
		}
		let ticket = tokio::select! {
			biased;
			_ = cancel.changed() => return StopReason::Cancelled,
			_ = &mut deadline => return StopReason::Deadline,
			ticket = pool.acquire() => ticket,
		};

		let issued = shared.call_count.fetch_add(1, Ordering::AcqRel) + 1;
		spawn_call(calls, Arc::clone(shared), Arc::clone(caller), results.clone(), ticket, halt.clone());

		if spec.max_calls > 0 && issued >= spec.max_calls {
			return StopReason::MaxCalls;
		}
	}
}

/// How a per-call task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallEnd {
	Finished,
	/// Cut off by the end of the run before it finished
	Abandoned,
}

/// Run one call on its own task, bounded by the call timeout.
///
/// The call task and the timer race on a [`CallState`]; whichever finishes
/// it first produces the single result. A panic inside the call becomes a
/// call error. When `halt` fires the call is aborted and produces nothing.
fn spawn_call<C: Caller>(
	calls: &mut JoinSet<CallEnd>,
	shared: Arc<Shared<C>>,
	caller: Arc<C>,
	results: mpsc::Sender<CallResult>,
	ticket: Ticket,
	mut halt: watch::Receiver<bool>,
) {
	let timeout = shared.spec.timeout;
	calls.spawn(async move {
		let _ticket = ticket;
		let state = Arc::new(CallState::new());
		let started = Instant::now();
		let mut call = tokio::spawn(execute_call(caller, Arc::clone(&state), timeout));

		let raced = tokio::select! {
			biased;
			_ = halt.changed() => None,
			raced = tokio::time::timeout(timeout, &mut call) => Some(raced),
		};
		let joined = match raced {
			None => {
				call.abort();
				// Wait for the call to drop its caller handle
				let _ = call.await;
				return CallEnd::Abandoned;
			}
			Some(Ok(joined)) => joined,
			Some(Err(_)) => {
				if state.try_finish(Finish::TimedOut) {
					call.abort();
					shared.report_result(&results, CallResult::timeout(state.request_id(), timeout));
					return CallEnd::Finished;
				}
				// Completion won the race; its result is about to land
				call.await
			}
		};

		match joined {
			Ok(Some(result)) => shared.report_result(&results, result),
			Ok(None) => {}
			Err(e) if e.is_panic() => {
				if state.try_finish(Finish::Failed) {
					let message = format!("call panicked: {}", panic_message(e.into_panic()));
					warn!(id = ?state.request_id(), "{}", message);
					let result = CallResult::call_error(state.request_id(), message, started.elapsed());
					shared.report_result(&results, result);
				}
			}
			Err(_) => {}
		}
		CallEnd::Finished
	});
}

async fn execute_call<C: Caller>(caller: Arc<C>, state: Arc<CallState>, timeout: Duration) -> Option<CallResult> {
	let request = match caller.build_request() {
		Ok(request) => request,
		Err(e) => {
			return state
				.try_finish(Finish::Failed)
				.then(|| CallResult::call_error(None, format!("build failed: {}", e), Duration::ZERO));
		}
	};
	state.set_request_id(request.id);

	let started = Instant::now();
	let outcome = caller.execute(&request, timeout).await;
	let elapsed = started.elapsed();

	match outcome {
		// Sent only; a receiver tallies the reply
		Ok(None) => {
			state.try_finish(Finish::Completed);
			None
		}
		Ok(Some(payload)) => {
			let response = RawResponse {
				id: request.id,
				payload,
				elapsed,
			};
			let result = caller.classify_response(&request, &response);
			state.try_finish(Finish::Completed).then_some(result)
		}
		Err(LoaderError::Timeout(_)) => state
			.try_finish(Finish::TimedOut)
			.then(|| CallResult::timeout(Some(request.id), timeout)),
		Err(e) => state
			.try_finish(Finish::Failed)
			.then(|| CallResult::call_error(Some(request.id), e.to_string(), elapsed)),
	}
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		return message.to_string();
	}
	match payload.downcast::<String>() {
		Ok(message) => *message,
		Err(_) => "unknown panic payload".to_string(),
	}
}

/// Drain the result channel into `stats` until told to stop, then take
/// whatever is still buffered.
async fn collect_results(
	mut results: mpsc::Receiver<CallResult>,
	stats: Arc<StatsAggregator>,
	mut stop: oneshot::Receiver<()>,
) {
	loop {
		tokio::select! {
			biased;
			received = results.recv() => match received {
				Some(result) => stats.record(&result),
				None => break,
			},
			_ = &mut stop => break,
		}
	}
	results.close();
	while let Some(result) = results.recv().await {
		stats.record(&result);
	}
}

/// Tally reply codes read from one connection until halted.
async fn receive_replies(conn: Arc<Connection>, stats: Arc<StatsAggregator>, mut halt: watch::Receiver<bool>) {
	let mut buf = vec![0u8; MAX_MESSAGE_LEN];
	loop {
		tokio::select! {
			biased;
			_ = halt.changed() => break,
			read = conn.recv_message(&mut buf) => match read {
				Ok(n) => match response_code(&buf[..n]) {
					Some(rcode) => stats.record_rcode(rcode),
					None => debug!(len = n, "reply too short to classify"),
				},
				// ICMP errors surface on connected UDP sockets; keep reading
				Err(e) if conn.protocol() == Protocol::Udp => debug!(error = %e, "udp receive failed"),
				Err(e) => {
					warn!(error = %e, "tcp receive failed, receiver exiting");
					break;
				}
			},
		}
	}
}

async fn log_progress<C>(shared: Arc<Shared<C>>) {
	let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
	// First tick completes immediately
	ticker.tick().await;
	loop {
		ticker.tick().await;
		info!(
			status = %shared.status(),
			calls = shared.call_count.load(Ordering::Acquire),
			"progress",
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::caller::{RawRequest, ResultCode};
	use crate::dns::QueryOptions;
	use crate::dns_caller::{DnsCaller, DnsCallerOptions, ReadMode};
	use crate::json_tcp::{ArithServer, JsonTcpCaller};
	use crate::rcode::Rcode;
	use crate::testutil::{tcp_responder, udp_responder};

	#[derive(Debug, Clone, Copy)]
	enum Behaviour {
		Answer(Rcode),
		SendOnly,
		Fail,
		Panic,
		Hang,
		/// Panics when the engine asks for its connections
		BrokenConnections,
	}

	struct MockCaller {
		behaviour: Behaviour,
		next_id: AtomicU64,
	}

	impl MockCaller {
		fn new(behaviour: Behaviour) -> Arc<Self> {
			Arc::new(MockCaller {
				behaviour,
				next_id: AtomicU64::new(1),
			})
		}
	}

	impl Caller for MockCaller {
		fn build_request(&self) -> Result<RawRequest> {
			Ok(RawRequest {
				id: self.next_id.fetch_add(1, Ordering::Relaxed),
				payload: vec![0u8; 12],
			})
		}

		async fn execute(&self, request: &RawRequest, _timeout: Duration) -> Result<Option<Vec<u8>>> {
			match self.behaviour {
				Behaviour::Answer(rcode) => {
					let mut reply = request.payload.clone();
					reply[2] |= 0x80;
					reply[3] = rcode.value();
					Ok(Some(reply))
				}
				Behaviour::SendOnly | Behaviour::BrokenConnections => Ok(None),
				Behaviour::Fail => Err(LoaderError::Transport(std::io::Error::new(
					std::io::ErrorKind::ConnectionRefused,
					"refused",
				))),
				Behaviour::Panic => panic!("caller exploded"),
				Behaviour::Hang => {
					tokio::time::sleep(Duration::from_secs(3600)).await;
					Ok(None)
				}
			}
		}

		fn classify_response(&self, request: &RawRequest, response: &RawResponse) -> CallResult {
			match response_code(&response.payload) {
				Some(rcode) => CallResult::new(request.id, ResultCode::Response(rcode), response.elapsed),
				None => CallResult::new(request.id, ResultCode::MalformedResponse, response.elapsed),
			}
		}

		fn connections(&self) -> Vec<Arc<Connection>> {
			if let Behaviour::BrokenConnections = self.behaviour {
				panic!("connection table corrupted");
			}
			Vec::new()
		}
	}

	fn spec(behaviour: Behaviour) -> RunSpec<MockCaller> {
		RunSpec {
			qps: 1000,
			duration: Duration::from_secs(10),
			drain_grace: Duration::from_millis(100),
			..RunSpec::new(MockCaller::new(behaviour))
		}
	}

	fn assert_conserved(report: &Report) {
		assert_eq!(
			report.issued,
			report.success + report.errors + report.timeouts + report.unknown,
			"{:?}", report,
		);
	}

	async fn run_to_end<C: Caller>(spec: RunSpec<C>) -> Report {
		let generator = LoadGenerator::new(spec);
		assert!(generator.start());
		tokio::time::timeout(Duration::from_secs(20), generator.wait())
			.await
			.expect("run should finish")
			.expect("finished run has a report")
	}

	#[test]
	fn test_validate_reports_every_problem() {
		let mut spec = spec(Behaviour::SendOnly);
		spec.caller = None;
		spec.timeout = Duration::ZERO;
		spec.duration = Duration::ZERO;
		let err = spec.validate().unwrap_err().to_string();
		assert!(err.contains("caller"));
		assert!(err.contains("timeout"));
		assert!(err.contains("duration"));
	}

	#[test]
	fn test_ticket_pool_size() {
		let mut spec = spec(Behaviour::SendOnly);
		spec.qps = 100;
		spec.timeout = Duration::from_secs(1);
		assert_eq!(spec.ticket_pool_size(), 101);
		spec.qps = 0;
		assert_eq!(spec.ticket_pool_size(), DEFAULT_POOL_SIZE);
		spec.concurrency = 8;
		assert_eq!(spec.ticket_pool_size(), 8);
	}

	#[test]
	fn test_start_without_runtime_fails() {
		let generator = LoadGenerator::new(spec(Behaviour::SendOnly));
		assert!(!generator.start());
		assert_eq!(generator.status(), Status::Stopped);
	}

	#[tokio::test]
	async fn test_invalid_spec_never_starts() {
		let mut spec = spec(Behaviour::SendOnly);
		spec.duration = Duration::ZERO;
		let generator = LoadGenerator::new(spec);
		assert!(!generator.start());
		assert_eq!(generator.status(), Status::Stopped);
		assert_eq!(generator.call_count(), 0);
	}

	#[tokio::test]
	async fn test_idle_generator() {
		let generator = LoadGenerator::new(spec(Behaviour::SendOnly));
		assert_eq!(generator.status(), Status::Stopped);
		assert_eq!(generator.call_count(), 0);
		assert!(generator.report().is_none());
		assert!(!generator.stop().await);
		assert_eq!(Status::Running.to_string(), "running");
	}

	#[tokio::test]
	async fn test_start_then_stop_converges() {
		let mut spec = spec(Behaviour::SendOnly);
		spec.duration = Duration::from_secs(60);
		spec.drain_grace = Duration::ZERO;
		let generator = LoadGenerator::new(spec);
		assert!(generator.start());
		assert_eq!(generator.status(), Status::Running);
		assert!(!generator.start(), "second start must fail while running");

		let stopped = tokio::time::timeout(Duration::from_secs(5), generator.stop()).await;
		assert!(matches!(stopped, Ok(true)));
		assert_eq!(generator.status(), Status::Stopped);
		let report = generator.report().unwrap();
		assert_conserved(&report);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_only_one_stop_wins() {
		let mut spec = spec(Behaviour::SendOnly);
		spec.duration = Duration::from_secs(60);
		let generator = LoadGenerator::new(spec);
		assert!(generator.start());

		let stops: Vec<_> = (0..8)
			.map(|_| {
				let generator = generator.clone();
				tokio::spawn(async move { generator.stop().await })
			})
			.collect();
		let mut wins = 0;
		for stop in stops {
			if stop.await.unwrap() {
				wins += 1;
			}
		}
		assert_eq!(wins, 1);
		assert_eq!(generator.status(), Status::Stopped);
	}

	#[tokio::test]
	async fn test_max_calls_stops_early() {
		let mut spec = spec(Behaviour::Answer(Rcode::NoError));
		spec.max_calls = 5;
		let started = Instant::now();
		let report = run_to_end(spec).await;
		assert_eq!(report.issued, 5);
		assert_eq!(report.success, 5);
		assert!(started.elapsed() < Duration::from_secs(5));
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_paced_run_issues_expected_calls() {
		let mut spec = spec(Behaviour::SendOnly);
		spec.qps = 10;
		spec.duration = Duration::from_secs(1);
		spec.drain_grace = Duration::ZERO;
		let report = run_to_end(spec).await;
		assert!((9..=11).contains(&report.issued), "issued {}", report.issued);
		// Nobody reads replies for send-only calls
		assert_eq!(report.unknown, report.issued);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_restart_resets_counters() {
		let mut spec = spec(Behaviour::Answer(Rcode::NoError));
		spec.max_calls = 3;
		let generator = LoadGenerator::new(spec);
		for _ in 0..2 {
			assert!(generator.start());
			let report = generator.wait().await.unwrap();
			assert_eq!(report.issued, 3);
			assert_eq!(report.success, 3);
		}
	}

	#[tokio::test]
	async fn test_panicking_caller_is_recovered() {
		let mut spec = spec(Behaviour::Panic);
		spec.max_calls = 3;
		let report = run_to_end(spec).await;
		assert_eq!(report.issued, 3);
		assert_eq!(report.errors, 3);
		assert_eq!(report.responses["CallError"], 3);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_transport_failure_is_call_error() {
		let mut spec = spec(Behaviour::Fail);
		spec.max_calls = 4;
		let report = run_to_end(spec).await;
		assert_eq!(report.responses["CallError"], 4);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_slow_call_times_out_once() {
		let mut spec = spec(Behaviour::Hang);
		spec.max_calls = 1;
		spec.timeout = Duration::from_millis(50);
		spec.drain_grace = Duration::from_millis(300);
		let report = run_to_end(spec).await;
		assert_eq!(report.issued, 1);
		assert_eq!(report.timeouts, 1);
		assert_eq!(report.responses["Timeout"], 1);
		assert_eq!(report.unknown, 0);
	}

	#[tokio::test]
	async fn test_concurrency_bounds_in_flight_calls() {
		let mut spec = spec(Behaviour::Hang);
		spec.qps = 0;
		spec.concurrency = 2;
		spec.timeout = Duration::from_millis(200);
		spec.duration = Duration::from_millis(100);
		spec.drain_grace = Duration::ZERO;
		let report = run_to_end(spec).await;
		// Both tickets stay held for the whole run
		assert_eq!(report.issued, 2);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_dns_receiver_mode_end_to_end() {
		let target = udp_responder(3).await;
		let caller = DnsCaller::connect(DnsCallerOptions {
			target,
			protocol: Protocol::Udp,
			clients: 2,
			read_mode: ReadMode::Receiver,
			query: QueryOptions {
				random_length: 8,
				..QueryOptions::new("example.com")
			},
			dial_timeout: Duration::from_secs(1),
		})
		.await
		.unwrap();
		let spec = RunSpec {
			qps: 200,
			max_calls: 20,
			drain_grace: Duration::from_millis(300),
			..RunSpec::new(Arc::new(caller))
		};
		let report = run_to_end(spec).await;
		assert_eq!(report.issued, 20);
		assert!(report.responses.get("NXDOMAIN").copied().unwrap_or(0) >= 18);
		assert_eq!(report.success, 0);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_dns_inline_tcp_end_to_end() {
		let target = tcp_responder(0).await;
		let caller = DnsCaller::connect(DnsCallerOptions {
			target,
			protocol: Protocol::Tcp,
			clients: 1,
			read_mode: ReadMode::Inline,
			query: QueryOptions::new("example.org"),
			dial_timeout: Duration::from_secs(1),
		})
		.await
		.unwrap();
		let spec = RunSpec {
			qps: 100,
			max_calls: 10,
			concurrency: 1,
			drain_grace: Duration::from_millis(200),
			..RunSpec::new(Arc::new(caller))
		};
		let report = run_to_end(spec).await;
		assert_eq!(report.success, 10);
		assert!(report.latency.is_some());
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_json_tcp_end_to_end() {
		let server = ArithServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
		let caller = JsonTcpCaller::new(server.local_addr(), Some(11));
		let spec = RunSpec {
			qps: 200,
			max_calls: 10,
			drain_grace: Duration::from_millis(300),
			..RunSpec::new(Arc::new(caller))
		};
		let report = run_to_end(spec).await;
		assert_eq!(report.issued, 10);
		// Operands are never zero, so every call succeeds
		assert_eq!(report.success, 10);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_extreme_qps_still_stops() {
		let mut spec = spec(Behaviour::Hang);
		spec.qps = u32::MAX;
		spec.concurrency = 4;
		spec.timeout = Duration::from_secs(60);
		spec.duration = Duration::from_secs(60);
		spec.drain_grace = Duration::ZERO;
		spec.validate().unwrap();
		let generator = LoadGenerator::new(spec);
		assert!(generator.start());
		tokio::time::sleep(Duration::from_millis(50)).await;

		let stopped = tokio::time::timeout(Duration::from_secs(5), generator.stop()).await;
		assert!(matches!(stopped, Ok(true)));
		assert_eq!(generator.status(), Status::Stopped);
		assert_eq!(generator.call_count(), 4);
	}

	#[tokio::test]
	async fn test_panicking_run_ends_stopped() {
		let generator = LoadGenerator::new(spec(Behaviour::BrokenConnections));
		assert!(generator.start());
		let report = tokio::time::timeout(Duration::from_secs(5), generator.wait())
			.await
			.expect("a crashed run must still reach stopped");
		assert!(report.is_none());
		assert_eq!(generator.status(), Status::Stopped);
		assert!(!generator.stop().await);
	}

	#[tokio::test]
	async fn test_stop_releases_in_flight_calls() {
		let caller = MockCaller::new(Behaviour::Hang);
		let spec = RunSpec {
			qps: 1000,
			concurrency: 4,
			timeout: Duration::from_secs(60),
			duration: Duration::from_secs(60),
			..RunSpec::new(Arc::clone(&caller))
		};
		// This handle plus the one in the spec
		assert_eq!(Arc::strong_count(&caller), 2);

		let generator = LoadGenerator::new(spec);
		assert!(generator.start());
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(generator.call_count(), 4);
		assert!(Arc::strong_count(&caller) > 2);

		assert!(generator.stop().await);
		assert_eq!(Arc::strong_count(&caller), 2);
		let report = generator.report().unwrap();
		assert_eq!(report.issued, 4);
		assert_eq!(report.unknown, 4);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_full_result_channel_drops_without_blocking() {
		let generator = LoadGenerator::new(spec(Behaviour::SendOnly));
		let shared = &generator.shared;
		shared.set_status(Status::Running);
		let (tx, mut rx) = mpsc::channel(1);
		for id in 0..100 {
			shared.report_result(&tx, CallResult::new(id, ResultCode::Timeout, Duration::ZERO));
		}
		assert_eq!(rx.try_recv().unwrap().id, Some(0));
		assert!(rx.try_recv().is_err());

		shared.set_status(Status::Stopped);
		shared.report_result(&tx, CallResult::new(100, ResultCode::Timeout, Duration::ZERO));
		assert!(rx.try_recv().is_err(), "stopped runs take no results");
	}

	#[tokio::test]
	async fn test_tiny_result_channel_keeps_pace() {
		let mut spec = spec(Behaviour::Answer(Rcode::NoError));
		spec.qps = 100;
		spec.duration = Duration::from_secs(1);
		spec.result_capacity = 1;
		let report = run_to_end(spec).await;
		assert!((95..=105).contains(&report.issued), "issued {}", report.issued);
		// Whatever the collector missed is unaccounted, never lost
		assert_eq!(report.success + report.unknown, report.issued);
		assert_conserved(&report);
	}

	#[tokio::test]
	async fn test_dns_receiver_mode_over_tcp() {
		let target = tcp_responder(2).await;
		let caller = DnsCaller::connect(DnsCallerOptions {
			target,
			protocol: Protocol::Tcp,
			clients: 2,
			read_mode: ReadMode::Receiver,
			query: QueryOptions {
				random_length: 5,
				..QueryOptions::new("example.net")
			},
			dial_timeout: Duration::from_secs(1),
		})
		.await
		.unwrap();
		let spec = RunSpec {
			qps: 200,
			max_calls: 20,
			drain_grace: Duration::from_millis(300),
			..RunSpec::new(Arc::new(caller))
		};
		let report = run_to_end(spec).await;
		assert_eq!(report.issued, 20);
		assert_eq!(report.responses.get("ServerFailure").copied(), Some(20));
		assert_eq!(report.errors, 20);
		assert_eq!(report.unknown, 0);
		assert_conserved(&report);
	}
}
