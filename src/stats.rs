use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::caller::{CallResult, ResultCode};
use crate::rcode::Rcode;

/// Latency samples kept per run; later samples are counted but not stored
pub const MAX_LATENCY_SAMPLES: usize = 1_000_000;

/// Calculate the p-th percentile from a sorted slice using nearest-rank method.
///
/// Returns None if the slice is empty.
pub fn percentile(sorted_values: &[f64], p: f64) -> Option<f64> {
	if sorted_values.is_empty() {
		return None;
	}
	let n = sorted_values.len();
	// rank = ceil(p/100 * N), kept within [1, N]
	let rank = ((p / 100.0) * n as f64).ceil() as usize;
	let rank = rank.clamp(1, n);
	Some(sorted_values[rank - 1])
}

/// Arithmetic mean of a slice of values.
pub fn mean(values: &[f64]) -> Option<f64> {
	if values.is_empty() {
		return None;
	}
	let sum: f64 = values.iter().sum();
	Some(sum / values.len() as f64)
}

/// Population standard deviation of a slice of values.
pub fn stddev(values: &[f64]) -> Option<f64> {
	let avg = mean(values)?;
	let variance = values.iter()
		.map(|v| (v - avg).powi(2))
		.sum::<f64>() / values.len() as f64;
	Some(variance.sqrt())
}

/// Latency distribution of the calls that got a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
	pub samples: usize,
	pub min_ms: f64,
	pub p50_ms: f64,
	pub p95_ms: f64,
	pub p99_ms: f64,
	pub max_ms: f64,
	pub mean_ms: f64,
	pub stddev_ms: f64,
}

impl LatencySummary {
	/// Summarize `latencies_ms`; None when there are no samples.
	pub fn from_samples(latencies_ms: &[f64]) -> Option<Self> {
		if latencies_ms.is_empty() {
			return None;
		}
		let mut sorted = latencies_ms.to_vec();
		sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

		Some(LatencySummary {
			samples: sorted.len(),
			min_ms: sorted[0],
			p50_ms: percentile(&sorted, 50.0).unwrap_or(0.0),
			p95_ms: percentile(&sorted, 95.0).unwrap_or(0.0),
			p99_ms: percentile(&sorted, 99.0).unwrap_or(0.0),
			max_ms: sorted[sorted.len() - 1],
			mean_ms: mean(&sorted).unwrap_or(0.0),
			stddev_ms: stddev(&sorted).unwrap_or(0.0),
		})
	}
}

/// Final figures of one run.
///
/// `issued == success + errors + timeouts + unknown` holds for every
/// report built by [`StatsAggregator::report`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
	/// Calls started by the pacing loop
	pub issued: u64,
	/// Wall time of the pacing phase
	pub elapsed_ms: u64,
	/// Count per result label: rcode names plus engine outcomes
	pub responses: BTreeMap<String, u64>,
	pub success: u64,
	/// Non-success rcodes, call errors and protocol mismatches
	pub errors: u64,
	pub timeouts: u64,
	/// Issued calls that no result accounts for
	pub unknown: u64,
	pub achieved_qps: f64,
	pub latency: Option<LatencySummary>,
}

impl Report {
	pub fn accounted(&self) -> u64 {
		self.success + self.errors + self.timeouts
	}

	pub fn elapsed(&self) -> Duration {
		Duration::from_millis(self.elapsed_ms)
	}
}

/// Collects outcomes from result consumers and receiver loops.
///
/// Every counter is atomic so receivers, the collector and report readers
/// never contend on a lock. Only latency samples sit behind a mutex.
#[derive(Debug, Default)]
pub struct StatsAggregator {
	rcodes: [AtomicU64; 16],
	timeouts: AtomicU64,
	call_errors: AtomicU64,
	malformed: AtomicU64,
	id_mismatches: AtomicU64,
	server_errors: AtomicU64,
	latencies_ms: Mutex<Vec<f64>>,
}

impl StatsAggregator {
	pub fn new() -> Self {
		StatsAggregator::default()
	}

	/// Count a reply code read straight off the wire.
	pub fn record_rcode(&self, rcode: Rcode) {
		self.rcodes[rcode.value() as usize].fetch_add(1, Ordering::Relaxed);
	}

	/// Count one classified call result.
	pub fn record(&self, result: &CallResult) {
		let counter = match result.code {
			ResultCode::Response(rcode) => &self.rcodes[rcode.value() as usize],
			ResultCode::Timeout => &self.timeouts,
			ResultCode::CallError => &self.call_errors,
			ResultCode::MalformedResponse => &self.malformed,
			ResultCode::IdMismatch => &self.id_mismatches,
			ResultCode::ServerError => &self.server_errors,
		};
		counter.fetch_add(1, Ordering::Relaxed);

		// Only calls that got a reply have a meaningful latency
		if !matches!(result.code, ResultCode::Timeout | ResultCode::CallError) {
			let mut samples = self.latencies_ms.lock();
			if samples.len() < MAX_LATENCY_SAMPLES {
				samples.push(result.elapsed.as_secs_f64() * 1000.0);
			}
		}
	}

	/// Replies tallied for `rcode` so far.
	pub fn rcode_count(&self, rcode: Rcode) -> u64 {
		self.rcodes[rcode.value() as usize].load(Ordering::Relaxed)
	}

	/// Build the final report for `issued` calls over `elapsed`.
	///
	/// Pure read of the counters; the aggregator keeps counting afterwards.
	pub fn report(&self, issued: u64, elapsed: Duration) -> Report {
		let mut responses = BTreeMap::new();
		let mut success = 0;
		let mut errors = 0;
		for (value, counter) in self.rcodes.iter().enumerate() {
			let count = counter.load(Ordering::Relaxed);
			if count == 0 {
				continue;
			}
			let rcode = Rcode::from_nibble(value as u8);
			responses.insert(rcode.name().to_string(), count);
			if rcode == Rcode::NoError {
				success += count;
			} else {
				errors += count;
			}
		}

		let timeouts = self.timeouts.load(Ordering::Relaxed);
		let engine_counts = [
			(ResultCode::Timeout, timeouts),
			(ResultCode::CallError, self.call_errors.load(Ordering::Relaxed)),
			(ResultCode::MalformedResponse, self.malformed.load(Ordering::Relaxed)),
			(ResultCode::IdMismatch, self.id_mismatches.load(Ordering::Relaxed)),
			(ResultCode::ServerError, self.server_errors.load(Ordering::Relaxed)),
		];
		for (code, count) in engine_counts {
			if count == 0 {
				continue;
			}
			responses.insert(code.label().to_string(), count);
			if code != ResultCode::Timeout {
				errors += count;
			}
		}

		// Duplicate answers can outnumber issued calls. Buckets are clipped
		// so the totals still add up; `responses` keeps the raw counts.
		let success = success.min(issued);
		let errors = errors.min(issued - success);
		let timeouts = timeouts.min(issued - success - errors);
		let unknown = issued - success - errors - timeouts;

		let elapsed_secs = elapsed.as_secs_f64();
		let achieved_qps = if elapsed_secs > 0.0 {
			issued as f64 / elapsed_secs
		} else {
			0.0
		};

		Report {
			issued,
			elapsed_ms: elapsed.as_millis() as u64,
			responses,
			success,
			errors,
			timeouts,
			unknown,
			achieved_qps,
			latency: LatencySummary::from_samples(&self.latencies_ms.lock()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn result(code: ResultCode, elapsed_ms: u64) -> CallResult {
		CallResult::new(1, code, Duration::from_millis(elapsed_ms))
	}

	#[test]
	fn test_percentile_basic() {
		let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
		assert_eq!(percentile(&values, 50.0), Some(5.0));
		assert_eq!(percentile(&values, 95.0), Some(10.0));
		assert_eq!(percentile(&values, 10.0), Some(1.0));
	}

	#[test]
	fn test_percentile_empty_and_single() {
		assert_eq!(percentile(&[], 50.0), None);
		assert_eq!(percentile(&[42.0], 50.0), Some(42.0));
		assert_eq!(percentile(&[42.0], 99.0), Some(42.0));
	}

	#[test]
	fn test_mean_and_stddev() {
		assert_eq!(mean(&[1.0, 2.0, 3.0, 4.0, 5.0]), Some(3.0));
		let sd = stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
		assert!((sd - 2.0).abs() < 0.01);
		assert_eq!(stddev(&[]), None);
	}

	#[test]
	fn test_latency_summary() {
		let summary = LatencySummary::from_samples(&[4.0, 1.0, 3.0, 2.0]).unwrap();
		assert_eq!(summary.samples, 4);
		assert_eq!(summary.min_ms, 1.0);
		assert_eq!(summary.max_ms, 4.0);
		assert_eq!(summary.p50_ms, 2.0);
		assert_eq!(summary.mean_ms, 2.5);
		assert!(LatencySummary::from_samples(&[]).is_none());
	}

	#[test]
	fn test_report_buckets() {
		let stats = StatsAggregator::new();
		stats.record(&result(ResultCode::Response(Rcode::NoError), 2));
		stats.record(&result(ResultCode::Response(Rcode::NoError), 4));
		stats.record(&result(ResultCode::Response(Rcode::NameError), 3));
		stats.record(&result(ResultCode::Timeout, 1000));
		stats.record(&result(ResultCode::CallError, 0));
		stats.record(&result(ResultCode::IdMismatch, 5));
		stats.record_rcode(Rcode::Refused);

		let report = stats.report(10, Duration::from_secs(2));
		assert_eq!(report.success, 2);
		assert_eq!(report.errors, 4);
		assert_eq!(report.timeouts, 1);
		assert_eq!(report.unknown, 3);
		assert_eq!(report.responses["Success"], 2);
		assert_eq!(report.responses["NXDOMAIN"], 1);
		assert_eq!(report.responses["Refused"], 1);
		assert_eq!(report.responses["Timeout"], 1);
		assert_eq!(report.responses["CallError"], 1);
		assert_eq!(report.responses["IdMismatch"], 1);
		assert!(!report.responses.contains_key("ServerFailure"));
		assert_eq!(report.achieved_qps, 5.0);

		// Timeouts and call errors carry no latency
		let latency = report.latency.unwrap();
		assert_eq!(latency.samples, 4);
		assert_eq!(latency.max_ms, 5.0);
	}

	#[test]
	fn test_conservation_holds() {
		let stats = StatsAggregator::new();
		for i in 0..37u64 {
			match i % 4 {
				0 => stats.record(&result(ResultCode::Response(Rcode::NoError), 1)),
				1 => stats.record(&result(ResultCode::Timeout, 1)),
				2 => stats.record_rcode(Rcode::ServerFailure),
				_ => {}
			}
		}
		for issued in [0u64, 10, 28, 37, 100] {
			let report = stats.report(issued, Duration::from_secs(1));
			assert_eq!(
				report.issued,
				report.success + report.errors + report.timeouts + report.unknown,
				"issued {}", issued,
			);
		}
	}

	#[test]
	fn test_duplicate_answers_do_not_underflow() {
		let stats = StatsAggregator::new();
		for _ in 0..5 {
			stats.record_rcode(Rcode::NameError);
		}
		let report = stats.report(3, Duration::from_secs(1));
		assert_eq!(report.unknown, 0);
		assert_eq!(report.accounted(), 3);
	}

	#[test]
	fn test_zero_elapsed_qps() {
		let report = StatsAggregator::new().report(0, Duration::ZERO);
		assert_eq!(report.achieved_qps, 0.0);
		assert!(report.latency.is_none());
		assert_eq!(report.unknown, 0);
	}
}
