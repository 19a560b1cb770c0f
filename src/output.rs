use std::net::SocketAddr;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use dns_loader::config::JobConfig;
use dns_loader::stats::Report;

/// Print the job before it starts.
pub fn print_job_summary(job: &JobConfig, target: SocketAddr) {
	println!("DNS Load Job");
	println!("============");
	println!("Server:         {} ({})", target, job.protocol);
	if job.domain_random_length > 0 {
		println!("Domain:         <{} random>.{}", job.domain_random_length, job.domain);
	} else {
		println!("Domain:         {}", job.domain);
	}
	let query_type = if job.query_type.trim().is_empty() { "random" } else { job.query_type.as_str() };
	println!("Query type:     {}", query_type);
	println!("EDNS / DNSSEC:  {} / {}", yes_no(job.edns), yes_no(job.dnssec));
	if job.qps == 0 {
		println!("QPS:            unpaced");
	} else {
		println!("QPS:            {}", job.qps);
	}
	println!("Duration:       {} s", job.duration_secs);
	if job.max_query > 0 {
		println!("Max queries:    {}", job.max_query);
	}
	println!("Timeout:        {} ms", job.timeout_ms);
	println!("Clients:        {} ({} read)", job.client_number, job.read_mode);
	if let Some(seed) = job.seed {
		println!("Seed:           {}", seed);
	}
	println!();
}

fn yes_no(flag: bool) -> &'static str {
	if flag { "yes" } else { "no" }
}

fn share(count: u64, issued: u64) -> String {
	if issued == 0 {
		return "-".to_string();
	}
	format!("{:.2}%", count as f64 * 100.0 / issued as f64)
}

/// Rows of the result table: every label seen plus the unknown bucket.
fn result_rows(report: &Report) -> Vec<(String, u64)> {
	let mut rows: Vec<(String, u64)> = report.responses
		.iter()
		.map(|(label, count)| (label.clone(), *count))
		.collect();
	rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
	rows.push(("Unknown".to_string(), report.unknown));
	rows
}

/// Print the final report as tables.
pub fn print_report(report: &Report) {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["Result", "Count", "Share"]);
	for (label, count) in result_rows(report) {
		table.add_row(vec![label, count.to_string(), share(count, report.issued)]);
	}

	println!("\nRun Results");
	println!("===========\n");
	println!("Issued:         {}", report.issued);
	println!("Elapsed:        {:.3} s", report.elapsed().as_secs_f64());
	println!("Achieved QPS:   {:.1}", report.achieved_qps);
	println!(
		"Success / errors / timeouts / unknown:  {} / {} / {} / {}",
		report.success, report.errors, report.timeouts, report.unknown,
	);
	println!("{table}");

	if let Some(latency) = &report.latency {
		let mut table = Table::new();
		table.load_preset(UTF8_FULL);
		table.set_header(vec!["Samples", "Min", "p50", "p95", "p99", "Max", "Mean", "Stddev"]);
		table.add_row(vec![
			latency.samples.to_string(),
			format!("{:.2} ms", latency.min_ms),
			format!("{:.2} ms", latency.p50_ms),
			format!("{:.2} ms", latency.p95_ms),
			format!("{:.2} ms", latency.p99_ms),
			format!("{:.2} ms", latency.max_ms),
			format!("{:.2} ms", latency.mean_ms),
			format!("{:.2} ms", latency.stddev_ms),
		]);
		println!("\nLatency");
		println!("{table}");
	}
}

/// Write per-result counts to a CSV file.
pub fn write_csv(path: &str, report: &Report) -> Result<()> {
	let mut writer = csv::Writer::from_path(path)?;
	writer.write_record(["result", "count", "percent", "issued", "elapsed_ms"])?;
	for (label, count) in result_rows(report) {
		let percent = if report.issued == 0 {
			String::new()
		} else {
			format!("{:.2}", count as f64 * 100.0 / report.issued as f64)
		};
		writer.write_record([
			label,
			count.to_string(),
			percent,
			report.issued.to_string(),
			report.elapsed_ms.to_string(),
		])?;
	}
	writer.flush()?;
	println!("\nResults written to: {}", path);
	Ok(())
}

#[derive(Serialize)]
struct JsonReport<'a> {
	job: &'a JobConfig,
	report: &'a Report,
}

/// Write the job and its report as one JSON document.
pub fn write_json(path: &str, job: &JobConfig, report: &Report) -> Result<()> {
	let file = std::fs::File::create(path)?;
	serde_json::to_writer_pretty(file, &JsonReport { job, report })?;
	println!("Report written to: {}", path);
	Ok(())
}
